//! Difficulty and compact target utilities.

use primitive_types::U256;
use trunkd_consensus::{ChainParams, Hash256};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifficultyError {
    EmptyChain,
    NonContiguous,
    Compact(CompactError),
}

impl std::fmt::Display for DifficultyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DifficultyError::EmptyChain => write!(f, "no headers available"),
            DifficultyError::NonContiguous => {
                write!(f, "header list must be contiguous by height")
            }
            DifficultyError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for DifficultyError {}

impl From<CompactError> for DifficultyError {
    fn from(err: CompactError) -> Self {
        DifficultyError::Compact(err)
    }
}

/// The slice of header fields difficulty adjustment needs.
#[derive(Clone, Copy, Debug)]
pub struct HeaderInfo {
    pub height: i32,
    pub time: i64,
    pub bits: u32,
}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    let negative = (bits & 0x0080_0000) != 0;

    if negative {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        let shift = 8 * (3 - size);
        word >>= shift;
        U256::from(word)
    } else {
        let shift = 8 * (size - 3);
        U256::from(word) << shift
    };

    if word != 0 {
        let overflow = size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
    }

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact: u32;

    if size <= 3 {
        compact = value.low_u32() << (8 * (3 - size));
    } else {
        let shift = 8 * (size - 3);
        compact = (value >> shift).low_u32();
    }

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

pub fn compact_to_target(bits: u32) -> Result<Hash256, CompactError> {
    let value = compact_to_u256(bits)?;
    Ok(value.to_little_endian())
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    let value = U256::from_little_endian(target);
    u256_to_compact(value)
}

pub fn hash_meets_target(hash: &Hash256, target: &Hash256) -> bool {
    let hash_value = U256::from_little_endian(hash);
    let target_value = U256::from_little_endian(target);
    hash_value <= target_value
}

/// Checks a header hash against its own claimed compact target, after
/// range-checking the target against the chain's proof-of-work limit.
pub fn check_proof_of_work(
    hash: &Hash256,
    bits: u32,
    params: &ChainParams,
) -> Result<bool, CompactError> {
    let target = compact_to_u256(bits)?;
    let pow_limit = U256::from_little_endian(&params.pow_limit);
    if target.is_zero() || target > pow_limit {
        return Ok(false);
    }
    Ok(U256::from_little_endian(hash) <= target)
}

/// Work contributed by a block at the given target, `~target / (target + 1) + 1`.
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    let one = U256::from(1u64);
    Ok((!target / (target + one)) + one)
}

/// Computes the required compact target for the block following `chain`.
///
/// The target is re-reviewed every `difficulty_review_interval` blocks; inside
/// an interval every block carries the previous target. `chain` must be a
/// contiguous tail of headers reaching back at least to the start of the
/// current review interval when a review is due.
pub fn next_work_required(
    chain: &[HeaderInfo],
    params: &ChainParams,
) -> Result<u32, DifficultyError> {
    let pow_limit_bits = target_to_compact(&params.pow_limit);
    let last = match chain.last() {
        Some(last) => last,
        None => return Ok(pow_limit_bits),
    };

    ensure_contiguous(chain)?;

    let interval = params.difficulty_review_interval;
    let next_height = last.height + 1;
    if next_height % interval != 0 {
        return Ok(last.bits);
    }

    let period_start_height = next_height - interval;
    let base_height = chain[0].height;
    if period_start_height < base_height {
        return Err(DifficultyError::EmptyChain);
    }
    let first = &chain[(period_start_height - base_height) as usize];

    let target_timespan = params.difficulty_review_timespan();
    let mut actual_timespan = last.time - first.time;
    // Dampen swings to a factor of four per review.
    if actual_timespan < target_timespan / 4 {
        actual_timespan = target_timespan / 4;
    }
    if actual_timespan > target_timespan * 4 {
        actual_timespan = target_timespan * 4;
    }

    let mut next = compact_to_u256(last.bits)?;
    next = next.saturating_mul(U256::from(actual_timespan as u64));
    next /= U256::from(target_timespan as u64);

    let pow_limit = U256::from_little_endian(&params.pow_limit);
    if next > pow_limit {
        next = pow_limit;
    }

    Ok(u256_to_compact(next))
}

fn ensure_contiguous(chain: &[HeaderInfo]) -> Result<(), DifficultyError> {
    let base = chain[0].height;
    for (idx, header) in chain.iter().enumerate() {
        if header.height != base + idx as i32 {
            return Err(DifficultyError::NonContiguous);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use trunkd_consensus::{chain_params, Network};

    fn make_chain(base_height: i32, count: usize, base_time: i64, spacing: i64) -> Vec<HeaderInfo> {
        (0..count)
            .map(|offset| HeaderInfo {
                height: base_height + offset as i32,
                time: base_time + (offset as i64) * spacing,
                bits: 0x1d00ffff,
            })
            .collect()
    }

    #[test]
    fn mid_interval_keeps_previous_bits() {
        let params = chain_params(Network::Mainnet);
        let chain = make_chain(0, 100, 1_231_006_505, 600);
        let bits = next_work_required(&chain, &params).expect("next work");
        assert_eq!(bits, 0x1d00ffff);
    }

    #[test]
    fn perfect_spacing_keeps_target() {
        let params = chain_params(Network::Mainnet);
        let chain = make_chain(0, 2016, 1_231_006_505, 600);
        let bits = next_work_required(&chain, &params).expect("next work");
        let before = compact_to_u256(0x1d00ffff).expect("target");
        let after = compact_to_u256(bits).expect("target");
        // Rounding in the compact form may drop the lowest bits.
        assert!(after <= before);
        assert!(after >= before - (before >> 8));
    }

    #[test]
    fn fast_blocks_raise_difficulty() {
        let params = chain_params(Network::Mainnet);
        let chain = make_chain(0, 2016, 1_231_006_505, 300);
        let bits = next_work_required(&chain, &params).expect("next work");
        let before = compact_to_u256(0x1d00ffff).expect("target");
        let after = compact_to_u256(bits).expect("target");
        assert!(after < before);
    }

    #[test]
    fn slow_blocks_are_clamped_to_four_times() {
        let params = chain_params(Network::Mainnet);
        // Twenty times slower than the schedule; the review clamps at 4x.
        let chain = make_chain(0, 2016, 1_231_006_505, 12_000);
        let bits = next_work_required(&chain, &params).expect("next work");
        let limit = U256::from_little_endian(&params.pow_limit);
        let after = compact_to_u256(bits).expect("target");
        assert!(after <= limit);
        let unclamped = compact_to_u256(0x1d00ffff).expect("target") * U256::from(20u64);
        assert!(after < unclamped);
    }

    #[test]
    fn non_contiguous_chain_rejected() {
        let params = chain_params(Network::Mainnet);
        let mut chain = make_chain(0, 2016, 1_231_006_505, 600);
        chain[100].height += 1;
        assert_eq!(
            next_work_required(&chain, &params),
            Err(DifficultyError::NonContiguous)
        );
    }

    #[test]
    fn block_proof_grows_with_difficulty() {
        let easy = block_proof(0x207fffff).expect("proof");
        let hard = block_proof(0x1d00ffff).expect("proof");
        assert!(hard > easy);
    }

    #[test]
    fn check_proof_of_work_rejects_above_limit_target() {
        let params = chain_params(Network::Mainnet);
        // Target above the proof-of-work limit is invalid regardless of hash.
        let ok = check_proof_of_work(&[0u8; 32], 0x2100ffff, &params).expect("range");
        assert!(!ok);
        let ok = check_proof_of_work(&[0u8; 32], 0x1d00ffff, &params).expect("range");
        assert!(ok);
    }
}

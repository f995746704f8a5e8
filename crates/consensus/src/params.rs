//! Chain parameter definitions.

use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: Hash256,
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub hash_genesis_block: Hash256,
    pub pow_limit: Hash256,
    /// Expected seconds between blocks.
    pub pow_target_spacing: i64,
    /// Blocks per difficulty review period.
    pub difficulty_review_interval: i32,
    pub subsidy_halving_interval: i32,
    /// When false (test configurations), a difficulty mismatch is tolerated.
    pub enforce_target: bool,
    /// When true (test configurations), coinbase outputs may be spent immediately.
    pub allow_immediate_coinbase_spend: bool,
    pub checkpoints: Vec<Checkpoint>,
}

impl ChainParams {
    pub fn difficulty_review_timespan(&self) -> i64 {
        self.difficulty_review_interval as i64 * self.pow_target_spacing
    }

    pub fn last_checkpoint_height(&self) -> i32 {
        self.checkpoints
            .iter()
            .map(|checkpoint| checkpoint.height)
            .max()
            .unwrap_or(0)
    }

    pub fn checkpoint_at(&self, height: i32) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .find(|checkpoint| checkpoint.height == height)
    }
}

#[derive(Debug)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

/// Parses a display-order (big-endian) hash string into internal
/// little-endian byte order.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let hex = input.trim();
    if hex.len() != 64 {
        return Err(HexError::InvalidLength);
    }
    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let chunk = &hex[i * 2..i * 2 + 2];
        *byte_out = u8::from_str_radix(chunk, 16).map_err(|_| HexError::InvalidHex)?;
    }
    bytes.reverse();
    Ok(bytes)
}

fn must_hash(input: &str) -> Hash256 {
    match hash256_from_hex(input) {
        Ok(hash) => hash,
        Err(_) => panic!("invalid built-in hash constant"),
    }
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => ChainParams {
            network,
            hash_genesis_block: must_hash(
                "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
            ),
            pow_limit: must_hash(
                "00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
            ),
            pow_target_spacing: 600,
            difficulty_review_interval: 2016,
            subsidy_halving_interval: 210_000,
            enforce_target: true,
            allow_immediate_coinbase_spend: false,
            checkpoints: vec![
                Checkpoint {
                    height: 11_111,
                    hash: must_hash(
                        "0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d",
                    ),
                },
                Checkpoint {
                    height: 105_000,
                    hash: must_hash(
                        "00000000000291ce28027faea320c8d2b054b2e0fe44a773f3eefb151d6bdc97",
                    ),
                },
                Checkpoint {
                    height: 134_444,
                    hash: must_hash(
                        "00000000000005b12ffd4cd315cd34ffd4a594f430ac814c91184a0d42d2b0fe",
                    ),
                },
                Checkpoint {
                    height: 168_000,
                    hash: must_hash(
                        "000000000000099e61ea72015e79632f216fe6cb33d7899acb35b75c8303b763",
                    ),
                },
            ],
        },
        Network::Testnet => ChainParams {
            network,
            hash_genesis_block: must_hash(
                "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943",
            ),
            pow_limit: must_hash(
                "00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
            ),
            pow_target_spacing: 600,
            difficulty_review_interval: 2016,
            subsidy_halving_interval: 210_000,
            enforce_target: true,
            allow_immediate_coinbase_spend: false,
            checkpoints: Vec::new(),
        },
        Network::Regtest => ChainParams {
            network,
            hash_genesis_block: must_hash(
                "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206",
            ),
            pow_limit: must_hash(
                "7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
            ),
            pow_target_spacing: 600,
            difficulty_review_interval: 2016,
            subsidy_halving_interval: 150,
            enforce_target: false,
            allow_immediate_coinbase_spend: true,
            checkpoints: Vec::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let hash = hash256_from_hex(
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
        )
        .expect("valid hex");
        // Internal order is little-endian: the display prefix zeros land at the end.
        assert_eq!(hash[31], 0x00);
        assert_eq!(hash[0], 0x6f);
    }

    #[test]
    fn hex_rejects_bad_input() {
        assert!(hash256_from_hex("abcd").is_err());
        assert!(hash256_from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn regtest_relaxes_rules() {
        let params = chain_params(Network::Regtest);
        assert!(!params.enforce_target);
        assert!(params.allow_immediate_coinbase_spend);
    }
}

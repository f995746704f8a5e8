//! Stateless validation helpers: merkle tree recomputation, script opcode
//! scanning for sigop counting, and the validation error type.

use std::fmt;

use trunkd_consensus::Hash256;
use trunkd_primitives::sha256d;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValidationErrorKind {
    UnknownParent,
    FutureTimestamp,
    TimestampBeforeMedian,
    OutdatedVersion,
    MissingHeightInCoinbase,
    BadDifficulty,
    BadProofOfWork,
    CheckpointMismatch,
    EmptyBlock,
    OversizedBlock,
    BadCoinbaseStructure,
    BadCoinbaseScriptLength,
    NonFinalTransaction,
    BadMerkleRoot,
    MutatedMerkleTree,
    DeepReorg,
    UnresolvedInput,
    Bip30Violation,
    EmptyInputs,
    EmptyOutputs,
    DuplicateInput,
    ValueOutOfRange,
    OutputsExceedInputs,
    ImmatureCoinbaseSpend,
    TooManySigops,
    ScriptFailure,
    RewardExceedsSubsidy,
    /// Backend or infrastructure failure wrapped into the one failure
    /// surface callers see; the cause is logged separately.
    Infrastructure(String),
}

impl ValidationErrorKind {
    fn as_str(&self) -> &str {
        match self {
            Self::UnknownParent => "previous block not known",
            Self::FutureTimestamp => "block timestamp too far in the future",
            Self::TimestampBeforeMedian => "block timestamp not after median time past",
            Self::OutdatedVersion => "block version rejected by super-majority",
            Self::MissingHeightInCoinbase => "coinbase does not push the block height",
            Self::BadDifficulty => "difficulty target does not match schedule",
            Self::BadProofOfWork => "block hash does not meet claimed target",
            Self::CheckpointMismatch => "block conflicts with checkpoint",
            Self::EmptyBlock => "block has no transactions",
            Self::OversizedBlock => "serialized block exceeds size limit",
            Self::BadCoinbaseStructure => "coinbase missing or misplaced",
            Self::BadCoinbaseScriptLength => "coinbase script length out of bounds",
            Self::NonFinalTransaction => "transaction is not final",
            Self::BadMerkleRoot => "merkle root mismatch",
            Self::MutatedMerkleTree => "duplicate transactions mutate the merkle tree",
            Self::DeepReorg => "branch point exceeds reorganization depth limit",
            Self::UnresolvedInput => "input source output not found",
            Self::Bip30Violation => "transaction hash duplicates an unspent transaction",
            Self::EmptyInputs => "transaction has no inputs",
            Self::EmptyOutputs => "transaction has no outputs",
            Self::DuplicateInput => "output spent more than once",
            Self::ValueOutOfRange => "output value out of range",
            Self::OutputsExceedInputs => "outputs exceed resolved inputs",
            Self::ImmatureCoinbaseSpend => "coinbase output spent before maturity",
            Self::TooManySigops => "signature operation limit exceeded",
            Self::ScriptFailure => "script evaluation failed",
            Self::RewardExceedsSubsidy => "coinbase pays more than subsidy plus fees",
            Self::Infrastructure(message) => message,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationError {
    pub kind: ValidationErrorKind,
    pub txid: Option<Hash256>,
    pub input: Option<u32>,
}

impl ValidationError {
    pub fn new(kind: ValidationErrorKind) -> Self {
        Self {
            kind,
            txid: None,
            input: None,
        }
    }

    pub fn with_tx(mut self, txid: Hash256) -> Self {
        self.txid = Some(txid);
        self
    }

    pub fn with_input(mut self, input: u32) -> Self {
        self.input = Some(input);
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.as_str())?;
        if let Some(txid) = &self.txid {
            write!(f, " (tx {})", hex32(txid))?;
        }
        if let Some(input) = self.input {
            write!(f, " (input {input})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

impl From<ValidationErrorKind> for ValidationError {
    fn from(kind: ValidationErrorKind) -> Self {
        Self::new(kind)
    }
}

/// Display-order hex of an internal little-endian hash.
pub fn hex32(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Recomputes a merkle root by repeated SHA-256d pairing, duplicating the
/// odd node of each level. The second return value flags a mutated tree:
/// identical sibling pairs let two different transaction lists produce the
/// same root, which must be rejected.
pub fn merkle_root(hashes: &[Hash256]) -> (Hash256, bool) {
    if hashes.is_empty() {
        return ([0u8; 32], false);
    }
    let mut mutated = false;
    let mut level: Vec<Hash256> = hashes.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let left = pair[0];
            let right = if pair.len() == 2 { pair[1] } else { pair[0] };
            if pair.len() == 2 && left == right {
                mutated = true;
            }
            let mut buf = [0u8; 64];
            buf[..32].copy_from_slice(&left);
            buf[32..].copy_from_slice(&right);
            next.push(sha256d(&buf));
        }
        level = next;
    }
    (level[0], mutated)
}

const OP_PUSHDATA1: u8 = 0x4c;
const OP_PUSHDATA2: u8 = 0x4d;
const OP_PUSHDATA4: u8 = 0x4e;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKSIGVERIFY: u8 = 0xad;
const OP_CHECKMULTISIG: u8 = 0xae;
const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;
const OP_HASH160: u8 = 0xa9;
const OP_EQUAL: u8 = 0x87;

/// Worst-case multisig sigop charge when the key count is not statically
/// known.
const MAX_PUBKEYS_PER_MULTISIG: u32 = 20;

struct OpcodeIter<'a> {
    script: &'a [u8],
    cursor: usize,
}

/// One parsed opcode: the opcode byte plus its push payload, if any.
/// Malformed scripts terminate the iteration.
struct Opcode<'a> {
    op: u8,
    push: Option<&'a [u8]>,
}

impl<'a> Iterator for OpcodeIter<'a> {
    type Item = Opcode<'a>;

    fn next(&mut self) -> Option<Opcode<'a>> {
        if self.cursor >= self.script.len() {
            return None;
        }
        let op = self.script[self.cursor];
        self.cursor += 1;
        let push_len = match op {
            1..=0x4b => op as usize,
            OP_PUSHDATA1 => {
                let len = *self.script.get(self.cursor)? as usize;
                self.cursor += 1;
                len
            }
            OP_PUSHDATA2 => {
                let bytes = self.script.get(self.cursor..self.cursor + 2)?;
                self.cursor += 2;
                u16::from_le_bytes([bytes[0], bytes[1]]) as usize
            }
            OP_PUSHDATA4 => {
                let bytes = self.script.get(self.cursor..self.cursor + 4)?;
                self.cursor += 4;
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
            }
            _ => {
                return Some(Opcode { op, push: None });
            }
        };
        let data = self.script.get(self.cursor..self.cursor + push_len)?;
        self.cursor += push_len;
        Some(Opcode {
            op,
            push: Some(data),
        })
    }
}

fn opcodes(script: &[u8]) -> OpcodeIter<'_> {
    OpcodeIter { script, cursor: 0 }
}

/// Counts signature operations in a script. With `accurate`, a multisig
/// preceded by OP_1..OP_16 is charged its actual key count; otherwise the
/// worst case is assumed (legacy block-level accounting).
pub fn count_sigops(script: &[u8], accurate: bool) -> u32 {
    let mut count = 0u32;
    let mut last_op = 0u8;
    for opcode in opcodes(script) {
        match opcode.op {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                if accurate && (OP_1..=OP_16).contains(&last_op) {
                    count += (last_op - OP_1 + 1) as u32;
                } else {
                    count += MAX_PUBKEYS_PER_MULTISIG;
                }
            }
            _ => {}
        }
        last_op = opcode.op;
    }
    count
}

/// Matches the pay-to-script-hash template: OP_HASH160 <20 bytes> OP_EQUAL.
pub fn is_p2sh(script_pubkey: &[u8]) -> bool {
    script_pubkey.len() == 23
        && script_pubkey[0] == OP_HASH160
        && script_pubkey[1] == 0x14
        && script_pubkey[22] == OP_EQUAL
}

/// Sigops contributed by the redeem script of a pay-to-script-hash spend.
/// The redeem script is the final data push of the unlocking script.
pub fn p2sh_sigops(script_pubkey: &[u8], script_sig: &[u8]) -> u32 {
    if !is_p2sh(script_pubkey) {
        return 0;
    }
    let mut redeem: Option<&[u8]> = None;
    for opcode in opcodes(script_sig) {
        match opcode.push {
            Some(data) => redeem = Some(data),
            // Any non-push opcode disqualifies the spend; charge nothing.
            None => return 0,
        }
    }
    redeem.map(|script| count_sigops(script, true)).unwrap_or(0)
}

/// All non-empty data pushes in a script, for filter construction.
pub fn data_pushes(script: &[u8]) -> Vec<&[u8]> {
    opcodes(script)
        .filter_map(|opcode| opcode.push)
        .filter(|data| !data.is_empty())
        .collect()
}

/// The first data push of a script, if the script starts with one.
pub fn first_data_push(script: &[u8]) -> Option<&[u8]> {
    opcodes(script).next().and_then(|opcode| opcode.push)
}

/// Interprets a script push as a little-endian signed number, the encoding
/// the height-in-coinbase rule uses.
pub fn script_num(bytes: &[u8]) -> i64 {
    if bytes.is_empty() || bytes.len() > 8 {
        return 0;
    }
    let mut value: i64 = 0;
    for (i, &byte) in bytes.iter().enumerate() {
        value |= (byte as i64) << (8 * i);
    }
    if bytes[bytes.len() - 1] & 0x80 != 0 {
        let mask = !(0x80i64 << (8 * (bytes.len() - 1)));
        value = -(value & mask);
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal push encoding of a number, as miners encode the block height
    /// in the coinbase script.
    fn encode_script_num(mut value: i64) -> Vec<u8> {
        let mut out = Vec::new();
        if value == 0 {
            return out;
        }
        let negative = value < 0;
        if negative {
            value = -value;
        }
        while value > 0 {
            out.push((value & 0xff) as u8);
            value >>= 8;
        }
        if out.last().is_some_and(|byte| byte & 0x80 != 0) {
            out.push(if negative { 0x80 } else { 0x00 });
        } else if negative {
            let last = out.len() - 1;
            out[last] |= 0x80;
        }
        out
    }

    #[test]
    fn merkle_single_is_identity() {
        let txid = [7u8; 32];
        let (root, mutated) = merkle_root(&[txid]);
        assert_eq!(root, txid);
        assert!(!mutated);
    }

    #[test]
    fn merkle_pair_is_sha256d_of_concat() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let mut buf = [0u8; 64];
        buf[..32].copy_from_slice(&a);
        buf[32..].copy_from_slice(&b);
        let (root, mutated) = merkle_root(&[a, b]);
        assert_eq!(root, sha256d(&buf));
        assert!(!mutated);
    }

    #[test]
    fn merkle_odd_duplicates_last() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let c = [3u8; 32];
        // [a b c] and [a b c c] produce the same root; only the second is
        // flagged as mutated.
        let (root_odd, mutated_odd) = merkle_root(&[a, b, c]);
        let (root_dup, mutated_dup) = merkle_root(&[a, b, c, c]);
        assert_eq!(root_odd, root_dup);
        assert!(!mutated_odd);
        assert!(mutated_dup);
    }

    #[test]
    fn sigop_counting() {
        assert_eq!(count_sigops(&[OP_CHECKSIG], false), 1);
        assert_eq!(count_sigops(&[OP_CHECKSIGVERIFY, OP_CHECKSIG], false), 2);
        assert_eq!(count_sigops(&[OP_CHECKMULTISIG], false), 20);
        // OP_2 CHECKMULTISIG counts two keys when accurate.
        assert_eq!(count_sigops(&[0x52, OP_CHECKMULTISIG], true), 2);
        assert_eq!(count_sigops(&[0x52, OP_CHECKMULTISIG], false), 20);
    }

    #[test]
    fn p2sh_redeem_sigops() {
        let mut script_pubkey = vec![OP_HASH160, 0x14];
        script_pubkey.extend_from_slice(&[0u8; 20]);
        script_pubkey.push(OP_EQUAL);
        assert!(is_p2sh(&script_pubkey));

        // scriptSig pushing a redeem script of OP_2 <k1> <k2> OP_2 CHECKMULTISIG.
        let redeem = vec![0x52, 0x01, 0xaa, 0x01, 0xbb, 0x52, OP_CHECKMULTISIG];
        let mut script_sig = vec![redeem.len() as u8];
        script_sig.extend_from_slice(&redeem);
        assert_eq!(p2sh_sigops(&script_pubkey, &script_sig), 2);

        assert_eq!(p2sh_sigops(&[OP_CHECKSIG], &script_sig), 0);
    }

    #[test]
    fn malformed_push_terminates_scan() {
        // Claims a 10-byte push with only 2 bytes following.
        let script = [0x0a, 0x01, 0x02];
        assert_eq!(count_sigops(&script, false), 0);
        assert!(data_pushes(&script).is_empty());
    }

    #[test]
    fn script_num_round_trip() {
        for value in [0i64, 1, 127, 128, 255, 256, 100_000, 210_000] {
            let encoded = encode_script_num(value);
            assert_eq!(script_num(&encoded), value, "value {value}");
        }
        assert_eq!(script_num(&encode_script_num(-5)), -5);
    }

    #[test]
    fn first_push_skips_nothing() {
        let script = [0x03, 0x40, 0x0d, 0x03, OP_CHECKSIG];
        assert_eq!(first_data_push(&script), Some(&[0x40, 0x0d, 0x03][..]));
        assert_eq!(script_num(&[0x40, 0x0d, 0x03]), 200_000);
    }
}

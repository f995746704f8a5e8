//! Transaction types and serialization.

use trunkd_consensus::constants::LOCKTIME_THRESHOLD;
use trunkd_consensus::Hash256;

use crate::encoding::{self, Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

pub const TX_CURRENT_VERSION: i32 = 1;

/// A sequence of this value opts the input out of lock time enforcement.
pub const SEQUENCE_FINAL: u32 = u32::MAX;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.prevout.consensus_encode(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let prevout = OutPoint::consensus_decode(decoder)?;
        let script_sig = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self {
            prevout,
            script_sig,
            sequence,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn txid(&self) -> Hash256 {
        sha256d(&encoding::encode(self))
    }

    /// A coinbase has exactly one input whose prevout is the null marker.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    pub fn serialized_size(&self) -> usize {
        encoding::encode(self).len()
    }

    /// A transaction is final when its lock time has passed or every input
    /// carries the final sequence.
    pub fn is_final(&self, height: i32, block_time: i64) -> bool {
        if self.lock_time == 0 {
            return true;
        }
        let cutoff = if (self.lock_time as i64) < LOCKTIME_THRESHOLD {
            height as i64
        } else {
            block_time
        };
        if (self.lock_time as i64) < cutoff {
            return true;
        }
        self.inputs
            .iter()
            .all(|input| input.sequence == SEQUENCE_FINAL)
    }
}

impl Encodable for Transaction {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            input.consensus_encode(encoder);
        }
        encoder.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            output.consensus_encode(encoder);
        }
        encoder.write_u32_le(self.lock_time);
    }
}

impl Decodable for Transaction {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let input_count = decoder.read_varint()?;
        let input_count = usize::try_from(input_count).map_err(|_| DecodeError::SizeTooLarge)?;
        let mut inputs = Vec::with_capacity(input_count.min(1024));
        for _ in 0..input_count {
            inputs.push(TxIn::consensus_decode(decoder)?);
        }
        let output_count = decoder.read_varint()?;
        let output_count = usize::try_from(output_count).map_err(|_| DecodeError::SizeTooLarge)?;
        let mut outputs = Vec::with_capacity(output_count.min(1024));
        for _ in 0..output_count {
            outputs.push(TxOut::consensus_decode(decoder)?);
        }
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding;

    fn sample_tx() -> Transaction {
        Transaction {
            version: TX_CURRENT_VERSION,
            inputs: vec![TxIn {
                prevout: OutPoint::new([7u8; 32], 1),
                script_sig: vec![0x51],
                sequence: SEQUENCE_FINAL,
            }],
            outputs: vec![TxOut {
                value: 5_000_000_000,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn round_trip() {
        let tx = sample_tx();
        let bytes = encoding::encode(&tx);
        let decoded: Transaction = encoding::decode(&bytes).expect("decode");
        assert_eq!(decoded, tx);
        assert_eq!(decoded.txid(), tx.txid());
    }

    #[test]
    fn coinbase_detection() {
        let mut tx = sample_tx();
        assert!(!tx.is_coinbase());
        tx.inputs[0].prevout = OutPoint::null();
        assert!(tx.is_coinbase());
    }

    #[test]
    fn finality_by_height_and_sequence() {
        let mut tx = sample_tx();
        tx.lock_time = 100;
        // Final sequences override the lock time.
        assert!(tx.is_final(50, 0));
        tx.inputs[0].sequence = 0;
        assert!(!tx.is_final(50, 0));
        assert!(!tx.is_final(100, 0));
        assert!(tx.is_final(101, 0));
    }

    #[test]
    fn finality_by_time() {
        let mut tx = sample_tx();
        tx.lock_time = 1_500_000_000;
        tx.inputs[0].sequence = 0;
        assert!(!tx.is_final(0, 1_400_000_000));
        assert!(tx.is_final(0, 1_500_000_001));
    }
}

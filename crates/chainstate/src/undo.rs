//! Per-block undo records.
//!
//! When a block joins the trunk, the outputs it spent are written alongside
//! it so a later unwind can restore them without replaying history.

use trunkd_primitives::encoding::{DecodeError, Decoder, Encoder};

use crate::cache::Output;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockUndo {
    /// Outputs consumed by the block, in spend order.
    pub spent: Vec<Output>,
}

impl BlockUndo {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_varint(self.spent.len() as u64);
        for output in &self.spent {
            encoder.write_hash_le(&output.txid);
            encoder.write_u32_le(output.index);
            encoder.write_bytes(&output.encode_value());
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let count = decoder.read_varint()?;
        let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
        let mut spent = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let txid = decoder.read_hash_le()?;
            let index = decoder.read_u32_le()?;
            let value = decoder.read_i64_le()?;
            let script_pubkey = decoder.read_var_bytes()?;
            let code = decoder.read_u32_le()?;
            spent.push(Output {
                txid,
                index,
                value,
                script_pubkey,
                height: (code >> 1) as i32,
                coinbase: code & 1 == 1,
            });
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self { spent })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let undo = BlockUndo {
            spent: vec![
                Output {
                    txid: [1; 32],
                    index: 0,
                    value: 5_000_000_000,
                    script_pubkey: vec![0x51],
                    height: 7,
                    coinbase: true,
                },
                Output {
                    txid: [2; 32],
                    index: 3,
                    value: 42,
                    script_pubkey: vec![],
                    height: 9,
                    coinbase: false,
                },
            ],
        };
        let decoded = BlockUndo::decode(&undo.encode()).expect("decode");
        assert_eq!(decoded, undo);
    }

    #[test]
    fn empty_record() {
        let undo = BlockUndo::default();
        let decoded = BlockUndo::decode(&undo.encode()).expect("decode");
        assert!(decoded.spent.is_empty());
    }
}

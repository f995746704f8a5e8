//! Block header and block types.

use trunkd_consensus::Hash256;

use crate::encoding::{self, Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::transaction::Transaction;

pub const BLOCK_CURRENT_VERSION: i32 = 2;

/// Serialized size of a block header.
pub const HEADER_SIZE: usize = 80;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn hash(&self) -> Hash256 {
        sha256d(&encoding::encode(self))
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash_le(&self.prev_block);
        encoder.write_hash_le(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            prev_block: decoder.read_hash_le()?,
            merkle_root: decoder.read_hash_le()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn serialized_size(&self) -> usize {
        encoding::encode(self).len()
    }
}

impl Encodable for Block {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.header.consensus_encode(encoder);
        encoder.write_varint(self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.consensus_encode(encoder);
        }
    }
}

impl Decodable for Block {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let header = BlockHeader::consensus_decode(decoder)?;
        let count = decoder.read_varint()?;
        let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
        let mut transactions = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            transactions.push(Transaction::consensus_decode(decoder)?);
        }
        Ok(Self {
            header,
            transactions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_eighty_bytes() {
        let header = BlockHeader {
            version: BLOCK_CURRENT_VERSION,
            prev_block: [1u8; 32],
            merkle_root: [2u8; 32],
            time: 1_231_006_505,
            bits: 0x1d00ffff,
            nonce: 2_083_236_893,
        };
        assert_eq!(encoding::encode(&header).len(), HEADER_SIZE);
    }

    #[test]
    fn header_round_trip() {
        let header = BlockHeader {
            version: 2,
            prev_block: [3u8; 32],
            merkle_root: [4u8; 32],
            time: 1_300_000_000,
            bits: 0x1d00ffff,
            nonce: 42,
        };
        let bytes = encoding::encode(&header);
        let decoded: BlockHeader = encoding::decode(&bytes).expect("decode");
        assert_eq!(decoded, header);
        assert_eq!(decoded.hash(), header.hash());
    }
}

//! The persistence port: everything the validation core asks of durable
//! storage, behind one trait so backends stay swappable.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use primitive_types::U256;
use trunkd_consensus::Hash256;
use trunkd_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use trunkd_primitives::{BlockFilter, BlockHeader, OutPoint, Transaction};
use trunkd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::cache::{FlatTxOutCache, Output, TxOutCache};
use crate::index::ChainIndex;
use crate::undo::BlockUndo;

const META_TRUNK_HEAD: &[u8] = b"trunk_head";

#[derive(Debug)]
pub enum ChainStoreError {
    Store(StoreError),
    Decode(DecodeError),
}

impl fmt::Display for ChainStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainStoreError::Store(err) => write!(f, "{err}"),
            ChainStoreError::Decode(err) => write!(f, "corrupt store entry: {err}"),
        }
    }
}

impl std::error::Error for ChainStoreError {}

impl From<StoreError> for ChainStoreError {
    fn from(err: StoreError) -> Self {
        ChainStoreError::Store(err)
    }
}

impl From<DecodeError> for ChainStoreError {
    fn from(err: DecodeError) -> Self {
        ChainStoreError::Decode(err)
    }
}

/// A block in its persistent form: the wire block plus the acceptance-time
/// fields the validator assigns.
#[derive(Clone, Debug)]
pub struct StoredBlock {
    pub header: BlockHeader,
    pub height: i32,
    pub chain_work: U256,
    pub head: u64,
    pub filter: BlockFilter,
    pub transactions: Vec<Transaction>,
}

impl StoredBlock {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.header.consensus_encode(&mut encoder);
        encoder.write_i32_le(self.height);
        encoder.write_hash_le(&self.chain_work.to_little_endian());
        encoder.write_u64_le(self.head);
        encoder.write_var_bytes(self.filter.data());
        encoder.write_u32_le(self.filter.hash_funcs());
        encoder.write_u32_le(self.filter.tweak());
        encoder.write_varint(self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.consensus_encode(&mut encoder);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        Self::decode_inner(bytes, true)
    }

    /// Decode without transaction bodies.
    pub fn decode_header(bytes: &[u8]) -> Result<Self, DecodeError> {
        Self::decode_inner(bytes, false)
    }

    fn decode_inner(bytes: &[u8], with_transactions: bool) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = BlockHeader::consensus_decode(&mut decoder)?;
        let height = decoder.read_i32_le()?;
        let chain_work = U256::from_little_endian(&decoder.read_hash_le()?);
        let head = decoder.read_u64_le()?;
        let filter_data = decoder.read_var_bytes()?;
        let hash_funcs = decoder.read_u32_le()?;
        let tweak = decoder.read_u32_le()?;
        let filter = BlockFilter::from_parts(filter_data, hash_funcs, tweak);
        let mut transactions = Vec::new();
        if with_transactions {
            let count = decoder.read_varint()?;
            let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
            transactions.reserve(count.min(1024));
            for _ in 0..count {
                transactions.push(Transaction::consensus_decode(&mut decoder)?);
            }
            if !decoder.is_empty() {
                return Err(DecodeError::TrailingBytes);
            }
        }
        Ok(Self {
            header,
            height,
            chain_work,
            head,
            filter,
            transactions,
        })
    }
}

/// Persistent form of a chain head.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredHead {
    pub id: u64,
    pub leaf: Hash256,
    pub height: i32,
    pub chain_work: U256,
    pub previous_head: Option<u64>,
    pub branch_height: i32,
}

impl StoredHead {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u64_le(self.id);
        encoder.write_hash_le(&self.leaf);
        encoder.write_i32_le(self.height);
        encoder.write_hash_le(&self.chain_work.to_little_endian());
        encoder.write_u64_le(self.previous_head.map_or(u64::MAX, |id| id));
        encoder.write_i32_le(self.branch_height);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let id = decoder.read_u64_le()?;
        let leaf = decoder.read_hash_le()?;
        let height = decoder.read_i32_le()?;
        let chain_work = U256::from_little_endian(&decoder.read_hash_le()?);
        let previous_raw = decoder.read_u64_le()?;
        let branch_height = decoder.read_i32_le()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            id,
            leaf,
            height,
            chain_work,
            previous_head: (previous_raw != u64::MAX).then_some(previous_raw),
            branch_height,
        })
    }
}

/// Abstract persistence contract. All calls happen while the chain state
/// write lock is held; a batch is committed whole or dropped (dropping a
/// batch is the cancel path).
pub trait ChainStore: Send + Sync {
    fn start_batch(&self) -> WriteBatch {
        WriteBatch::new()
    }
    fn commit_batch(&self, batch: WriteBatch) -> Result<(), StoreError>;
    fn cancel_batch(&self, batch: WriteBatch) {
        drop(batch);
    }

    fn insert_block(&self, batch: &mut WriteBatch, block: &StoredBlock);
    fn insert_undo(&self, batch: &mut WriteBatch, hash: &Hash256, undo: &BlockUndo);
    fn write_head(&self, batch: &mut WriteBatch, head: &StoredHead);
    fn set_trunk_head(&self, batch: &mut WriteBatch, id: u64);
    fn add_utxo(&self, batch: &mut WriteBatch, output: &Output);
    fn remove_utxo(&self, batch: &mut WriteBatch, outpoint: &OutPoint);

    fn retrieve_block(&self, hash: &Hash256) -> Result<Option<StoredBlock>, ChainStoreError>;
    fn retrieve_block_header(&self, hash: &Hash256)
        -> Result<Option<StoredBlock>, ChainStoreError>;
    fn retrieve_undo(&self, hash: &Hash256) -> Result<Option<BlockUndo>, ChainStoreError>;
    fn retrieve_head(&self, id: u64) -> Result<Option<StoredHead>, ChainStoreError>;
    fn trunk_head_id(&self) -> Result<Option<u64>, ChainStoreError>;

    /// Rebuild the in-memory head set at startup.
    fn cache_heads(&self, index: &mut ChainIndex) -> Result<(), ChainStoreError>;
    /// Rebuild the in-memory block arena at startup; heads must be loaded
    /// first.
    fn cache_chain(&self, index: &mut ChainIndex) -> Result<(), ChainStoreError>;
    /// Warm the UTXO cache with outputs at or above `min_height` (0 loads
    /// everything).
    fn cache_utxo(&self, min_height: i32, view: &mut FlatTxOutCache)
        -> Result<(), ChainStoreError>;

    /// Resolve outputs missing from the in-memory cache.
    fn find_tx_outs(
        &self,
        need: &HashMap<Hash256, BTreeSet<u32>>,
    ) -> Result<Vec<Output>, ChainStoreError>;
    /// Whether any unspent output of `txid` exists at or below `until_height`.
    fn has_unspent_tx(&self, txid: &Hash256, until_height: i32)
        -> Result<bool, ChainStoreError>;
    fn unspent_output(&self, outpoint: &OutPoint) -> Result<Option<Output>, ChainStoreError>;

    /// Drops all durable state.
    fn reset(&self) -> Result<(), StoreError>;
}

/// The concrete port over the key/value storage crate, one column per
/// record family.
pub struct KvChainStore<S: KeyValueStore> {
    store: S,
}

impl<S: KeyValueStore> KvChainStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> ChainStore for KvChainStore<S> {
    fn commit_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        self.store.write_batch(&batch)
    }

    fn insert_block(&self, batch: &mut WriteBatch, block: &StoredBlock) {
        batch.put(Column::Block, block.hash(), block.encode());
    }

    fn insert_undo(&self, batch: &mut WriteBatch, hash: &Hash256, undo: &BlockUndo) {
        batch.put(Column::Undo, *hash, undo.encode());
    }

    fn write_head(&self, batch: &mut WriteBatch, head: &StoredHead) {
        batch.put(Column::Head, head.id.to_be_bytes(), head.encode());
    }

    fn set_trunk_head(&self, batch: &mut WriteBatch, id: u64) {
        batch.put(Column::Meta, META_TRUNK_HEAD, id.to_le_bytes());
    }

    fn add_utxo(&self, batch: &mut WriteBatch, output: &Output) {
        batch.put(Column::Utxo, output.outpoint().to_key(), output.encode_value());
    }

    fn remove_utxo(&self, batch: &mut WriteBatch, outpoint: &OutPoint) {
        batch.delete(Column::Utxo, outpoint.to_key());
    }

    fn retrieve_block(&self, hash: &Hash256) -> Result<Option<StoredBlock>, ChainStoreError> {
        match self.store.get(Column::Block, hash)? {
            Some(bytes) => Ok(Some(StoredBlock::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn retrieve_block_header(
        &self,
        hash: &Hash256,
    ) -> Result<Option<StoredBlock>, ChainStoreError> {
        match self.store.get(Column::Block, hash)? {
            Some(bytes) => Ok(Some(StoredBlock::decode_header(&bytes)?)),
            None => Ok(None),
        }
    }

    fn retrieve_undo(&self, hash: &Hash256) -> Result<Option<BlockUndo>, ChainStoreError> {
        match self.store.get(Column::Undo, hash)? {
            Some(bytes) => Ok(Some(BlockUndo::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn retrieve_head(&self, id: u64) -> Result<Option<StoredHead>, ChainStoreError> {
        match self.store.get(Column::Head, &id.to_be_bytes())? {
            Some(bytes) => Ok(Some(StoredHead::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn trunk_head_id(&self) -> Result<Option<u64>, ChainStoreError> {
        match self.store.get(Column::Meta, META_TRUNK_HEAD)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| DecodeError::InvalidData("bad trunk head id"))?;
                Ok(Some(u64::from_le_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    fn cache_heads(&self, index: &mut ChainIndex) -> Result<(), ChainStoreError> {
        for (_, value) in self.store.scan_prefix(Column::Head, &[])? {
            let head = StoredHead::decode(&value)?;
            index.restore_head(
                head.id,
                head.chain_work,
                head.height,
                head.previous_head,
                head.branch_height,
            );
        }
        Ok(())
    }

    fn cache_chain(&self, index: &mut ChainIndex) -> Result<(), ChainStoreError> {
        let mut headers = Vec::new();
        for (_, value) in self.store.scan_prefix(Column::Block, &[])? {
            headers.push(StoredBlock::decode_header(&value)?);
        }
        headers.sort_by_key(|block| block.height);
        for block in headers {
            let prev = if block.height == 0 {
                None
            } else {
                index.lookup(&block.header.prev_block)
            };
            index.restore_block(
                block.hash(),
                prev,
                block.height,
                block.header.time,
                block.header.version,
                block.header.bits,
                block.chain_work,
                block.head,
            );
        }
        if let Some(trunk) = self.trunk_head_id()? {
            index.set_trunk(trunk);
        }
        Ok(())
    }

    fn cache_utxo(
        &self,
        min_height: i32,
        view: &mut FlatTxOutCache,
    ) -> Result<(), ChainStoreError> {
        let mut decode_error = None;
        self.store
            .for_each_prefix(Column::Utxo, &[], &mut |key, value| {
                if key.len() != 36 {
                    decode_error = Some(DecodeError::InvalidData("bad utxo key"));
                    return Ok(());
                }
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&key[..32]);
                let index = u32::from_le_bytes([key[32], key[33], key[34], key[35]]);
                let outpoint = OutPoint::new(hash, index);
                match Output::decode(&outpoint, value) {
                    Ok(output) => {
                        if output.height >= min_height {
                            view.add(output);
                        }
                    }
                    Err(err) => decode_error = Some(err),
                }
                Ok(())
            })?;
        match decode_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    fn find_tx_outs(
        &self,
        need: &HashMap<Hash256, BTreeSet<u32>>,
    ) -> Result<Vec<Output>, ChainStoreError> {
        let mut found = Vec::new();
        for (txid, indices) in need {
            for index in indices {
                let outpoint = OutPoint::new(*txid, *index);
                if let Some(bytes) = self.store.get(Column::Utxo, &outpoint.to_key())? {
                    found.push(Output::decode(&outpoint, &bytes)?);
                }
            }
        }
        Ok(found)
    }

    fn has_unspent_tx(
        &self,
        txid: &Hash256,
        until_height: i32,
    ) -> Result<bool, ChainStoreError> {
        for (_, value) in self.store.scan_prefix(Column::Utxo, txid)? {
            let output = Output::decode(&OutPoint::new(*txid, 0), &value)?;
            if output.height <= until_height {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn unspent_output(&self, outpoint: &OutPoint) -> Result<Option<Output>, ChainStoreError> {
        match self.store.get(Column::Utxo, &outpoint.to_key())? {
            Some(bytes) => Ok(Some(Output::decode(outpoint, &bytes)?)),
            None => Ok(None),
        }
    }

    fn reset(&self) -> Result<(), StoreError> {
        self.store.clear()
    }
}

//! Trunk switch planning and UTXO rewinding.
//!
//! When a block lands on a branch that overtakes the trunk, the UTXO view
//! has to be rolled back to the branch point and rebuilt along the new
//! chain. The plan is computed against the in-memory index; the actual
//! unwind and replay run against a copy-on-write view so nothing is shared
//! until the whole switch has been validated and committed.

use trunkd_consensus::constants::MAX_REORG_DEPTH;
use trunkd_consensus::Hash256;

use crate::cache::{Output, TxOutCache};
use crate::index::ChainIndex;
use crate::store::StoredBlock;
use crate::undo::BlockUndo;
use crate::validation::{ValidationError, ValidationErrorKind};

/// The two legs of a trunk switch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReorgPath {
    /// Trunk blocks to disconnect, tip first.
    pub unwind: Vec<Hash256>,
    /// Branch blocks to connect, branch point first. Does not include the
    /// incoming block itself.
    pub replay: Vec<Hash256>,
}

impl ReorgPath {
    pub fn is_extension(&self) -> bool {
        self.unwind.is_empty() && self.replay.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.unwind.len()
    }
}

/// Plans the switch for a block whose parent sits at arena index `parent`.
/// For a plain trunk extension both legs come back empty.
pub fn compute_path(index: &ChainIndex, parent: usize) -> Result<ReorgPath, ValidationError> {
    let mut replay = Vec::new();
    let mut cursor = parent;
    while !index.is_on_trunk(&index.block(cursor).hash) {
        replay.push(index.block(cursor).hash);
        match index.block(cursor).prev {
            Some(prev) => cursor = prev,
            None => break,
        }
    }
    replay.reverse();
    let join_height = index.block(cursor).height;

    let mut unwind = Vec::new();
    let mut tip = index.trunk_head().leaf;
    while index.block(tip).height > join_height {
        unwind.push(index.block(tip).hash);
        match index.block(tip).prev {
            Some(prev) => tip = prev,
            None => break,
        }
    }

    if unwind.len() > MAX_REORG_DEPTH as usize {
        return Err(ValidationErrorKind::DeepReorg.into());
    }
    Ok(ReorgPath { unwind, replay })
}

/// Disconnects one block: its outputs leave the view and the outputs it
/// spent come back.
pub fn unwind_block(view: &mut dyn TxOutCache, block: &StoredBlock, undo: &BlockUndo) {
    for tx in &block.transactions {
        let txid = tx.txid();
        for index in 0..tx.outputs.len() {
            view.remove(&txid, index as u32);
        }
    }
    for output in &undo.spent {
        view.add(output.clone());
    }
}

/// Reconnects one already-validated block: spent outputs leave the view and
/// its outputs come back at the block's height.
pub fn replay_block(view: &mut dyn TxOutCache, block: &StoredBlock) {
    for tx in &block.transactions {
        if !tx.is_coinbase() {
            for input in &tx.inputs {
                view.remove(&input.prevout.hash, input.prevout.index);
            }
        }
        let txid = tx.txid();
        let coinbase = tx.is_coinbase();
        for (index, out) in tx.outputs.iter().enumerate() {
            view.add(Output {
                txid,
                index: index as u32,
                value: out.value,
                script_pubkey: out.script_pubkey.clone(),
                height: block.height,
                coinbase,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FlatTxOutCache;
    use primitive_types::U256;
    use trunkd_primitives::{BlockFilter, BlockHeader, OutPoint, Transaction, TxIn, TxOut};

    fn build_chain(index: &mut ChainIndex, count: usize) -> Vec<Hash256> {
        let mut hashes = Vec::new();
        let genesis = [0xeeu8; 32];
        index.install_genesis(genesis, 1_000_000, 2, 0x207fffff, U256::from(1u64));
        hashes.push(genesis);
        for i in 1..count {
            let mut hash = [0u8; 32];
            hash[..8].copy_from_slice(&(i as u64).to_le_bytes());
            let prev = index.lookup(&hashes[i - 1]).expect("prev");
            let staged = index.stage(prev, hash, U256::from(1u64));
            index.commit(&staged, 1_000_000 + (i as u32) * 600, 2, 0x207fffff);
            hashes.push(hash);
        }
        hashes
    }

    #[test]
    fn extension_has_empty_path() {
        let mut index = ChainIndex::new();
        let hashes = build_chain(&mut index, 5);
        let tip = index.lookup(&hashes[4]).expect("tip");
        let path = compute_path(&index, tip).expect("path");
        assert!(path.is_extension());
    }

    #[test]
    fn fork_from_interior_unwinds_to_join() {
        let mut index = ChainIndex::new();
        let hashes = build_chain(&mut index, 6);
        let parent = index.lookup(&hashes[2]).expect("interior");
        let path = compute_path(&index, parent).expect("path");
        // Parent is on the trunk, so nothing replays; the trunk above it
        // unwinds tip first.
        assert!(path.replay.is_empty());
        assert_eq!(path.unwind, vec![hashes[5], hashes[4], hashes[3]]);
        assert_eq!(path.depth(), 3);
    }

    #[test]
    fn branch_parent_adds_replay_leg() {
        let mut index = ChainIndex::new();
        let hashes = build_chain(&mut index, 5);
        // Side branch of two blocks off hashes[2].
        let parent = index.lookup(&hashes[2]).expect("interior");
        let staged = index.stage(parent, [0xa1u8; 32], U256::from(1u64));
        let b1 = index.commit(&staged, 1_002_000, 2, 0x207fffff);
        let staged = index.stage(b1, [0xa2u8; 32], U256::from(1u64));
        let b2 = index.commit(&staged, 1_002_600, 2, 0x207fffff);

        let path = compute_path(&index, b2).expect("path");
        assert_eq!(path.replay, vec![[0xa1u8; 32], [0xa2u8; 32]]);
        assert_eq!(path.unwind, vec![hashes[4], hashes[3]]);
    }

    #[test]
    fn overly_deep_switch_is_rejected() {
        let mut index = ChainIndex::new();
        let hashes = build_chain(&mut index, MAX_REORG_DEPTH as usize + 3);
        let parent = index.lookup(&hashes[1]).expect("near genesis");
        let err = compute_path(&index, parent).expect_err("too deep");
        assert!(matches!(err.kind, ValidationErrorKind::DeepReorg));

        // Depth exactly at the limit is allowed.
        let parent = index.lookup(&hashes[2]).expect("at limit");
        assert!(compute_path(&index, parent).is_ok());
    }

    fn stored(height: i32, transactions: Vec<Transaction>) -> StoredBlock {
        StoredBlock {
            header: BlockHeader {
                version: 2,
                prev_block: [0u8; 32],
                merkle_root: [0u8; 32],
                time: 1_000_000,
                bits: 0x207fffff,
                nonce: 0,
            },
            height,
            chain_work: U256::from(height as u64 + 1),
            head: 0,
            filter: BlockFilter::new(500, 1e-10, 0),
            transactions,
        }
    }

    fn coinbase(value: i64) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig: vec![0x01, 0x01],
                sequence: u32::MAX,
            }],
            outputs: vec![TxOut {
                value,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn replay_then_unwind_restores_view() {
        let mut view = FlatTxOutCache::new();
        let funding = Output {
            txid: [5u8; 32],
            index: 0,
            value: 5_000_000_000,
            script_pubkey: vec![0x51],
            height: 1,
            coinbase: false,
        };
        view.add(funding.clone());

        let spend = Transaction {
            version: 1,
            inputs: vec![TxIn {
                prevout: funding.outpoint(),
                script_sig: vec![],
                sequence: u32::MAX,
            }],
            outputs: vec![TxOut {
                value: 4_999_990_000,
                script_pubkey: vec![0x52],
            }],
            lock_time: 0,
        };
        let block = stored(2, vec![coinbase(5_000_000_000), spend.clone()]);
        let undo = BlockUndo {
            spent: vec![funding.clone()],
        };

        replay_block(&mut view, &block);
        assert!(view.get(&funding.txid, 0).is_none());
        assert!(view.get(&spend.txid(), 0).is_some());
        let minted = view.get(&block.transactions[0].txid(), 0).expect("coinbase out");
        assert!(minted.coinbase);
        assert_eq!(minted.height, 2);

        unwind_block(&mut view, &block, &undo);
        assert_eq!(view.get(&funding.txid, 0), Some(funding));
        assert!(view.get(&spend.txid(), 0).is_none());
        assert!(view.get(&block.transactions[0].txid(), 0).is_none());
    }
}

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use trunkd_chainstate::{
    merkle_root, AcceptAllScripts, ChainState, TrunkListener, ValidationFlags,
};
use trunkd_consensus::money::COIN;
use trunkd_consensus::{chain_params, ChainParams, Hash256, Network};
use trunkd_primitives::{Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut};
use trunkd_storage::memory::MemoryStore;

pub const TEST_BITS: u32 = 0x207fffff;
pub const GENESIS_TIME: u32 = 1_300_000_000;
pub const SUBSIDY: i64 = 50 * COIN;

pub fn coinbase(value: i64, tag: u8) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: vec![0x01, tag],
            sequence: u32::MAX,
        }],
        outputs: vec![TxOut {
            value,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    }
}

pub fn spend(prevout: OutPoint, value: i64) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout,
            script_sig: vec![],
            sequence: u32::MAX,
        }],
        outputs: vec![TxOut {
            value,
            script_pubkey: vec![0x52],
        }],
        lock_time: 0,
    }
}

pub fn build_block(prev: Hash256, time: u32, transactions: Vec<Transaction>) -> Block {
    let txids: Vec<Hash256> = transactions.iter().map(Transaction::txid).collect();
    let (root, _) = merkle_root(&txids);
    Block {
        header: BlockHeader {
            version: 2,
            prev_block: prev,
            merkle_root: root,
            time,
            bits: TEST_BITS,
            nonce: 0,
        },
        transactions,
    }
}

pub fn genesis() -> Block {
    build_block([0u8; 32], GENESIS_TIME, vec![coinbase(SUBSIDY, 0)])
}

/// Regtest parameters pinned to the given genesis block.
pub fn test_params(genesis: &Block) -> ChainParams {
    let mut params = chain_params(Network::Regtest);
    params.hash_genesis_block = genesis.hash();
    params
}

pub fn test_flags() -> ValidationFlags {
    ValidationFlags {
        check_pow: false,
        ..Default::default()
    }
}

pub fn new_state(params: ChainParams) -> ChainState<MemoryStore> {
    ChainState::open(
        MemoryStore::new(),
        params,
        test_flags(),
        Arc::new(AcceptAllScripts),
    )
    .expect("open state")
}

/// Records every trunk update for inspection.
pub struct Recorder {
    pub events: Mutex<Vec<(Vec<Hash256>, Vec<Hash256>)>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn take(&self) -> Vec<(Vec<Hash256>, Vec<Hash256>)> {
        std::mem::take(&mut *self.events.lock().expect("recorder lock"))
    }
}

impl TrunkListener for Recorder {
    fn trunk_update(&self, removed: &[Hash256], added: &[Hash256]) {
        self.events
            .lock()
            .expect("recorder lock")
            .push((removed.to_vec(), added.to_vec()));
    }
}

//! The chain state engine: block acceptance, trunk selection, and the
//! shared UTXO view.
//!
//! One write lock guards the store handle, the chain index, and the flat
//! UTXO cache together. A block is validated against a copy-on-write view;
//! only after its batch is durably committed do the index and cache mutate,
//! so a crash mid-acceptance leaves the previous state intact.

use std::collections::{BTreeSet, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use rayon::prelude::*;
use trunkd_consensus::constants::{
    BLOCK_FILTER_ENTRIES_PER_OUTPUT, BLOCK_FILTER_FALSE_POSITIVE_RATE, BLOCK_FILTER_MIN_ENTRIES,
    COINBASE_MATURITY, HEIGHT_IN_COINBASE_VERSION, MAX_BLOCK_SIGOPS, MAX_BLOCK_SIZE,
    MAX_COINBASE_SCRIPT_LEN, MAX_FUTURE_BLOCK_TIME, MIN_COINBASE_SCRIPT_LEN, MIN_RELAY_TX_FEE,
    VERSION_MAJORITY_ENFORCE_HEIGHT, VERSION_MAJORITY_REJECT_OUTDATED, VERSION_MAJORITY_WINDOW,
};
use trunkd_consensus::money::money_range;
use trunkd_consensus::{block_subsidy, ChainParams, Hash256};
use trunkd_log::{log_debug, log_error, log_info};
use trunkd_pow::{block_proof, check_proof_of_work, next_work_required};
use trunkd_primitives::{Block, BlockFilter, OutPoint, Transaction};
use trunkd_storage::{KeyValueStore, StoreError};

use crate::cache::{DeltaTxOutCache, FlatTxOutCache, Output, TxOutCache};
use crate::index::{ChainIndex, StagedHead};
use crate::reorg;
use crate::script::ScriptEvaluator;
use crate::store::{ChainStore, ChainStoreError, KvChainStore, StoredBlock, StoredHead};
use crate::undo::BlockUndo;
use crate::validation::{
    count_sigops, data_pushes, first_data_push, hex32, merkle_root, p2sh_sigops, script_num,
    ValidationError, ValidationErrorKind,
};

impl From<ChainStoreError> for ValidationError {
    fn from(err: ChainStoreError) -> Self {
        ValidationErrorKind::Infrastructure(err.to_string()).into()
    }
}

impl From<StoreError> for ValidationError {
    fn from(err: StoreError) -> Self {
        ValidationErrorKind::Infrastructure(err.to_string()).into()
    }
}

/// Switches that relax validation for slave deployments and tests.
/// Consensus structure, economics, and ordering always apply.
#[derive(Clone, Copy, Debug)]
pub struct ValidationFlags {
    pub check_pow: bool,
    pub check_scripts: bool,
    /// Re-check txid duplication even at or below the last checkpoint.
    pub force_duplicate_tx_check: bool,
    /// Slave mode: blocks were validated upstream, skip the duplication scan.
    pub slave: bool,
}

impl Default for ValidationFlags {
    fn default() -> Self {
        Self {
            check_pow: true,
            check_scripts: true,
            force_duplicate_tx_check: false,
            slave: false,
        }
    }
}

/// Observer notified after a block lands on the trunk. `removed` holds the
/// disconnected hashes tip first, `added` the connected hashes in chain
/// order ending with the new block. Callbacks run while the state lock is
/// held; implementations must not call back into `ChainState`.
pub trait TrunkListener: Send + Sync {
    fn trunk_update(&self, removed: &[Hash256], added: &[Hash256]);
}

/// What became of an accepted block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockDisposition {
    AlreadyKnown,
    TrunkExtended,
    TrunkSwitched { unwound: usize },
    SideChain,
}

struct ChainInner<S: KeyValueStore> {
    store: KvChainStore<S>,
    index: ChainIndex,
    utxo: FlatTxOutCache,
}

pub struct ChainState<S: KeyValueStore> {
    inner: RwLock<ChainInner<S>>,
    params: ChainParams,
    flags: ValidationFlags,
    evaluator: Arc<dyn ScriptEvaluator>,
    listeners: RwLock<Vec<Arc<dyn TrunkListener>>>,
}

impl<S: KeyValueStore> ChainState<S> {
    /// Opens the state over a backend, rebuilding the in-memory index and
    /// UTXO cache from whatever the store holds.
    pub fn open(
        store: S,
        params: ChainParams,
        flags: ValidationFlags,
        evaluator: Arc<dyn ScriptEvaluator>,
    ) -> Result<Self, ValidationError> {
        let store = KvChainStore::new(store);
        let mut index = ChainIndex::new();
        let mut utxo = FlatTxOutCache::new();
        store.cache_heads(&mut index)?;
        store.cache_chain(&mut index)?;
        store.cache_utxo(0, &mut utxo)?;
        if !index.is_empty() {
            log_info!(
                "chain state loaded: height {} tip {}",
                index.trunk_height(),
                hex32(&index.trunk_tip().hash)
            );
        }
        Ok(Self {
            inner: RwLock::new(ChainInner { store, index, utxo }),
            params,
            flags,
            evaluator,
            listeners: RwLock::new(Vec::new()),
        })
    }

    pub fn add_listener(&self, listener: Arc<dyn TrunkListener>) {
        self.listeners
            .write()
            .expect("listener lock poisoned")
            .push(listener);
    }

    /// Wipes the store and installs the configured genesis block as the
    /// whole chain.
    pub fn reset_store(&self, genesis: &Block) -> Result<(), ValidationError> {
        let hash = genesis.hash();
        if hash != self.params.hash_genesis_block {
            return Err(ValidationErrorKind::CheckpointMismatch.into());
        }
        let work = block_proof(genesis.header.bits)
            .map_err(|_| ValidationError::from(ValidationErrorKind::BadDifficulty))?;

        let mut guard = self.inner.write().expect("chain lock poisoned");
        let inner = &mut *guard;
        inner.store.reset()?;
        inner.index.clear();
        inner.utxo.clear();

        let stored = StoredBlock {
            header: genesis.header,
            height: 0,
            chain_work: work,
            head: 0,
            filter: build_filter(genesis),
            transactions: genesis.transactions.clone(),
        };
        let head = StoredHead {
            id: 0,
            leaf: hash,
            height: 0,
            chain_work: work,
            previous_head: None,
            branch_height: 0,
        };
        let mut batch = inner.store.start_batch();
        inner.store.insert_block(&mut batch, &stored);
        inner.store.insert_undo(&mut batch, &hash, &BlockUndo::default());
        inner.store.write_head(&mut batch, &head);
        inner.store.set_trunk_head(&mut batch, 0);
        let outputs = block_outputs(genesis, 0);
        for output in &outputs {
            inner.store.add_utxo(&mut batch, output);
        }
        inner.store.commit_batch(batch)?;

        inner.index.install_genesis(
            hash,
            genesis.header.time,
            genesis.header.version,
            genesis.header.bits,
            work,
        );
        for output in outputs {
            inner.utxo.add(output);
        }
        log_info!("chain reset to genesis {}", hex32(&hash));
        Ok(())
    }

    /// Validates and persists one block. Known hashes are a no-op; all other
    /// failures leave index, cache, and store untouched.
    pub fn store_block(&self, block: &Block) -> Result<BlockDisposition, ValidationError> {
        let hash = block.hash();
        let mut guard = self.inner.write().expect("chain lock poisoned");
        let inner = &mut *guard;

        if inner.index.contains(&hash) {
            log_debug!("block {} already known", hex32(&hash));
            return Ok(BlockDisposition::AlreadyKnown);
        }
        let parent = inner
            .index
            .lookup(&block.header.prev_block)
            .ok_or(ValidationErrorKind::UnknownParent)?;
        let height = inner.index.block(parent).height + 1;

        self.check_header(inner, parent, block, height, &hash)?;

        let enforce_height = block.header.version >= HEIGHT_IN_COINBASE_VERSION
            && inner.index.version_majority(
                parent,
                HEIGHT_IN_COINBASE_VERSION,
                VERSION_MAJORITY_WINDOW,
            ) >= VERSION_MAJORITY_ENFORCE_HEIGHT;
        check_structure(block, height, enforce_height)?;

        let work = block_proof(block.header.bits)
            .map_err(|_| ValidationError::from(ValidationErrorKind::BadDifficulty))?;
        let staged = inner.index.stage(parent, hash, work);

        let path = reorg::compute_path(&inner.index, parent)?;
        let join_height = inner.index.block(parent).height - path.replay.len() as i32;

        // Copy-on-write view: rewind to the branch point, replay the branch,
        // then connect the incoming block on top.
        let mut view = DeltaTxOutCache::new(&inner.utxo);
        for unwind_hash in &path.unwind {
            let stored = inner
                .store
                .retrieve_block(unwind_hash)?
                .ok_or_else(|| corrupt("missing block for unwind"))?;
            let undo = inner
                .store
                .retrieve_undo(unwind_hash)?
                .ok_or_else(|| corrupt("missing undo record for unwind"))?;
            reorg::unwind_block(&mut view, &stored, &undo);
        }
        for replay_hash in &path.replay {
            let stored = inner
                .store
                .retrieve_block(replay_hash)?
                .ok_or_else(|| corrupt("missing block for replay"))?;
            reorg::replay_block(&mut view, &stored);
        }

        let resolved =
            self.connect_transactions(inner, &mut view, block, height, join_height)?;

        // Coinbase checks run here; the rest of the block in parallel.
        let coinbase = &block.transactions[0];
        let (coinbase_out, coinbase_sigops) = check_coinbase(coinbase)?;
        let results: Vec<Result<(i64, u32), ValidationError>> = block.transactions[1..]
            .par_iter()
            .zip(resolved[1..].par_iter())
            .map(|(tx, sources)| {
                check_transaction(
                    tx,
                    sources,
                    height,
                    &self.params,
                    self.evaluator.as_ref(),
                    self.flags.check_scripts,
                )
            })
            .collect();
        let mut fees = 0i64;
        let mut sigops = coinbase_sigops;
        for result in results {
            let (fee, ops) = result?;
            fees += fee;
            sigops += ops;
        }
        if sigops > MAX_BLOCK_SIGOPS {
            return Err(ValidationErrorKind::TooManySigops.into());
        }
        if coinbase_out > block_subsidy(height, &self.params) + fees {
            return Err(ValidationError::from(ValidationErrorKind::RewardExceedsSubsidy)
                .with_tx(coinbase.txid()));
        }

        // Everything passed; persist atomically, then mutate memory.
        let head_id = staged.head_id();
        let adopt = inner.index.wins_trunk(staged.chain_work, head_id);
        let stored = StoredBlock {
            header: block.header,
            height,
            chain_work: staged.chain_work,
            head: head_id,
            filter: build_filter(block),
            transactions: block.transactions.clone(),
        };
        let undo = BlockUndo {
            spent: resolved.into_iter().flatten().collect(),
        };
        let stored_head = match staged.head {
            StagedHead::Extend(id) => {
                let existing = inner
                    .index
                    .head(id)
                    .ok_or_else(|| corrupt("staged head missing from index"))?;
                StoredHead {
                    id,
                    leaf: hash,
                    height,
                    chain_work: staged.chain_work,
                    previous_head: existing.previous_head,
                    branch_height: existing.branch_height,
                }
            }
            StagedHead::Branch {
                id,
                parent_head,
                branch_height,
            } => StoredHead {
                id,
                leaf: hash,
                height,
                chain_work: staged.chain_work,
                previous_head: Some(parent_head),
                branch_height,
            },
        };

        let mut batch = inner.store.start_batch();
        inner.store.insert_block(&mut batch, &stored);
        inner.store.insert_undo(&mut batch, &hash, &undo);
        inner.store.write_head(&mut batch, &stored_head);
        let additions: Vec<Output>;
        let removals: Vec<OutPoint>;
        if adopt {
            inner.store.set_trunk_head(&mut batch, head_id);
            additions = view.additions().cloned().collect();
            removals = view.removals().collect();
            for output in &additions {
                inner.store.add_utxo(&mut batch, output);
            }
            for outpoint in &removals {
                inner.store.remove_utxo(&mut batch, outpoint);
            }
        } else {
            additions = Vec::new();
            removals = Vec::new();
        }
        drop(view);
        inner.store.commit_batch(batch)?;

        inner.index.commit(
            &staged,
            block.header.time,
            block.header.version,
            block.header.bits,
        );
        let disposition = if adopt {
            inner.index.set_trunk(head_id);
            for outpoint in &removals {
                inner.utxo.remove(&outpoint.hash, outpoint.index);
            }
            for output in additions {
                inner.utxo.add(output);
            }
            if path.unwind.is_empty() {
                log_info!("trunk extended to height {} by {}", height, hex32(&hash));
                BlockDisposition::TrunkExtended
            } else {
                log_info!(
                    "trunk switched at height {}: unwound {} replayed {} tip {}",
                    join_height,
                    path.unwind.len(),
                    path.replay.len() + 1,
                    hex32(&hash)
                );
                BlockDisposition::TrunkSwitched {
                    unwound: path.unwind.len(),
                }
            }
        } else {
            log_debug!(
                "block {} stored on side chain head {}",
                hex32(&hash),
                head_id
            );
            BlockDisposition::SideChain
        };
        // Notified before the lock is released so concurrent writers cannot
        // deliver trunk updates out of chain order.
        if adopt {
            let mut added = path.replay.clone();
            added.push(hash);
            self.notify_listeners(&path.unwind, &added);
        }
        drop(guard);
        Ok(disposition)
    }

    /// Checks a loose transaction against the current trunk tip. Returns
    /// whether the transaction also pays enough fee to be relayed.
    pub fn validate_transaction(&self, tx: &Transaction) -> Result<bool, ValidationError> {
        let txid = tx.txid();
        if tx.is_coinbase() {
            return Err(
                ValidationError::from(ValidationErrorKind::BadCoinbaseStructure).with_tx(txid)
            );
        }
        if tx.inputs.is_empty() {
            return Err(ValidationError::from(ValidationErrorKind::EmptyInputs).with_tx(txid));
        }

        let guard = self.inner.read().expect("chain lock poisoned");
        let inner = &*guard;
        let height = inner.index.trunk_height() + 1;
        if !tx.is_final(height, unix_time()) {
            return Err(
                ValidationError::from(ValidationErrorKind::NonFinalTransaction).with_tx(txid)
            );
        }

        let mut view = DeltaTxOutCache::new(&inner.utxo);
        let mut need: HashMap<Hash256, BTreeSet<u32>> = HashMap::new();
        for input in &tx.inputs {
            if view.get(&input.prevout.hash, input.prevout.index).is_none() {
                need.entry(input.prevout.hash)
                    .or_default()
                    .insert(input.prevout.index);
            }
        }
        for output in inner.store.find_tx_outs(&need)? {
            view.add(output);
        }
        let mut sources = Vec::with_capacity(tx.inputs.len());
        for (i, input) in tx.inputs.iter().enumerate() {
            match view.use_output(&input.prevout.hash, input.prevout.index) {
                Some(output) => sources.push(output),
                None => {
                    let kind = if view.is_removed(&input.prevout.hash, input.prevout.index) {
                        ValidationErrorKind::DuplicateInput
                    } else {
                        ValidationErrorKind::UnresolvedInput
                    };
                    return Err(ValidationError::from(kind)
                        .with_tx(txid)
                        .with_input(i as u32));
                }
            }
            view.remove(&input.prevout.hash, input.prevout.index);
        }

        let (fee, _) = check_transaction(
            tx,
            &sources,
            height,
            &self.params,
            self.evaluator.as_ref(),
            self.flags.check_scripts,
        )?;
        let min_fee = MIN_RELAY_TX_FEE * tx.serialized_size() as i64 / 1000;
        Ok(fee >= min_fee)
    }

    pub fn trunk_height(&self) -> Option<i32> {
        let inner = self.inner.read().expect("chain lock poisoned");
        (!inner.index.is_empty()).then(|| inner.index.trunk_height())
    }

    pub fn trunk_tip_hash(&self) -> Option<Hash256> {
        let inner = self.inner.read().expect("chain lock poisoned");
        (!inner.index.is_empty()).then(|| inner.index.trunk_tip().hash)
    }

    pub fn is_on_trunk(&self, hash: &Hash256) -> bool {
        let inner = self.inner.read().expect("chain lock poisoned");
        !inner.index.is_empty() && inner.index.is_on_trunk(hash)
    }

    pub fn block(&self, hash: &Hash256) -> Result<Option<StoredBlock>, ValidationError> {
        let inner = self.inner.read().expect("chain lock poisoned");
        Ok(inner.store.retrieve_block(hash)?)
    }

    pub fn unspent_output(&self, outpoint: &OutPoint) -> Result<Option<Output>, ValidationError> {
        let inner = self.inner.read().expect("chain lock poisoned");
        if let Some(output) = inner.utxo.get(&outpoint.hash, outpoint.index) {
            return Ok(Some(output));
        }
        Ok(inner.store.unspent_output(outpoint)?)
    }

    pub fn locator(&self) -> Vec<Hash256> {
        let inner = self.inner.read().expect("chain lock poisoned");
        inner.index.locator()
    }

    pub fn inventory(&self, locator: &[Hash256], stop: &Hash256, limit: usize) -> Vec<Hash256> {
        let inner = self.inner.read().expect("chain lock poisoned");
        if inner.index.is_empty() {
            return Vec::new();
        }
        inner.index.inventory(locator, stop, limit)
    }

    fn check_header(
        &self,
        inner: &ChainInner<S>,
        parent: usize,
        block: &Block,
        height: i32,
        hash: &Hash256,
    ) -> Result<(), ValidationError> {
        let time = block.header.time as i64;
        if time > unix_time() + MAX_FUTURE_BLOCK_TIME {
            return Err(ValidationErrorKind::FutureTimestamp.into());
        }
        if time <= inner.index.median_time_past(parent) {
            return Err(ValidationErrorKind::TimestampBeforeMedian.into());
        }

        if block.header.version < HEIGHT_IN_COINBASE_VERSION
            && inner.index.version_majority(
                parent,
                HEIGHT_IN_COINBASE_VERSION,
                VERSION_MAJORITY_WINDOW,
            ) >= VERSION_MAJORITY_REJECT_OUTDATED
        {
            return Err(ValidationErrorKind::OutdatedVersion.into());
        }

        if self.params.enforce_target {
            let interval = self.params.difficulty_review_interval;
            let tail = inner.index.header_tail(parent, interval as usize);
            let expected = next_work_required(&tail, &self.params)
                .map_err(|_| ValidationError::from(ValidationErrorKind::BadDifficulty))?;
            if block.header.bits != expected {
                return Err(ValidationErrorKind::BadDifficulty.into());
            }
        }
        if self.flags.check_pow {
            let sound = check_proof_of_work(hash, block.header.bits, &self.params)
                .map_err(|_| ValidationError::from(ValidationErrorKind::BadDifficulty))?;
            if !sound {
                return Err(ValidationErrorKind::BadProofOfWork.into());
            }
        }

        if let Some(checkpoint) = self.params.checkpoint_at(height) {
            if checkpoint.hash != *hash {
                return Err(ValidationErrorKind::CheckpointMismatch.into());
            }
        }
        Ok(())
    }

    /// Connects the block's transactions onto the view in order: resolves
    /// and spends every input, rejects txid duplicates while an older
    /// incarnation is still spendable, and adds the created outputs. Returns
    /// the spent source outputs per transaction, coinbase first and empty.
    fn connect_transactions(
        &self,
        inner: &ChainInner<S>,
        view: &mut DeltaTxOutCache<'_>,
        block: &Block,
        height: i32,
        join_height: i32,
    ) -> Result<Vec<Vec<Output>>, ValidationError> {
        // Bulk-fetch sources the cache does not hold; in-block dependencies
        // resolve through the view as outputs are added below.
        let mut need: HashMap<Hash256, BTreeSet<u32>> = HashMap::new();
        for tx in block.transactions.iter().skip(1) {
            for input in &tx.inputs {
                let prevout = &input.prevout;
                if view.get(&prevout.hash, prevout.index).is_none()
                    && !view.is_removed(&prevout.hash, prevout.index)
                {
                    need.entry(prevout.hash).or_default().insert(prevout.index);
                }
            }
        }
        for output in inner.store.find_tx_outs(&need)? {
            if view.get(&output.txid, output.index).is_none()
                && !view.is_removed(&output.txid, output.index)
            {
                view.add(output);
            }
        }

        let duplicate_check = !self.flags.slave
            && (height > self.params.last_checkpoint_height()
                || self.flags.force_duplicate_tx_check);

        let mut resolved = Vec::with_capacity(block.transactions.len());
        for tx in &block.transactions {
            let txid = tx.txid();
            if duplicate_check
                && (!view.tx_outputs(&txid).is_empty()
                    || inner.store.has_unspent_tx(&txid, join_height)?)
            {
                return Err(
                    ValidationError::from(ValidationErrorKind::Bip30Violation).with_tx(txid)
                );
            }

            let coinbase = tx.is_coinbase();
            let mut sources = Vec::new();
            if !coinbase {
                sources.reserve(tx.inputs.len());
                for (i, input) in tx.inputs.iter().enumerate() {
                    let prevout = &input.prevout;
                    match view.use_output(&prevout.hash, prevout.index) {
                        Some(output) => sources.push(output),
                        None => {
                            let kind = if view.is_removed(&prevout.hash, prevout.index) {
                                ValidationErrorKind::DuplicateInput
                            } else {
                                ValidationErrorKind::UnresolvedInput
                            };
                            return Err(ValidationError::from(kind)
                                .with_tx(txid)
                                .with_input(i as u32));
                        }
                    }
                    view.remove(&prevout.hash, prevout.index);
                }
            }
            for (index, out) in tx.outputs.iter().enumerate() {
                view.add(Output {
                    txid,
                    index: index as u32,
                    value: out.value,
                    script_pubkey: out.script_pubkey.clone(),
                    height,
                    coinbase,
                });
            }
            resolved.push(sources);
        }
        Ok(resolved)
    }

    fn notify_listeners(&self, removed: &[Hash256], added: &[Hash256]) {
        let listeners = self
            .listeners
            .read()
            .expect("listener lock poisoned")
            .clone();
        for listener in listeners {
            let result = catch_unwind(AssertUnwindSafe(|| {
                listener.trunk_update(removed, added);
            }));
            if result.is_err() {
                log_error!("trunk listener panicked; continuing");
            }
        }
    }
}

fn unix_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

fn corrupt(message: &str) -> ValidationError {
    ValidationErrorKind::Infrastructure(message.to_string()).into()
}

/// Stateless shape checks on a block body.
fn check_structure(block: &Block, height: i32, enforce_height: bool) -> Result<(), ValidationError> {
    if block.transactions.is_empty() {
        return Err(ValidationErrorKind::EmptyBlock.into());
    }
    if block.serialized_size() > MAX_BLOCK_SIZE as usize {
        return Err(ValidationErrorKind::OversizedBlock.into());
    }
    let coinbase = &block.transactions[0];
    if !coinbase.is_coinbase() {
        return Err(ValidationErrorKind::BadCoinbaseStructure.into());
    }
    for tx in block.transactions.iter().skip(1) {
        if tx.is_coinbase() {
            return Err(ValidationError::from(ValidationErrorKind::BadCoinbaseStructure)
                .with_tx(tx.txid()));
        }
    }
    let script_len = coinbase.inputs[0].script_sig.len();
    if !(MIN_COINBASE_SCRIPT_LEN..=MAX_COINBASE_SCRIPT_LEN).contains(&script_len) {
        return Err(ValidationErrorKind::BadCoinbaseScriptLength.into());
    }
    if enforce_height {
        let pushed = first_data_push(&coinbase.inputs[0].script_sig)
            .map(script_num)
            .unwrap_or(-1);
        if pushed != height as i64 {
            return Err(ValidationErrorKind::MissingHeightInCoinbase.into());
        }
    }
    for tx in &block.transactions {
        if !tx.is_final(height, block.header.time as i64) {
            return Err(ValidationError::from(ValidationErrorKind::NonFinalTransaction)
                .with_tx(tx.txid()));
        }
    }

    let txids: Vec<Hash256> = block.transactions.iter().map(Transaction::txid).collect();
    let (root, mutated) = merkle_root(&txids);
    if mutated {
        return Err(ValidationErrorKind::MutatedMerkleTree.into());
    }
    if root != block.header.merkle_root {
        return Err(ValidationErrorKind::BadMerkleRoot.into());
    }
    Ok(())
}

fn check_coinbase(tx: &Transaction) -> Result<(i64, u32), ValidationError> {
    let txid = tx.txid();
    if tx.outputs.is_empty() {
        return Err(ValidationError::from(ValidationErrorKind::EmptyOutputs).with_tx(txid));
    }
    let mut out_sum = 0i64;
    for out in &tx.outputs {
        if !money_range(out.value) {
            return Err(ValidationError::from(ValidationErrorKind::ValueOutOfRange).with_tx(txid));
        }
        out_sum += out.value;
        if !money_range(out_sum) {
            return Err(ValidationError::from(ValidationErrorKind::ValueOutOfRange).with_tx(txid));
        }
    }
    let mut sigops = count_sigops(&tx.inputs[0].script_sig, false);
    for out in &tx.outputs {
        sigops += count_sigops(&out.script_pubkey, false);
    }
    Ok((out_sum, sigops))
}

/// Economic and script checks on one non-coinbase transaction whose inputs
/// were already resolved.
fn check_transaction(
    tx: &Transaction,
    sources: &[Output],
    height: i32,
    params: &ChainParams,
    evaluator: &dyn ScriptEvaluator,
    check_scripts: bool,
) -> Result<(i64, u32), ValidationError> {
    let txid = tx.txid();
    if tx.inputs.is_empty() {
        return Err(ValidationError::from(ValidationErrorKind::EmptyInputs).with_tx(txid));
    }
    if tx.outputs.is_empty() {
        return Err(ValidationError::from(ValidationErrorKind::EmptyOutputs).with_tx(txid));
    }
    debug_assert_eq!(sources.len(), tx.inputs.len());

    let mut out_sum = 0i64;
    let mut sigops = 0u32;
    for out in &tx.outputs {
        if !money_range(out.value) {
            return Err(ValidationError::from(ValidationErrorKind::ValueOutOfRange).with_tx(txid));
        }
        out_sum += out.value;
        if !money_range(out_sum) {
            return Err(ValidationError::from(ValidationErrorKind::ValueOutOfRange).with_tx(txid));
        }
        sigops += count_sigops(&out.script_pubkey, false);
    }

    let mut in_sum = 0i64;
    for (i, (input, source)) in tx.inputs.iter().zip(sources).enumerate() {
        if !money_range(source.value) {
            return Err(ValidationError::from(ValidationErrorKind::ValueOutOfRange)
                .with_tx(txid)
                .with_input(i as u32));
        }
        in_sum += source.value;
        if !money_range(in_sum) {
            return Err(ValidationError::from(ValidationErrorKind::ValueOutOfRange).with_tx(txid));
        }
        if source.coinbase
            && height - source.height < COINBASE_MATURITY
            && !params.allow_immediate_coinbase_spend
        {
            return Err(ValidationError::from(ValidationErrorKind::ImmatureCoinbaseSpend)
                .with_tx(txid)
                .with_input(i as u32));
        }
        sigops += count_sigops(&input.script_sig, false);
        sigops += p2sh_sigops(&source.script_pubkey, &input.script_sig);
        if check_scripts && !evaluator.eval(tx, i, source)? {
            return Err(ValidationError::from(ValidationErrorKind::ScriptFailure)
                .with_tx(txid)
                .with_input(i as u32));
        }
    }
    if out_sum > in_sum {
        return Err(ValidationError::from(ValidationErrorKind::OutputsExceedInputs).with_tx(txid));
    }
    Ok((in_sum - out_sum, sigops))
}

/// Per-block membership filter over txids, data pushes on both sides of
/// every script, and spent outpoints.
fn build_filter(block: &Block) -> BlockFilter {
    let outputs: usize = block
        .transactions
        .iter()
        .map(|tx| tx.outputs.len())
        .sum();
    let entries = (outputs * BLOCK_FILTER_ENTRIES_PER_OUTPUT).max(BLOCK_FILTER_MIN_ENTRIES);
    let mut filter = BlockFilter::new(entries, BLOCK_FILTER_FALSE_POSITIVE_RATE, 0);
    for tx in &block.transactions {
        filter.insert(&tx.txid());
        for out in &tx.outputs {
            for push in data_pushes(&out.script_pubkey) {
                filter.insert(push);
            }
        }
        if !tx.is_coinbase() {
            for input in &tx.inputs {
                filter.insert(&input.prevout.to_key());
                for push in data_pushes(&input.script_sig) {
                    filter.insert(push);
                }
            }
        }
    }
    filter
}

fn block_outputs(block: &Block, height: i32) -> Vec<Output> {
    let mut outputs = Vec::new();
    for tx in &block.transactions {
        let txid = tx.txid();
        let coinbase = tx.is_coinbase();
        for (index, out) in tx.outputs.iter().enumerate() {
            outputs.push(Output {
                txid,
                index: index as u32,
                value: out.value,
                script_pubkey: out.script_pubkey.clone(),
                height,
                coinbase,
            });
        }
    }
    outputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use trunkd_primitives::{BlockHeader, TxIn, TxOut};

    fn coinbase_block(value: i64) -> Block {
        let coinbase = Transaction {
            version: 1,
            inputs: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig: vec![0x01, 0x2a],
                sequence: u32::MAX,
            }],
            outputs: vec![TxOut {
                value,
                script_pubkey: vec![0x04, 0xde, 0xad, 0xbe, 0xef],
            }],
            lock_time: 0,
        };
        let (root, _) = merkle_root(&[coinbase.txid()]);
        Block {
            header: BlockHeader {
                version: 2,
                prev_block: [0u8; 32],
                merkle_root: root,
                time: 1_300_000_000,
                bits: 0x207fffff,
                nonce: 0,
            },
            transactions: vec![coinbase],
        }
    }

    #[test]
    fn filter_covers_txids_and_pushes() {
        let block = coinbase_block(5_000_000_000);
        let filter = build_filter(&block);
        assert!(filter.contains(&block.transactions[0].txid()));
        assert!(filter.contains(&[0xde, 0xad, 0xbe, 0xef]));
        assert!(!filter.contains(b"not in the block"));
    }

    #[test]
    fn filter_covers_input_script_pushes() {
        let mut block = coinbase_block(5_000_000_000);
        let spend = Transaction {
            version: 1,
            inputs: vec![TxIn {
                prevout: OutPoint::new([6u8; 32], 0),
                script_sig: vec![0x04, 0xca, 0xfe, 0xba, 0xbe],
                sequence: u32::MAX,
            }],
            outputs: vec![TxOut {
                value: 1_000,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        };
        block.transactions.push(spend);
        let filter = build_filter(&block);
        assert!(filter.contains(&[0xca, 0xfe, 0xba, 0xbe]));
    }

    #[test]
    fn structure_rejects_merkle_mismatch() {
        let mut block = coinbase_block(5_000_000_000);
        block.header.merkle_root = [9u8; 32];
        let err = check_structure(&block, 1, false).expect_err("bad root");
        assert_eq!(err.kind, ValidationErrorKind::BadMerkleRoot);
    }

    #[test]
    fn structure_enforces_coinbase_height_push() {
        let mut block = coinbase_block(5_000_000_000);
        assert!(check_structure(&block, 1, false).is_ok());
        // Script pushes 42, not the height.
        let err = check_structure(&block, 1, true).expect_err("wrong height");
        assert_eq!(err.kind, ValidationErrorKind::MissingHeightInCoinbase);

        block.transactions[0].inputs[0].script_sig = vec![0x01, 0x07];
        let (root, _) = merkle_root(&[block.transactions[0].txid()]);
        block.header.merkle_root = root;
        assert!(check_structure(&block, 7, true).is_ok());
    }

    #[test]
    fn coinbase_outputs_sum_and_sigops() {
        let block = coinbase_block(5_000_000_000);
        let (out_sum, sigops) = check_coinbase(&block.transactions[0]).expect("valid");
        assert_eq!(out_sum, 5_000_000_000);
        assert_eq!(sigops, 0);
    }
}

//! In-memory views over the unspent output set.
//!
//! `FlatTxOutCache` is the shared cache warmed from storage; it is only
//! mutated once a block has been durably committed to the trunk.
//! `DeltaTxOutCache` layers speculative changes over any parent view so a
//! validation attempt can resolve and spend outputs without touching shared
//! state until the verdict is known.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use trunkd_consensus::Hash256;
use trunkd_primitives::encoding::{DecodeError, Decoder, Encoder};
use trunkd_primitives::OutPoint;

/// One spendable output as tracked by the UTXO set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Output {
    pub txid: Hash256,
    pub index: u32,
    pub value: i64,
    pub script_pubkey: Vec<u8>,
    /// Height of the block that created the output.
    pub height: i32,
    pub coinbase: bool,
}

impl Output {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.index)
    }

    /// Value layout for the `Utxo` column; the outpoint lives in the key.
    pub fn encode_value(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
        let code = ((self.height as u32) << 1) | self.coinbase as u32;
        encoder.write_u32_le(code);
        encoder.into_inner()
    }

    pub fn decode(outpoint: &OutPoint, value: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(value);
        let amount = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        let code = decoder.read_u32_le()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            txid: outpoint.hash,
            index: outpoint.index,
            value: amount,
            script_pubkey,
            height: (code >> 1) as i32,
            coinbase: code & 1 == 1,
        })
    }
}

/// Read/spend contract shared by the flat cache and delta layers.
pub trait TxOutCache {
    /// Side-effect free lookup.
    fn get(&self, txid: &Hash256, index: u32) -> Option<Output>;

    /// Read and mark used. A second call for the same outpoint on the same
    /// view instance returns `None` even while `get` still succeeds.
    fn use_output(&mut self, txid: &Hash256, index: u32) -> Option<Output>;

    /// Insert or overwrite; clears any used mark and pending removal.
    fn add(&mut self, output: Output);

    /// Delete and clear the used mark.
    fn remove(&mut self, txid: &Hash256, index: u32);

    /// All outputs of one transaction visible through this view.
    fn tx_outputs(&self, txid: &Hash256) -> Vec<Output>;

    /// Import a transaction's outputs from another view, bypassing storage.
    fn copy_from(&mut self, other: &dyn TxOutCache, txid: &Hash256) {
        for output in other.tx_outputs(txid) {
            self.add(output);
        }
    }
}

/// The permanently mutated UTXO cache: txid to index to output, plus the
/// used set for the at-most-once spend rule.
#[derive(Default)]
pub struct FlatTxOutCache {
    outputs: HashMap<Hash256, BTreeMap<u32, Output>>,
    used: HashSet<(Hash256, u32)>,
}

impl FlatTxOutCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.outputs.values().map(|per_tx| per_tx.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn clear(&mut self) {
        self.outputs.clear();
        self.used.clear();
    }
}

impl TxOutCache for FlatTxOutCache {
    fn get(&self, txid: &Hash256, index: u32) -> Option<Output> {
        self.outputs
            .get(txid)
            .and_then(|per_tx| per_tx.get(&index))
            .cloned()
    }

    fn use_output(&mut self, txid: &Hash256, index: u32) -> Option<Output> {
        if self.used.contains(&(*txid, index)) {
            return None;
        }
        let output = self.get(txid, index)?;
        self.used.insert((*txid, index));
        Some(output)
    }

    fn add(&mut self, output: Output) {
        self.used.remove(&(output.txid, output.index));
        self.outputs
            .entry(output.txid)
            .or_default()
            .insert(output.index, output);
    }

    fn remove(&mut self, txid: &Hash256, index: u32) {
        self.used.remove(&(*txid, index));
        if let Some(per_tx) = self.outputs.get_mut(txid) {
            per_tx.remove(&index);
            if per_tx.is_empty() {
                self.outputs.remove(txid);
            }
        }
    }

    fn tx_outputs(&self, txid: &Hash256) -> Vec<Output> {
        self.outputs
            .get(txid)
            .map(|per_tx| per_tx.values().cloned().collect())
            .unwrap_or_default()
    }
}

/// Copy-on-write layer over a parent view. The parent is never mutated;
/// all changes accumulate locally and can be inspected for commit.
pub struct DeltaTxOutCache<'a> {
    parent: &'a dyn TxOutCache,
    added: HashMap<Hash256, BTreeMap<u32, Output>>,
    removed: HashMap<Hash256, BTreeSet<u32>>,
    used: HashSet<(Hash256, u32)>,
}

impl<'a> DeltaTxOutCache<'a> {
    pub fn new(parent: &'a dyn TxOutCache) -> Self {
        Self {
            parent,
            added: HashMap::new(),
            removed: HashMap::new(),
            used: HashSet::new(),
        }
    }

    pub fn is_removed(&self, txid: &Hash256, index: u32) -> bool {
        self.removed
            .get(txid)
            .is_some_and(|indices| indices.contains(&index))
    }

    /// Outputs added relative to the parent view.
    pub fn additions(&self) -> impl Iterator<Item = &Output> {
        self.added.values().flat_map(|per_tx| per_tx.values())
    }

    /// Outpoints deleted through this view. May name outpoints the parent
    /// never held; deleting those downstream is a no-op.
    pub fn removals(&self) -> impl Iterator<Item = OutPoint> + '_ {
        self.removed.iter().flat_map(|(txid, indices)| {
            indices.iter().map(move |index| OutPoint::new(*txid, *index))
        })
    }
}

impl TxOutCache for DeltaTxOutCache<'_> {
    fn get(&self, txid: &Hash256, index: u32) -> Option<Output> {
        if self.is_removed(txid, index) {
            return None;
        }
        if let Some(output) = self.added.get(txid).and_then(|per_tx| per_tx.get(&index)) {
            return Some(output.clone());
        }
        self.parent.get(txid, index)
    }

    fn use_output(&mut self, txid: &Hash256, index: u32) -> Option<Output> {
        if self.used.contains(&(*txid, index)) {
            return None;
        }
        let output = self.get(txid, index)?;
        self.used.insert((*txid, index));
        Some(output)
    }

    fn add(&mut self, output: Output) {
        self.used.remove(&(output.txid, output.index));
        if let Some(indices) = self.removed.get_mut(&output.txid) {
            indices.remove(&output.index);
            if indices.is_empty() {
                self.removed.remove(&output.txid);
            }
        }
        self.added
            .entry(output.txid)
            .or_default()
            .insert(output.index, output);
    }

    fn remove(&mut self, txid: &Hash256, index: u32) {
        self.used.remove(&(*txid, index));
        if let Some(per_tx) = self.added.get_mut(txid) {
            per_tx.remove(&index);
            if per_tx.is_empty() {
                self.added.remove(txid);
            }
        }
        // Always recorded, even for locally added outputs, so a later spend
        // of the same outpoint reads as a conflict rather than a miss.
        self.removed.entry(*txid).or_default().insert(index);
    }

    fn tx_outputs(&self, txid: &Hash256) -> Vec<Output> {
        let mut per_tx: BTreeMap<u32, Output> = BTreeMap::new();
        for output in self.parent.tx_outputs(txid) {
            per_tx.insert(output.index, output);
        }
        if let Some(removed) = self.removed.get(txid) {
            for index in removed {
                per_tx.remove(index);
            }
        }
        if let Some(added) = self.added.get(txid) {
            for (index, output) in added {
                per_tx.insert(*index, output.clone());
            }
        }
        per_tx.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(txid: u8, index: u32, value: i64) -> Output {
        Output {
            txid: [txid; 32],
            index,
            value,
            script_pubkey: vec![0x51],
            height: 10,
            coinbase: false,
        }
    }

    #[test]
    fn use_is_at_most_once() {
        let mut cache = FlatTxOutCache::new();
        cache.add(output(1, 0, 50));
        assert!(cache.use_output(&[1; 32], 0).is_some());
        assert!(cache.use_output(&[1; 32], 0).is_none());
        // get is unaffected by the used mark.
        assert!(cache.get(&[1; 32], 0).is_some());
    }

    #[test]
    fn add_clears_used_mark() {
        let mut cache = FlatTxOutCache::new();
        cache.add(output(1, 0, 50));
        cache.use_output(&[1; 32], 0);
        cache.add(output(1, 0, 50));
        assert!(cache.use_output(&[1; 32], 0).is_some());
    }

    #[test]
    fn delta_masks_parent_removals() {
        let mut parent = FlatTxOutCache::new();
        parent.add(output(1, 0, 50));
        parent.add(output(1, 1, 60));

        let mut delta = DeltaTxOutCache::new(&parent);
        delta.remove(&[1; 32], 0);
        assert!(delta.get(&[1; 32], 0).is_none());
        assert!(delta.get(&[1; 32], 1).is_some());
        // The parent is untouched.
        assert!(parent.get(&[1; 32], 0).is_some());
    }

    #[test]
    fn delta_add_cancels_removal() {
        let mut parent = FlatTxOutCache::new();
        parent.add(output(1, 0, 50));

        let mut delta = DeltaTxOutCache::new(&parent);
        delta.remove(&[1; 32], 0);
        delta.add(output(1, 0, 50));
        assert!(delta.get(&[1; 32], 0).is_some());
        assert!(!delta.is_removed(&[1; 32], 0));
    }

    #[test]
    fn delta_marks_removal_of_local_additions() {
        let parent = FlatTxOutCache::new();
        let mut delta = DeltaTxOutCache::new(&parent);
        delta.add(output(1, 0, 50));
        delta.remove(&[1; 32], 0);
        assert!(delta.is_removed(&[1; 32], 0));
        assert!(delta.get(&[1; 32], 0).is_none());
    }

    #[test]
    fn delta_tx_outputs_merges_layers() {
        let mut parent = FlatTxOutCache::new();
        parent.add(output(1, 0, 50));
        parent.add(output(1, 2, 70));

        let mut delta = DeltaTxOutCache::new(&parent);
        delta.remove(&[1; 32], 2);
        delta.add(output(1, 1, 60));

        let outputs = delta.tx_outputs(&[1; 32]);
        let indices: Vec<u32> = outputs.iter().map(|output| output.index).collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[test]
    fn copy_from_imports_without_storage() {
        let mut source = FlatTxOutCache::new();
        source.add(output(2, 0, 10));
        source.add(output(2, 1, 20));

        let parent = FlatTxOutCache::new();
        let mut delta = DeltaTxOutCache::new(&parent);
        delta.copy_from(&source, &[2; 32]);
        assert_eq!(delta.tx_outputs(&[2; 32]).len(), 2);
    }

    #[test]
    fn output_value_round_trip() {
        let original = output(9, 3, 1_234_567);
        let encoded = original.encode_value();
        let decoded = Output::decode(&original.outpoint(), &encoded).expect("decode");
        assert_eq!(decoded, original);
    }
}

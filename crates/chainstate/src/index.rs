//! In-memory chain index: an append-only arena of block metadata plus head
//! bookkeeping for competing branches.
//!
//! Blocks reference their parent by arena index, so the graph is immutable
//! after insertion and freely shareable behind the state lock. Heads are
//! never deleted; losing branches merely stop being the trunk.

use std::collections::{HashMap, HashSet};

use primitive_types::U256;
use trunkd_consensus::constants::{MAX_INVENTORY_SIZE, MTP_WINDOW_SIZE};
use trunkd_consensus::Hash256;
use trunkd_pow::HeaderInfo;

#[derive(Clone, Debug)]
pub struct CachedBlock {
    pub hash: Hash256,
    /// Arena index of the previous block; `None` only for genesis.
    pub prev: Option<usize>,
    pub height: i32,
    pub time: u32,
    pub version: i32,
    pub bits: u32,
    pub chain_work: U256,
    /// Id of the head that owns this block.
    pub head: u64,
}

#[derive(Clone, Debug)]
pub struct CachedHead {
    pub id: u64,
    /// Arena index of the tip block.
    pub leaf: usize,
    pub chain_work: U256,
    pub height: i32,
    /// Head this one branched from, and the height of the branch point.
    pub previous_head: Option<u64>,
    pub branch_height: i32,
    /// Hashes of the blocks owned by this head (above its branch point).
    pub members: HashSet<Hash256>,
}

/// A block's index placement computed before commit. The arena is only
/// mutated once the block is durably stored.
#[derive(Clone, Debug)]
pub struct StagedBlock {
    pub hash: Hash256,
    pub prev: usize,
    pub height: i32,
    pub chain_work: U256,
    pub head: StagedHead,
}

#[derive(Clone, Debug)]
pub enum StagedHead {
    /// The parent is the tip of this head; the block extends it.
    Extend(u64),
    /// The parent is interior; a new head branches off.
    Branch {
        id: u64,
        parent_head: u64,
        branch_height: i32,
    },
}

impl StagedBlock {
    pub fn head_id(&self) -> u64 {
        match self.head {
            StagedHead::Extend(id) => id,
            StagedHead::Branch { id, .. } => id,
        }
    }
}

#[derive(Default)]
pub struct ChainIndex {
    blocks: Vec<CachedBlock>,
    by_hash: HashMap<Hash256, usize>,
    heads: HashMap<u64, CachedHead>,
    next_head_id: u64,
    trunk: u64,
}

impl ChainIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.by_hash.clear();
        self.heads.clear();
        self.next_head_id = 0;
        self.trunk = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<usize> {
        self.by_hash.get(hash).copied()
    }

    pub fn block(&self, idx: usize) -> &CachedBlock {
        &self.blocks[idx]
    }

    pub fn head(&self, id: u64) -> Option<&CachedHead> {
        self.heads.get(&id)
    }

    pub fn heads(&self) -> impl Iterator<Item = &CachedHead> {
        self.heads.values()
    }

    pub fn trunk_id(&self) -> u64 {
        self.trunk
    }

    pub fn trunk_head(&self) -> &CachedHead {
        self.heads.get(&self.trunk).expect("trunk head exists")
    }

    pub fn trunk_tip(&self) -> &CachedBlock {
        &self.blocks[self.trunk_head().leaf]
    }

    pub fn trunk_height(&self) -> i32 {
        self.trunk_head().height
    }

    pub fn set_trunk(&mut self, id: u64) {
        debug_assert!(self.heads.contains_key(&id));
        self.trunk = id;
    }

    /// Installs the first block, creating head 0.
    pub fn install_genesis(
        &mut self,
        hash: Hash256,
        time: u32,
        version: i32,
        bits: u32,
        work: U256,
    ) -> usize {
        debug_assert!(self.blocks.is_empty());
        self.blocks.push(CachedBlock {
            hash,
            prev: None,
            height: 0,
            time,
            version,
            bits,
            chain_work: work,
            head: 0,
        });
        self.by_hash.insert(hash, 0);
        let mut members = HashSet::new();
        members.insert(hash);
        self.heads.insert(
            0,
            CachedHead {
                id: 0,
                leaf: 0,
                chain_work: work,
                height: 0,
                previous_head: None,
                branch_height: 0,
                members,
            },
        );
        self.next_head_id = 1;
        self.trunk = 0;
        0
    }

    /// Computes where a block extending `prev` would land: same head if the
    /// parent is a tip, otherwise a fresh branching head.
    pub fn stage(&self, prev: usize, hash: Hash256, work: U256) -> StagedBlock {
        let parent = &self.blocks[prev];
        let parent_head = self.heads.get(&parent.head).expect("owning head exists");
        let head = if parent_head.leaf == prev {
            StagedHead::Extend(parent_head.id)
        } else {
            StagedHead::Branch {
                id: self.next_head_id,
                parent_head: parent_head.id,
                branch_height: parent.height,
            }
        };
        StagedBlock {
            hash,
            prev,
            height: parent.height + 1,
            chain_work: parent.chain_work + work,
            head,
        }
    }

    /// Applies a staged placement after the durable write succeeded.
    pub fn commit(&mut self, staged: &StagedBlock, time: u32, version: i32, bits: u32) -> usize {
        let idx = self.blocks.len();
        let head_id = staged.head_id();
        self.blocks.push(CachedBlock {
            hash: staged.hash,
            prev: Some(staged.prev),
            height: staged.height,
            time,
            version,
            bits,
            chain_work: staged.chain_work,
            head: head_id,
        });
        self.by_hash.insert(staged.hash, idx);

        match staged.head {
            StagedHead::Extend(id) => {
                let head = self.heads.get_mut(&id).expect("head exists");
                head.leaf = idx;
                head.height = staged.height;
                head.chain_work = staged.chain_work;
                head.members.insert(staged.hash);
            }
            StagedHead::Branch {
                id,
                parent_head,
                branch_height,
            } => {
                let mut members = HashSet::new();
                members.insert(staged.hash);
                self.heads.insert(
                    id,
                    CachedHead {
                        id,
                        leaf: idx,
                        chain_work: staged.chain_work,
                        height: staged.height,
                        previous_head: Some(parent_head),
                        branch_height,
                        members,
                    },
                );
                self.next_head_id = self.next_head_id.max(id + 1);
            }
        }
        idx
    }

    /// Raw arena insertion used when rebuilding the index from storage.
    #[allow(clippy::too_many_arguments)]
    pub fn restore_block(
        &mut self,
        hash: Hash256,
        prev: Option<usize>,
        height: i32,
        time: u32,
        version: i32,
        bits: u32,
        chain_work: U256,
        head: u64,
    ) -> usize {
        let idx = self.blocks.len();
        self.blocks.push(CachedBlock {
            hash,
            prev,
            height,
            time,
            version,
            bits,
            chain_work,
            head,
        });
        self.by_hash.insert(hash, idx);
        if let Some(cached_head) = self.heads.get_mut(&head) {
            cached_head.members.insert(hash);
            if cached_head.height == height {
                cached_head.leaf = idx;
            }
        }
        idx
    }

    /// Head insertion used when rebuilding the index from storage.
    pub fn restore_head(
        &mut self,
        id: u64,
        chain_work: U256,
        height: i32,
        previous_head: Option<u64>,
        branch_height: i32,
    ) {
        self.heads.insert(
            id,
            CachedHead {
                id,
                leaf: 0,
                chain_work,
                height,
                previous_head,
                branch_height,
                members: HashSet::new(),
            },
        );
        self.next_head_id = self.next_head_id.max(id + 1);
    }

    /// Whether adopting a candidate head would replace the trunk: strictly
    /// more work wins; on a tie the lower head id wins.
    pub fn wins_trunk(&self, chain_work: U256, head_id: u64) -> bool {
        let trunk = self.trunk_head();
        chain_work > trunk.chain_work || (chain_work == trunk.chain_work && head_id < trunk.id)
    }

    fn head_contains(&self, head_id: u64, hash: &Hash256, height: i32) -> bool {
        let mut current = self.heads.get(&head_id);
        while let Some(head) = current {
            if height > head.height {
                return false;
            }
            if head.members.contains(hash) {
                return true;
            }
            // Below the branch point the block can only live in an ancestor head.
            current = match head.previous_head {
                Some(prev) if height <= head.branch_height => self.heads.get(&prev),
                _ => None,
            };
        }
        false
    }

    pub fn is_on_trunk(&self, hash: &Hash256) -> bool {
        let Some(idx) = self.lookup(hash) else {
            return false;
        };
        let height = self.blocks[idx].height;
        self.head_contains(self.trunk, hash, height)
    }

    /// Median of the timestamps of the window ending at `idx` (the block
    /// itself and up to ten ancestors).
    pub fn median_time_past(&self, idx: usize) -> i64 {
        let mut times: Vec<i64> = Vec::with_capacity(MTP_WINDOW_SIZE);
        let mut cursor = Some(idx);
        while let Some(i) = cursor {
            if times.len() == MTP_WINDOW_SIZE {
                break;
            }
            let block = &self.blocks[i];
            times.push(block.time as i64);
            cursor = block.prev;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// How many of the `window` blocks ending at `idx` carry a version of at
    /// least `min_version`.
    pub fn version_majority(&self, idx: usize, min_version: i32, window: usize) -> usize {
        let mut count = 0;
        let mut seen = 0;
        let mut cursor = Some(idx);
        while let Some(i) = cursor {
            if seen == window {
                break;
            }
            let block = &self.blocks[i];
            if block.version >= min_version {
                count += 1;
            }
            seen += 1;
            cursor = block.prev;
        }
        count
    }

    /// Contiguous header window ending at `idx`, oldest first, at most
    /// `count` entries. Used for difficulty review.
    pub fn header_tail(&self, idx: usize, count: usize) -> Vec<HeaderInfo> {
        let mut tail = Vec::with_capacity(count);
        let mut cursor = Some(idx);
        while let Some(i) = cursor {
            if tail.len() == count {
                break;
            }
            let block = &self.blocks[i];
            tail.push(HeaderInfo {
                height: block.height,
                time: block.time as i64,
                bits: block.bits,
            });
            cursor = block.prev;
        }
        tail.reverse();
        tail
    }

    /// Block locator: trunk hashes at exponentially growing back-steps,
    /// linear for the first ten, always ending at genesis.
    pub fn locator(&self) -> Vec<Hash256> {
        let mut hashes = Vec::new();
        if self.blocks.is_empty() {
            return hashes;
        }
        let mut idx = self.trunk_head().leaf;
        let mut step = 1usize;
        loop {
            let block = &self.blocks[idx];
            hashes.push(block.hash);
            if block.prev.is_none() {
                break;
            }
            if hashes.len() > 10 {
                step *= 2;
            }
            let mut cursor = idx;
            for _ in 0..step {
                match self.blocks[cursor].prev {
                    Some(prev) => cursor = prev,
                    None => break,
                }
            }
            if cursor == idx {
                break;
            }
            idx = cursor;
        }
        hashes
    }

    /// Hashes after the most recent locator entry on the trunk, moving
    /// toward the tip, up to `limit` (and stopping after `stop`).
    pub fn inventory(&self, locator: &[Hash256], stop: &Hash256, limit: usize) -> Vec<Hash256> {
        let limit = limit.min(MAX_INVENTORY_SIZE);
        if self.blocks.is_empty() {
            return Vec::new();
        }

        let common = locator
            .iter()
            .find(|hash| self.is_on_trunk(hash))
            .and_then(|hash| self.lookup(hash));
        let common_height = common.map(|idx| self.blocks[idx].height).unwrap_or(-1);

        // Collect the trunk path above the common point, tip downward.
        let mut path = Vec::new();
        let mut cursor = Some(self.trunk_head().leaf);
        while let Some(idx) = cursor {
            let block = &self.blocks[idx];
            if block.height <= common_height {
                break;
            }
            path.push(block.hash);
            cursor = block.prev;
        }
        path.reverse();

        let mut inventory = Vec::with_capacity(limit.min(path.len()));
        for hash in path {
            if inventory.len() == limit {
                break;
            }
            inventory.push(hash);
            if hash == *stop {
                break;
            }
        }
        inventory
    }
}

//! Chain state: block validation, trunk selection, reorganization, and the
//! unspent output set, over a pluggable persistence port.

pub mod cache;
pub mod index;
pub mod reorg;
pub mod script;
pub mod state;
pub mod store;
pub mod undo;
pub mod validation;

pub use cache::{DeltaTxOutCache, FlatTxOutCache, Output, TxOutCache};
pub use index::{CachedBlock, CachedHead, ChainIndex, StagedBlock, StagedHead};
pub use reorg::{compute_path, replay_block, unwind_block, ReorgPath};
pub use script::{AcceptAllScripts, ScriptEvaluator};
pub use state::{BlockDisposition, ChainState, TrunkListener, ValidationFlags};
pub use store::{ChainStore, ChainStoreError, KvChainStore, StoredBlock, StoredHead};
pub use undo::BlockUndo;
pub use validation::{merkle_root, ValidationError, ValidationErrorKind};

//! Proof-of-work target arithmetic and difficulty adjustment.

pub mod difficulty;

pub use difficulty::{
    block_proof, check_proof_of_work, compact_to_target, hash_meets_target, next_work_required,
    target_to_compact, CompactError, DifficultyError, HeaderInfo,
};

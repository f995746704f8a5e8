//! Consensus constants, chain parameters, and the subsidy schedule.

pub mod constants;
pub mod money;
pub mod params;
pub mod rewards;

pub use params::{chain_params, ChainParams, Checkpoint, Network};
pub use rewards::block_subsidy;

pub type Hash256 = [u8; 32];

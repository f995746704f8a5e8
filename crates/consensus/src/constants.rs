//! Consensus-wide constants shared across validation.

/// Coinbase transaction outputs can only be spent after this number of new blocks.
pub const COINBASE_MATURITY: i32 = 100;
/// Maximum depth behind the trunk tip at which a branch may still rejoin.
pub const MAX_REORG_DEPTH: i32 = 100;
/// The maximum allowed size for a serialized block, in bytes (network rule).
pub const MAX_BLOCK_SIZE: u32 = 1_000_000;
/// The maximum allowed number of signature check operations in a block (network rule).
pub const MAX_BLOCK_SIGOPS: u32 = 20_000;
/// Reject blocks whose timestamp is further than this in the future.
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;
/// Number of previous blocks over which the median time past is computed.
pub const MTP_WINDOW_SIZE: usize = 11;
/// Lock times below this value are block heights, above it unix times.
pub const LOCKTIME_THRESHOLD: i64 = 500_000_000;

/// Window of recent blocks used for block version super-majority voting.
pub const VERSION_MAJORITY_WINDOW: usize = 1_000;
/// Votes within the window after which outdated block versions are rejected.
pub const VERSION_MAJORITY_REJECT_OUTDATED: usize = 950;
/// Votes within the window after which the coinbase must push the block height.
pub const VERSION_MAJORITY_ENFORCE_HEIGHT: usize = 750;
/// First block version that carries the height in its coinbase script.
pub const HEIGHT_IN_COINBASE_VERSION: i32 = 2;

/// The coinbase scriptSig must be within these bounds, in bytes (network rule).
pub const MIN_COINBASE_SCRIPT_LEN: usize = 2;
pub const MAX_COINBASE_SCRIPT_LEN: usize = 100;

/// Minimum fee per 1000 bytes for a transaction to be considered relay-worthy.
pub const MIN_RELAY_TX_FEE: i64 = 10_000;

/// Maximum number of hashes returned by one inventory request.
pub const MAX_INVENTORY_SIZE: usize = 500;

/// Bloom filter sizing for the per-block data-push filter.
pub const BLOCK_FILTER_MIN_ENTRIES: usize = 500;
pub const BLOCK_FILTER_ENTRIES_PER_OUTPUT: usize = 5;
pub const BLOCK_FILTER_FALSE_POSITIVE_RATE: f64 = 1e-10;

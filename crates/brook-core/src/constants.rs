//! Ledger constants.

/// Id of the root branch created in an empty ledger.
pub const ROOT_BRANCH_ID: u64 = 1;

/// Branches trailing the chain length by more than this are pruned.
pub const OUTDATED_BRANCH_DEPTH: u64 = 10_000;

/// Seconds a free transaction stays in the mempool.
pub const FREE_TX_TTL_SECS: i64 = 600;

/// Upper bound on blocks in one block-range response.
pub const MAX_BLOCKS_PER_RESPONSE: usize = 4096;

/// Blocks the synchronizer asks for per request.
pub const BLOCKS_PER_SYNC_REQUEST: u16 = 4096;

/// Requests a branch gets per sync round when no peer replies.
pub const SYNC_ATTEMPTS_WITHOUT_REPLY: usize = 3;

/// Default interval between checks for a stalled ledger.
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 10;

/// Without a new block for this long, the node syncs on its own.
pub const DEFAULT_SYNC_IDLE_SECS: u64 = 120;

/// Default size cap for a block-range response packet (16 MiB).
pub const DEFAULT_MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Master-only range requests are ignored while more tasks than this wait on
/// the ledger lock.
pub const MAX_LOCK_QUEUE_FOR_SERVING: usize = 2;

/// How far ahead of local time a block timestamp may be (2 hours).
pub const MAX_FUTURE_BLOCK_TIME_SECS: u64 = 2 * 60 * 60;

/// Default checkpoint interval (10 minutes).
pub const DEFAULT_CHECKPOINT_INTERVAL_SECS: u64 = 600;

/// Default interval between outdated-branch sweeps.
pub const DEFAULT_PRUNE_INTERVAL_SECS: u64 = 600;

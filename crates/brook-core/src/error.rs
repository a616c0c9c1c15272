//! Error types for the Brook ledger.
//!
//! Errors fall into two tiers. Recoverable errors (bad blocks, malformed peer
//! messages, mempool rejections) are logged and returned to the caller.
//! Fatal errors (lock misuse, storage failures, hook failures, broken
//! invariants) go to the [`FatalHandler`](crate::fatal::FatalHandler), which
//! halts further mutation.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("lock released twice: {label}")] DoubleRelease { label: String },
    #[error("lock holder count would go negative: {label}")] ExcessRelease { label: String },
    #[error("release of unknown lock ticket {ticket}: {label}")] UnknownTicket { ticket: u64, label: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("sqlite: {0}")] Sqlite(String),
    #[error("io: {0}")] Io(String),
    #[error("duplicate block hash: {0}")] DuplicateHash(String),
    #[error("no master branch")] MissingMaster,
    #[error("branch not found: {0}")] MissingBranch(u64),
    #[error("block not found: {0}")] MissingBlock(String),
    #[error("cycle in branch structure at branch {0}")] BranchCycle(u64),
    #[error("corrupt row: {0}")] Corrupt(String),
    #[error("transaction misuse: {0}")] Transaction(&'static str),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("malformed block: {0}")] Malformed(String),
    #[error("hash mismatch: announced {announced}, computed {computed}")] HashMismatch { announced: String, computed: String },
    #[error("no transactions")] NoTransactions,
    #[error("first transaction is not coinbase")] FirstTxNotCoinbase,
    #[error("multiple coinbase transactions")] MultipleCoinbase,
    #[error("invalid transaction root")] InvalidTxRoot,
    #[error("timestamp too far in the future: {0}")] TimestampTooFar(u64),
    #[error("transaction without outputs: {0}")] NoOutputs(String),
    #[error("duplicate input: {0}")] DuplicateInput(String),
    #[error("unknown output: {0}")] UnknownOutput(String),
    #[error("output already spent: {0}")] AlreadySpent(String),
    #[error("unexpected genesis block: {0}")] UnexpectedGenesis(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("truncated message: need {needed} bytes, have {available}")] Truncated { needed: usize, available: usize },
    #[error("unknown command tag: {0:#04x}")] UnknownCommand(u8),
    #[error("unexpected command tag: expected {expected:#04x}, got {got:#04x}")] UnexpectedCommand { expected: u8, got: u8 },
    #[error("deflate: {0}")] Deflate(String),
    #[error("block count {count} exceeds {max}")] TooManyBlocks { count: usize, max: usize },
    #[error("trailing bytes: {0}")] TrailingBytes(usize),
    #[error("serialization: {0}")] Serialization(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MempoolError {
    #[error("transaction already in pool: {0}")] AlreadyExists(String),
    #[error("malformed transaction: {0}")] Malformed(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HookError {
    #[error("hook {hook} failed in {event}: {reason}")] Failed { hook: String, event: &'static str, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckpointError {
    #[error("checkpoint io: {0}")] Io(String),
    #[error("state file: {0}")] State(String),
}

#[derive(Error, Debug)]
pub enum BrookError {
    #[error(transparent)] Lock(#[from] LockError),
    #[error(transparent)] Store(#[from] StoreError),
    #[error(transparent)] Block(#[from] BlockError),
    #[error(transparent)] Codec(#[from] CodecError),
    #[error(transparent)] Mempool(#[from] MempoolError),
    #[error(transparent)] Hook(#[from] HookError),
    #[error(transparent)] Checkpoint(#[from] CheckpointError),
    #[error("ledger halted: {0}")] Halted(String),
    #[error("config: {0}")] Config(String),
}

impl BrookError {
    /// Whether this error belongs to the fatal tier.
    ///
    /// Peer and user input errors are never fatal.
    pub fn is_fatal(&self) -> bool {
        match self {
            BrookError::Lock(_)
            | BrookError::Store(_)
            | BrookError::Hook(_)
            | BrookError::Checkpoint(_)
            | BrookError::Halted(_) => true,
            BrookError::Block(_)
            | BrookError::Codec(_)
            | BrookError::Mempool(_)
            | BrookError::Config(_) => false,
        }
    }
}

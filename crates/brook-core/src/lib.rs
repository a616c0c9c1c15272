//! # brook-core
//! Foundation types and primitives for the Brook ledger: block and
//! transaction types, the ledger lock, the fatal handler, the branch forest
//! and its fork-choice rule, the free transaction pool and extension hooks.

pub mod branch;
pub mod constants;
pub mod error;
pub mod fatal;
pub mod genesis;
pub mod hooks;
pub mod lock;
pub mod mempool;
pub mod termination;
pub mod types;

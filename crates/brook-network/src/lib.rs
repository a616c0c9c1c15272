//! # brook-network
//! Peer wire messages for the Brook ledger.
//!
//! Transport and peer discovery live outside this crate. It only defines the
//! byte layouts peers exchange:
//! - [`protocol::BlocksAfterRequest`]: ask for blocks after a known hash
//! - [`protocol::BlocksAfterResponse`]: blocks, "no block after", or "hash unknown"
//! - [`protocol::BlockBatch`]: size-capped accumulator used by responders

pub mod protocol;

pub use protocol::{BlockBatch, BlocksAfterRequest, BlocksAfterResponse, WireBlock};

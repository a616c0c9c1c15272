//! # brook-node
//! Ledger node: relational store, fork choice, ingestion, checkpoints and sync.
//!
//! - [`store::LedgerStore`]: SQLite tables for branches, blocks, transactions, outputs and spends
//! - [`ledger::Ledger`]: the store behind the ledger lock, with read queries
//! - [`fork_choice`]: branch bookkeeping and master switching on [`Ledger`]
//! - [`ingest::BlockIngestor`]: block ingestion pipeline
//! - [`checkpoint::CheckpointManager`]: alternating crash-safe snapshots
//! - [`sync::Synchronizer`]: pull synchronization from peers
//! - [`node::Node`]: composition and event loop
//! - [`config::NodeConfig`]: node configuration

pub mod checkpoint;
pub mod config;
pub mod fork_choice;
pub mod ingest;
pub mod ledger;
pub mod node;
pub mod rules;
pub mod state;
pub mod store;
pub mod sync;

pub use config::NodeConfig;
pub use ingest::{BlockBroadcaster, BlockIngestor, IngestOutcome, NullBroadcaster};
pub use ledger::{Ledger, LedgerEvent};
pub use node::Node;
pub use rules::{BlockRules, StandardRules};
pub use sync::{BlockSource, SyncReport, SyncStats, SyncStatus, SyncTracker, Synchronizer};

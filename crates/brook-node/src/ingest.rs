//! Block ingestion.
//!
//! [`BlockIngestor::ingest`] takes one announced block (hash plus raw bytes)
//! from the network, the synchronizer or a local producer, and either stores
//! it or explains why not. The whole pipeline runs inside one critical
//! section of the ledger lock, so ingestion never interleaves with other
//! writers.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use brook_core::constants::ROOT_BRANCH_ID;
use brook_core::error::{BlockError, BrookError};
use brook_core::types::{Block, Hash256};

use crate::ledger::{Ledger, LedgerEvent};
use crate::rules::BlockRules;

/// What happened to an ingested block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Already stored; nothing changed.
    Known,
    /// Undecodable, or its header does not hash to the announced hash.
    Malformed,
    /// The predecessor is not stored.
    UnknownParent,
    /// The rules refused it.
    Rejected(BlockError),
    /// Shutdown was requested before the block was written.
    Aborted,
    Accepted { branch_id: u64, height: u64, forked: bool },
}

impl IngestOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, IngestOutcome::Accepted { .. })
    }
}

/// Relays accepted blocks to peers.
#[async_trait]
pub trait BlockBroadcaster: Send + Sync {
    async fn broadcast(&self, hash: &Hash256, raw: &[u8]);
}

/// Broadcaster for nodes without peers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBroadcaster;

#[async_trait]
impl BlockBroadcaster for NullBroadcaster {
    async fn broadcast(&self, hash: &Hash256, _raw: &[u8]) {
        debug!(hash = %hash.short(), "no peers to relay block to");
    }
}

pub struct BlockIngestor {
    ledger: Arc<Ledger>,
    rules: Arc<dyn BlockRules>,
    broadcaster: Arc<dyn BlockBroadcaster>,
    genesis_hash: Hash256,
}

impl BlockIngestor {
    pub fn new(
        ledger: Arc<Ledger>,
        rules: Arc<dyn BlockRules>,
        broadcaster: Arc<dyn BlockBroadcaster>,
        genesis_hash: Hash256,
    ) -> Self {
        Self { ledger, rules, broadcaster, genesis_hash }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.genesis_hash
    }

    /// Ingest one block announced as `hash`.
    ///
    /// Peer-caused problems come back as an [`IngestOutcome`]; only internal
    /// failures (storage, lock, hooks, halted ledger) are errors.
    pub async fn ingest(&self, hash: Hash256, raw: &[u8], allowance: usize) -> Result<IngestOutcome, BrookError> {
        self.ledger.fatal().ensure_running()?;
        let mut guard = self.ledger.lock().acquire(allowance, "BlockIngestor::ingest").await;
        let reads = allowance + 2;

        if self.ledger.block_id_by_hash(&hash, reads).await?.is_some() {
            debug!(hash = %hash.short(), "block already stored");
            return Ok(IngestOutcome::Known);
        }

        let block = match Block::from_raw(raw) {
            Ok(block) => block,
            Err(e) => {
                debug!(hash = %hash.short(), error = %e, "undecodable block");
                return Ok(IngestOutcome::Malformed);
            }
        };
        let computed = block.hash();
        if computed != hash {
            debug!(announced = %hash.short(), computed = %computed.short(), "block hash mismatch");
            return Ok(IngestOutcome::Malformed);
        }

        // (branch the block extends, height it lands at)
        let (parent_branch, height) = if block.is_genesis() {
            if hash != self.genesis_hash {
                warn!(hash = %hash.short(), "refusing foreign genesis block");
                return Ok(IngestOutcome::Rejected(BlockError::UnexpectedGenesis(hash.to_string())));
            }
            (ROOT_BRANCH_ID, 0)
        } else {
            match self.ledger.block_meta_by_hash(&block.prev_block(), reads).await? {
                Some(parent) => (parent.branch_id, parent.height + 1),
                None => {
                    debug!(hash = %hash.short(), prev = %block.prev_block().short(), "predecessor not stored");
                    return Ok(IngestOutcome::UnknownParent);
                }
            }
        };

        let structure = self.ledger.master_structure(reads).await?;
        match self.rules.validate(&self.ledger, &block, &structure, reads).await {
            Ok(()) => {}
            Err(BrookError::Block(reason)) => {
                warn!(hash = %hash.short(), %reason, "block rejected");
                return Ok(IngestOutcome::Rejected(reason));
            }
            Err(e) => return Err(e),
        }

        if self.ledger.termination().is_requested() {
            info!(hash = %hash.short(), "shutdown requested, block not stored");
            return Ok(IngestOutcome::Aborted);
        }

        let scope = self.ledger.change(reads).await?;
        let forked = self.ledger.check_for_collision(parent_branch, height, allowance + 4).await?;
        let branch_id = if forked {
            self.ledger.add_branch(parent_branch, height, allowance + 4).await?
        } else {
            parent_branch
        };
        self.ledger.add_block_to_branch(branch_id, height, &block, allowance + 4).await?;
        scope.commit()?;
        guard.release()?;

        self.broadcaster.broadcast(&hash, raw).await;
        self.ledger.notify(LedgerEvent::BlockAccepted { hash, branch_id, height });
        info!(hash = %hash.short(), branch_id, height, forked, "block stored");
        Ok(IngestOutcome::Accepted { branch_id, height, forked })
    }
}

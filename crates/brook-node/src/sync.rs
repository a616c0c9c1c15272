//! Pull synchronization with peers.
//!
//! For every known branch the synchronizer asks peers for the blocks that
//! follow the branch tip and feeds them through ingestion, repeating while
//! the branch keeps growing. When every responder says it does not know the
//! tip, the tip is treated as isolated and removed, so the next request asks
//! from its predecessor.
//!
//! A sync runs rounds over fresh branch snapshots until every branch is
//! confirmed at its tip or a round changes nothing. The outcome lands in a
//! [`SyncTracker`] shared with the node, which also uses it to decide when a
//! stalled ledger should sync on its own.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use brook_core::constants::{BLOCKS_PER_SYNC_REQUEST, SYNC_ATTEMPTS_WITHOUT_REPLY};
use brook_core::error::BrookError;
use brook_network::{BlocksAfterRequest, BlocksAfterResponse};

use crate::ingest::BlockIngestor;

/// Peers answering block-range requests. Transport is up to the implementor.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// One response per peer that answered; empty when nobody did.
    async fn request_blocks_after(&self, request: BlocksAfterRequest) -> Vec<BlocksAfterResponse>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Rounds run by this sync.
    pub rounds: usize,
    /// Branches in the snapshot taken at the start of the last round.
    pub branches: usize,
    /// Branches of the last round a peer confirmed to be at its tip.
    pub synchronized: usize,
    /// Blocks added over all rounds.
    pub added: usize,
    /// Isolated tip blocks removed over all rounds.
    pub removed: usize,
    /// The last round confirmed every branch.
    pub ready: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncReport {
    /// Another sync was already running.
    Busy,
    Done(SyncStats),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStatus {
    /// The last finished sync confirmed every branch at its tip.
    pub ready: bool,
    /// Some sync has ever done so.
    pub first_ready: bool,
    pub last_block_added: Instant,
    /// Most common chain length among peers at least as long as the ledger.
    pub peer_chain_length: Option<u64>,
}

/// Sync status shared by a node and its synchronizers.
#[derive(Debug, Clone)]
pub struct SyncTracker(Arc<Mutex<SyncStatus>>);

impl Default for SyncTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncTracker {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(SyncStatus {
            ready: false,
            first_ready: false,
            last_block_added: Instant::now(),
            peer_chain_length: None,
        })))
    }

    pub fn status(&self) -> SyncStatus {
        *self.0.lock()
    }

    pub fn block_added(&self) {
        self.0.lock().last_block_added = Instant::now();
    }

    /// Time since a block was last added.
    pub fn idle_for(&self) -> Duration {
        self.0.lock().last_block_added.elapsed()
    }

    fn sync_started(&self) {
        self.0.lock().ready = false;
    }

    /// Returns whether this is the first sync that ended ready.
    fn sync_finished(&self, ready: bool, peer_chain_length: Option<u64>) -> bool {
        let mut status = self.0.lock();
        status.ready = ready;
        if peer_chain_length.is_some() {
            status.peer_chain_length = peer_chain_length;
        }
        let first = ready && !status.first_ready;
        status.first_ready |= ready;
        first
    }
}

/// Most common of the reported lengths not below `own`, preferring the
/// longer one on a tie.
fn probable_length(reported: &[u64], own: u64) -> Option<u64> {
    let mut counts: HashMap<u64, usize> = HashMap::new();
    for &length in reported.iter().filter(|&&l| l >= own) {
        *counts.entry(length).or_default() += 1;
    }
    counts.into_iter().max_by_key(|&(length, count)| (count, length)).map(|(length, _)| length)
}

pub struct Synchronizer {
    ingestor: Arc<BlockIngestor>,
    source: Arc<dyn BlockSource>,
    zip: bool,
    busy: AtomicBool,
    tracker: SyncTracker,
}

/// Clears the busy flag when the sync ends, however it ends.
struct BusyFlag<'a>(&'a AtomicBool);

impl Drop for BusyFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Synchronizer {
    pub fn new(ingestor: Arc<BlockIngestor>, source: Arc<dyn BlockSource>, zip: bool, tracker: SyncTracker) -> Self {
        Self { ingestor, source, zip, busy: AtomicBool::new(false), tracker }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SyncStatus {
        self.tracker.status()
    }

    /// Synchronize all branches, running rounds until every branch is at
    /// its tip or a round neither adds nor removes a block.
    pub async fn sync(&self) -> Result<SyncReport, BrookError> {
        if self.busy.swap(true, Ordering::SeqCst) {
            debug!("synchronization already running");
            return Ok(SyncReport::Busy);
        }
        let _busy = BusyFlag(&self.busy);
        self.tracker.sync_started();

        let ledger = self.ingestor.ledger();
        let mut stats = SyncStats::default();
        let mut reported = Vec::new();
        loop {
            let branches = ledger.branches(0).await?;
            stats.rounds += 1;
            stats.branches = branches.len();
            stats.synchronized = 0;
            let progress = stats.added + stats.removed;
            for branch in branches {
                if ledger.termination().is_requested() {
                    info!("synchronization interrupted by termination");
                    break;
                }
                self.sync_branch(branch.id, &mut stats, &mut reported).await?;
            }

            stats.ready = stats.synchronized == stats.branches;
            if stats.ready || stats.added + stats.removed == progress || ledger.termination().is_requested() {
                break;
            }
            debug!(
                round = stats.rounds,
                branches = stats.branches,
                synchronized = stats.synchronized,
                "branches left behind, running another round"
            );
        }

        let peer_chain_length = probable_length(&reported, ledger.length());
        if self.tracker.sync_finished(stats.ready, peer_chain_length) {
            info!(length = ledger.length(), "ledger synchronized for the first time");
        }
        info!(
            rounds = stats.rounds,
            branches = stats.branches,
            synchronized = stats.synchronized,
            added = stats.added,
            removed = stats.removed,
            ready = stats.ready,
            ?peer_chain_length,
            "synchronization finished"
        );
        Ok(SyncReport::Done(stats))
    }

    async fn sync_branch(&self, branch_id: u64, stats: &mut SyncStats, reported: &mut Vec<u64>) -> Result<(), BrookError> {
        let ledger = self.ingestor.ledger();
        let mut silent = 0usize;
        loop {
            if ledger.termination().is_requested() {
                return Ok(());
            }
            let mut guard = ledger.lock().acquire(0, "Synchronizer::sync").await;
            // Folded into another branch or dropped since the snapshot.
            let Some(branch) = ledger.branch(branch_id, 1).await? else {
                return Ok(());
            };

            let request = BlocksAfterRequest {
                after_hash: branch.last_block_hash,
                count: BLOCKS_PER_SYNC_REQUEST,
                zip: self.zip,
                from_all_branches: true,
            };
            let responses = self.source.request_blocks_after(request).await;
            if responses.is_empty() {
                silent += 1;
                guard.release()?;
                if silent < SYNC_ATTEMPTS_WITHOUT_REPLY {
                    debug!(branch_id, attempt = silent, "no peer answered, asking again");
                    continue;
                }
                debug!(branch_id, attempts = silent, "no peer answered, leaving branch");
                return Ok(());
            }

            let mut added = 0usize;
            let mut at_tip = false;
            let mut unknown = false;
            for response in responses {
                match response {
                    BlocksAfterResponse::Blocks { blocks, .. } => {
                        for wire in blocks {
                            if ledger.termination().is_requested() {
                                break;
                            }
                            if self.ingestor.ingest(wire.hash, &wire.data, 1).await?.is_accepted() {
                                added += 1;
                            }
                        }
                    }
                    BlocksAfterResponse::NoBlockAfter => at_tip = true,
                    BlocksAfterResponse::NoBlock { chain_length } => {
                        debug!(branch_id, tip = %branch.last_block_hash.short(), chain_length, "peer does not know branch tip");
                        reported.push(u64::from(chain_length));
                        unknown = true;
                    }
                }
            }
            stats.added += added;

            if added > 0 {
                self.tracker.block_added();
                debug!(branch_id, added, "branch grew, asking again");
                guard.release()?;
                continue;
            }
            if at_tip {
                stats.synchronized += 1;
                return Ok(());
            }
            if !unknown {
                return Ok(());
            }

            warn!(branch_id, tip = %branch.last_block_hash.short(), "no peer knows branch tip, removing it");
            let has_blocks = ledger.remove_last_block_of_branch(branch_id, 1).await?;
            stats.removed += 1;
            guard.release()?;
            if !has_blocks {
                return Ok(());
            }
        }
    }
}

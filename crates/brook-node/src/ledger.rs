//! Ledger context: the store behind the ledger lock, plus read queries.
//!
//! Every public operation takes an `allowance` and enters the ledger lock
//! with it. Callers that already hold the lock pass a larger allowance to
//! nested calls (one more per nesting level) so the whole operation stays
//! inside a single critical section. The store mutex itself is only held for
//! synchronous stretches and never across an `.await`.
//!
//! Mutating operations live in [`crate::fork_choice`].

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use brook_core::branch::{Branch, BranchArena, BranchStructure};
use brook_core::constants::OUTDATED_BRANCH_DEPTH;
use brook_core::error::{BrookError, HookError, StoreError};
use brook_core::fatal::FatalHandler;
use brook_core::hooks::HookRegistry;
use brook_core::lock::{LedgerLock, LockGuard};
use brook_core::termination::Termination;
use brook_core::types::{Block, Hash256};

use crate::store::{BlockMeta, BlockRow, LedgerStore, OutputRow};

/// Scans yield to the scheduler after this many steps.
pub(crate) const SCAN_YIELD_EVERY: usize = 64;

const EVENT_CAPACITY: usize = 1024;

/// Notifications for subscribers outside the ledger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerEvent {
    /// A change scope committed.
    Changed,
    /// Ingestion stored a new block.
    BlockAccepted { hash: Hash256, branch_id: u64, height: u64 },
}

/// Answer to a range read for peers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlocksAfter {
    /// The anchor hash is not stored (or not on the requested chain).
    UnknownHash,
    /// The anchor is the last block.
    AtTip,
    Blocks(Vec<BlockRow>),
}

pub struct Ledger {
    pub(crate) store: Mutex<LedgerStore>,
    pub(crate) lock: LedgerLock,
    pub(crate) hooks: Arc<HookRegistry>,
    pub(crate) fatal: FatalHandler,
    pub(crate) termination: Termination,
    events: broadcast::Sender<LedgerEvent>,
    length: AtomicU64,
    pub(crate) outdated_depth: u64,
}

impl Ledger {
    pub fn new(
        store: LedgerStore,
        hooks: Arc<HookRegistry>,
        fatal: FatalHandler,
        termination: Termination,
    ) -> Result<Self, BrookError> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let ledger = Self {
            store: Mutex::new(store),
            lock: LedgerLock::new(fatal.clone()),
            hooks,
            fatal,
            termination,
            events,
            length: AtomicU64::new(0),
            outdated_depth: OUTDATED_BRANCH_DEPTH,
        };
        ledger.refresh_length()?;
        Ok(ledger)
    }

    /// Branches trailing the chain length by more than `depth` count as
    /// outdated.
    pub fn with_outdated_depth(mut self, depth: u64) -> Self {
        self.outdated_depth = depth;
        self
    }

    pub fn lock(&self) -> &LedgerLock {
        &self.lock
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    pub fn fatal(&self) -> &FatalHandler {
        &self.fatal
    }

    pub fn termination(&self) -> &Termination {
        &self.termination
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }

    /// Publish an event. Having no subscribers is fine.
    pub fn notify(&self, event: LedgerEvent) {
        let _ = self.events.send(event);
    }

    /// Chain length: highest stored height plus one, over all branches.
    pub fn length(&self) -> u64 {
        self.length.load(Ordering::SeqCst)
    }

    pub(crate) fn refresh_length(&self) -> Result<u64, BrookError> {
        let length = self.with_store(|s| s.max_height())?.map_or(0, |h| h + 1);
        self.length.store(length, Ordering::SeqCst);
        Ok(length)
    }

    /// Run `f` against the store. Store errors are raised as fatal.
    pub(crate) fn with_store<T>(
        &self,
        f: impl FnOnce(&mut LedgerStore) -> Result<T, StoreError>,
    ) -> Result<T, BrookError> {
        let mut store = self.store.lock();
        f(&mut store).map_err(|e| self.fatal.check(e.into()))
    }

    /// Hook failures are fatal.
    pub(crate) fn hook_outcome(&self, result: Result<(), HookError>) -> Result<(), BrookError> {
        result.map_err(|e| self.fatal.check(e.into()))
    }

    /// Enter a change scope: lock plus a store transaction.
    ///
    /// [`ChangeScope::commit`] commits and emits [`LedgerEvent::Changed`];
    /// dropping the scope rolls back.
    pub async fn change(&self, allowance: usize) -> Result<ChangeScope<'_>, BrookError> {
        self.fatal.ensure_running()?;
        let guard = self.lock.acquire(allowance, "Ledger::change").await;
        let tx = StoreTx::begin(self)?;
        Ok(ChangeScope { tx: Some(tx), guard, ledger: self })
    }

    // ------------------------------------------------------------------
    // Branches
    // ------------------------------------------------------------------

    pub async fn branches(&self, allowance: usize) -> Result<Vec<Branch>, BrookError> {
        let _guard = self.lock.acquire(allowance, "Ledger::branches").await;
        self.with_store(|s| s.branches())
    }

    pub async fn branch(&self, id: u64, allowance: usize) -> Result<Option<Branch>, BrookError> {
        let _guard = self.lock.acquire(allowance, "Ledger::branch").await;
        self.with_store(|s| s.branch(id))
    }

    pub async fn master_branch(&self, allowance: usize) -> Result<Branch, BrookError> {
        let _guard = self.lock.acquire(allowance, "Ledger::master_branch").await;
        self.with_store(|s| s.master_branch())
    }

    /// Ancestor chain of `branch_id`, tip first.
    pub async fn branch_structure(&self, branch_id: u64, allowance: usize) -> Result<BranchStructure, BrookError> {
        let _guard = self.lock.acquire(allowance, "Ledger::branch_structure").await;
        self.with_store(|s| structure_in(s, branch_id))
    }

    pub async fn master_structure(&self, allowance: usize) -> Result<BranchStructure, BrookError> {
        let _guard = self.lock.acquire(allowance, "Ledger::master_structure").await;
        self.with_store(|s| {
            let master = s.master_branch()?;
            structure_in(s, master.id)
        })
    }

    // ------------------------------------------------------------------
    // Blocks
    // ------------------------------------------------------------------

    pub async fn block_id_by_hash(&self, hash: &Hash256, allowance: usize) -> Result<Option<u64>, BrookError> {
        let _guard = self.lock.acquire(allowance, "Ledger::block_id_by_hash").await;
        self.with_store(|s| Ok(s.block_meta_by_hash(hash)?.map(|m| m.id)))
    }

    pub async fn block_meta_by_hash(&self, hash: &Hash256, allowance: usize) -> Result<Option<BlockMeta>, BrookError> {
        let _guard = self.lock.acquire(allowance, "Ledger::block_meta_by_hash").await;
        self.with_store(|s| s.block_meta_by_hash(hash))
    }

    pub async fn block_row_by_hash(&self, hash: &Hash256, allowance: usize) -> Result<Option<BlockRow>, BrookError> {
        let _guard = self.lock.acquire(allowance, "Ledger::block_row_by_hash").await;
        self.with_store(|s| s.block_row_by_hash(hash))
    }

    pub async fn block_by_hash(&self, hash: &Hash256, allowance: usize) -> Result<Option<Block>, BrookError> {
        let _guard = self.lock.acquire(allowance, "Ledger::block_by_hash").await;
        self.with_store(|s| s.block_row_by_hash(hash)?.map(|row| decode_row(&row)).transpose())
    }

    pub async fn block_by_id(&self, id: u64, allowance: usize) -> Result<Option<Block>, BrookError> {
        let _guard = self.lock.acquire(allowance, "Ledger::block_by_id").await;
        self.with_store(|s| s.block_row_by_id(id)?.map(|row| decode_row(&row)).transpose())
    }

    /// Whether `meta` belongs to the chain described by `structure`.
    pub async fn is_block_in_branch_structure(
        &self,
        meta: &BlockMeta,
        structure: &BranchStructure,
        allowance: usize,
    ) -> Result<bool, BrookError> {
        let _guard = self.lock.acquire(allowance, "Ledger::is_block_in_branch_structure").await;
        self.with_store(|s| contains_block(s, meta, structure))
    }

    pub async fn block_in_branch_structure_at_height(
        &self,
        structure: &BranchStructure,
        height: u64,
        allowance: usize,
    ) -> Result<Option<BlockRow>, BrookError> {
        let _guard = self.lock.acquire(allowance, "Ledger::block_in_branch_structure_at_height").await;
        self.with_store(|s| match block_in_structure_at_height(s, structure, height)? {
            Some(meta) => s.block_row_by_id(meta.id),
            None => Ok(None),
        })
    }

    pub async fn master_block_at_height(&self, height: u64, allowance: usize) -> Result<Option<BlockRow>, BrookError> {
        let _guard = self.lock.acquire(allowance, "Ledger::master_block_at_height").await;
        self.with_store(|s| {
            let master = s.master_branch()?;
            let structure = structure_in(s, master.id)?;
            match block_in_structure_at_height(s, &structure, height)? {
                Some(meta) => s.block_row_by_id(meta.id),
                None => Ok(None),
            }
        })
    }

    /// Whether `branch_id` already owns a block at `height`.
    pub async fn check_for_collision(&self, branch_id: u64, height: u64, allowance: usize) -> Result<bool, BrookError> {
        let _guard = self.lock.acquire(allowance, "Ledger::check_for_collision").await;
        self.with_store(|s| s.block_exists_at(branch_id, height))
    }

    /// Number of blocks on the chain described by `structure` whose time
    /// lies in `since..=till`. Blocks of other forks in the same window are
    /// not counted.
    pub async fn count_by_time_in_branch_structure(
        &self,
        structure: &BranchStructure,
        since: u64,
        till: u64,
        allowance: usize,
    ) -> Result<u64, BrookError> {
        let _guard = self.lock.acquire(allowance, "Ledger::count_by_time_in_branch_structure").await;
        self.with_store(|s| {
            let mut count = 0;
            for meta in s.blocks_in_time_range(since, till)? {
                if contains_block(s, &meta, structure)? {
                    count += 1;
                }
            }
            Ok(count)
        })
    }

    // ------------------------------------------------------------------
    // Transactions and outputs
    // ------------------------------------------------------------------

    /// The block on `structure` that contains transaction `tx_hash`.
    pub async fn tx_in_branch_structure(
        &self,
        tx_hash: &Hash256,
        structure: &BranchStructure,
        allowance: usize,
    ) -> Result<Option<BlockMeta>, BrookError> {
        let _guard = self.lock.acquire(allowance, "Ledger::tx_in_branch_structure").await;
        self.with_store(|s| tx_in_structure(s, tx_hash, structure))
    }

    /// Output `out_n` of `tx_hash` as created on `structure`.
    pub async fn output_in_branch_structure(
        &self,
        tx_hash: &Hash256,
        out_n: u32,
        structure: &BranchStructure,
        allowance: usize,
    ) -> Result<Option<OutputRow>, BrookError> {
        let _guard = self.lock.acquire(allowance, "Ledger::output_in_branch_structure").await;
        self.with_store(|s| match tx_in_structure(s, tx_hash, structure)? {
            Some(meta) => s.output_in_block(meta.id, tx_hash, out_n),
            None => Ok(None),
        })
    }

    /// Id of the block on `structure` that spent output `out_n` of `tx_hash`.
    pub async fn tx_out_spent_in_branch_structure(
        &self,
        tx_hash: &Hash256,
        out_n: u32,
        structure: &BranchStructure,
        allowance: usize,
    ) -> Result<Option<u64>, BrookError> {
        let _guard = self.lock.acquire(allowance, "Ledger::tx_out_spent_in_branch_structure").await;
        self.with_store(|s| {
            for block_id in s.spending_blocks(tx_hash, out_n)? {
                let Some(meta) = s.block_meta_by_id(block_id)? else { continue };
                if contains_block(s, &meta, structure)? {
                    return Ok(Some(block_id));
                }
            }
            Ok(None)
        })
    }

    /// Unspent master outputs paying `address`.
    pub async fn unspent_outputs(&self, address: &[u8], allowance: usize) -> Result<Vec<OutputRow>, BrookError> {
        let _guard = self.lock.acquire(allowance, "Ledger::unspent_outputs").await;
        self.with_store(|s| s.unspent_master_outputs(address))
    }

    pub async fn balance(&self, address: &[u8], allowance: usize) -> Result<u64, BrookError> {
        let outputs = self.unspent_outputs(address, allowance).await?;
        Ok(outputs.iter().map(|o| o.amount).fold(0u64, u64::saturating_add))
    }

    // ------------------------------------------------------------------
    // Range reads for peers
    // ------------------------------------------------------------------

    /// Up to `count` blocks of any branch stored after `hash`, in id order.
    pub async fn blocks_after(&self, hash: &Hash256, count: usize, allowance: usize) -> Result<BlocksAfter, BrookError> {
        let _guard = self.lock.acquire(allowance, "Ledger::blocks_after").await;
        let anchor = if *hash == Hash256::INITIAL_PREV {
            0
        } else {
            match self.with_store(|s| s.block_meta_by_hash(hash))? {
                Some(meta) => meta.id,
                None => return Ok(BlocksAfter::UnknownHash),
            }
        };
        let rows = self.with_store(|s| s.blocks_after_id(anchor, count))?;
        if rows.is_empty() {
            return Ok(BlocksAfter::AtTip);
        }
        Ok(BlocksAfter::Blocks(rows))
    }

    /// Up to `count` master blocks following `hash`, by height.
    pub async fn master_blocks_after(&self, hash: &Hash256, count: usize, allowance: usize) -> Result<BlocksAfter, BrookError> {
        let _guard = self.lock.acquire(allowance, "Ledger::master_blocks_after").await;
        let structure = self.with_store(|s| {
            let master = s.master_branch()?;
            structure_in(s, master.id)
        })?;
        let mut height = if *hash == Hash256::INITIAL_PREV {
            0
        } else {
            let anchor = self.with_store(|s| match s.block_meta_by_hash(hash)? {
                Some(meta) if contains_block(s, &meta, &structure)? => Ok(Some(meta)),
                _ => Ok(None),
            })?;
            match anchor {
                Some(meta) => meta.height + 1,
                None => return Ok(BlocksAfter::UnknownHash),
            }
        };

        let mut rows = Vec::new();
        while rows.len() < count {
            let row = self.with_store(|s| match block_in_structure_at_height(s, &structure, height)? {
                Some(meta) => s.block_row_by_id(meta.id),
                None => Ok(None),
            })?;
            let Some(row) = row else { break };
            rows.push(row);
            height += 1;
            if rows.len() % SCAN_YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }
        }
        if rows.is_empty() {
            return Ok(BlocksAfter::AtTip);
        }
        Ok(BlocksAfter::Blocks(rows))
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    pub(crate) async fn backup_to(&self, dest: &Path, allowance: usize) -> Result<(), BrookError> {
        let _guard = self.lock.acquire(allowance, "Ledger::backup_to").await;
        self.with_store(|s| s.backup_to(dest))
    }

    pub(crate) async fn restore_from(&self, src: &Path, allowance: usize) -> Result<(), BrookError> {
        self.fatal.ensure_running()?;
        let _guard = self.lock.acquire(allowance, "Ledger::restore_from").await;
        self.with_store(|s| s.restore_from(src))?;
        let length = self.refresh_length()?;
        debug!(length, "ledger restored from snapshot");
        Ok(())
    }
}

/// An open store transaction. Dropping it uncommitted rolls back.
pub(crate) struct StoreTx<'a> {
    ledger: &'a Ledger,
    open: bool,
}

impl<'a> StoreTx<'a> {
    pub(crate) fn begin(ledger: &'a Ledger) -> Result<Self, BrookError> {
        ledger.with_store(|s| s.begin())?;
        Ok(Self { ledger, open: true })
    }

    pub(crate) fn commit(mut self) -> Result<(), BrookError> {
        self.open = false;
        self.ledger.with_store(|s| s.commit())
    }
}

impl Drop for StoreTx<'_> {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        warn!("rolling back uncommitted ledger transaction");
        if let Err(e) = self.ledger.store.lock().rollback() {
            self.ledger.fatal.raise(&e);
        }
    }
}

/// Critical section with an open store transaction.
pub struct ChangeScope<'a> {
    // Field order matters: the transaction rolls back before the lock is released.
    tx: Option<StoreTx<'a>>,
    guard: LockGuard,
    ledger: &'a Ledger,
}

impl ChangeScope<'_> {
    pub fn commit(mut self) -> Result<(), BrookError> {
        if let Some(tx) = self.tx.take() {
            tx.commit()?;
        }
        self.guard.release()?;
        self.ledger.notify(LedgerEvent::Changed);
        Ok(())
    }
}

fn decode_row(row: &BlockRow) -> Result<Block, StoreError> {
    row.block().map_err(|e| StoreError::Corrupt(format!("block {}: {e}", row.meta.id)))
}

pub(crate) fn structure_in(store: &LedgerStore, branch_id: u64) -> Result<BranchStructure, StoreError> {
    let arena = BranchArena::from_branches(store.branches()?);
    let structure = arena.structure(branch_id)?;
    if structure.is_empty() {
        return Err(StoreError::MissingBranch(branch_id));
    }
    Ok(structure)
}

/// Height at which `branch_id` left its parent: its lowest block, or its
/// length while it owns no block yet.
fn fork_height(store: &LedgerStore, branch_id: u64) -> Result<u64, StoreError> {
    if let Some(height) = store.first_height_in_branch(branch_id)? {
        return Ok(height);
    }
    let branch = store.branch(branch_id)?.ok_or(StoreError::MissingBranch(branch_id))?;
    Ok(branch.length)
}

/// A parent branch only contributes the blocks below the height where the
/// next branch of the structure forked off.
pub(crate) fn contains_block(store: &LedgerStore, meta: &BlockMeta, structure: &BranchStructure) -> Result<bool, StoreError> {
    let Some(index) = structure.position(meta.branch_id) else { return Ok(false) };
    let Some(child) = structure.child_of(index) else { return Ok(true) };
    Ok(meta.height < fork_height(store, child)?)
}

pub(crate) fn block_in_structure_at_height(
    store: &LedgerStore,
    structure: &BranchStructure,
    height: u64,
) -> Result<Option<BlockMeta>, StoreError> {
    for meta in store.blocks_at_height(height)? {
        if contains_block(store, &meta, structure)? {
            return Ok(Some(meta));
        }
    }
    Ok(None)
}

pub(crate) fn tx_in_structure(
    store: &LedgerStore,
    tx_hash: &Hash256,
    structure: &BranchStructure,
) -> Result<Option<BlockMeta>, StoreError> {
    for meta in store.blocks_with_tx(tx_hash)? {
        if contains_block(store, &meta, structure)? {
            return Ok(Some(meta));
        }
    }
    Ok(None)
}

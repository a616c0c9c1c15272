//! Node composition and event loop.
//!
//! [`Node`] wires the ledger store, fork choice, the free transaction pool,
//! ingestion and checkpointing into one running ledger node. Transport is
//! external: peers hand blocks to [`Node::ingest`], ask for ranges through
//! [`Node::serve_blocks_after`], and a [`BlockSource`] drives
//! [`Node::synchronizer`] and [`Node::run_with_source`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use brook_core::constants::{MAX_BLOCKS_PER_RESPONSE, MAX_LOCK_QUEUE_FOR_SERVING};
use brook_core::error::BrookError;
use brook_core::fatal::FatalHandler;
use brook_core::genesis;
use brook_core::hooks::HookRegistry;
use brook_core::mempool::{FreeTxPool, PoolEvent};
use brook_core::termination::Termination;
use brook_core::types::{Hash256, Transaction};
use brook_network::{BlockBatch, BlocksAfterRequest, BlocksAfterResponse};

use crate::checkpoint::CheckpointManager;
use crate::config::NodeConfig;
use crate::ingest::{BlockBroadcaster, BlockIngestor, IngestOutcome};
use crate::ledger::{BlocksAfter, Ledger, LedgerEvent};
use crate::rules::BlockRules;
use crate::state::StateFile;
use crate::store::LedgerStore;
use crate::sync::{BlockSource, SyncStatus, SyncTracker, Synchronizer};

/// A ledger node.
pub struct Node {
    config: NodeConfig,
    ledger: Arc<Ledger>,
    /// Free transactions, behind a sync mutex that is never held across an await.
    mempool: Mutex<FreeTxPool>,
    ingestor: Arc<BlockIngestor>,
    checkpoints: CheckpointManager,
    sync: SyncTracker,
}

impl Node {
    /// Open a node with an empty hook registry.
    pub async fn open(
        config: NodeConfig,
        rules: Arc<dyn BlockRules>,
        broadcaster: Arc<dyn BlockBroadcaster>,
    ) -> Result<Arc<Self>, BrookError> {
        Self::open_with_hooks(config, rules, broadcaster, Arc::new(HookRegistry::new())).await
    }

    /// Open a node whose hooks are registered up front, so they also see
    /// `ledger_ready`.
    ///
    /// An empty ledger gets the built-in genesis block when the configured
    /// genesis hash is the built-in one; otherwise genesis must come from a
    /// peer.
    pub async fn open_with_hooks(
        config: NodeConfig,
        rules: Arc<dyn BlockRules>,
        broadcaster: Arc<dyn BlockBroadcaster>,
        hooks: Arc<HookRegistry>,
    ) -> Result<Arc<Self>, BrookError> {
        let genesis_hash = config.genesis_hash()?;

        let store = LedgerStore::open(config.db_path())?;
        let ledger = Arc::new(
            Ledger::new(store, hooks, FatalHandler::new(), Termination::new())?
                .with_outdated_depth(config.outdated_branch_depth),
        );
        let mempool = Mutex::new(FreeTxPool::new(config.free_tx_ttl_secs));
        let ingestor = Arc::new(BlockIngestor::new(Arc::clone(&ledger), rules, broadcaster, genesis_hash));
        let state = StateFile::open(config.state_path())?;
        let checkpoints = CheckpointManager::new(Arc::clone(&ledger), config.checkpoints_dir(), state);

        let node = Arc::new(Self { config, ledger, mempool, ingestor, checkpoints, sync: SyncTracker::new() });
        node.ledger.hook_outcome(node.ledger.hooks().ledger_ready().await)?;

        if node.ledger.length() == 0 && genesis_hash == genesis::genesis_hash() {
            let outcome = node.ingest(genesis_hash, genesis::genesis_raw()).await?;
            info!(?outcome, hash = %genesis_hash.short(), "stored built-in genesis block");
        }
        info!(
            data_dir = %node.config.data_dir.display(),
            length = node.ledger.length(),
            "ledger node opened"
        );
        Ok(node)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn ingestor(&self) -> &Arc<BlockIngestor> {
        &self.ingestor
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        self.ledger.hooks()
    }

    pub fn termination(&self) -> &Termination {
        self.ledger.termination()
    }

    pub fn fatal(&self) -> &FatalHandler {
        self.ledger.fatal()
    }

    /// Ingest a block announced by a peer or produced locally.
    pub async fn ingest(&self, hash: Hash256, raw: &[u8]) -> Result<IngestOutcome, BrookError> {
        self.ingestor.ingest(hash, raw, 0).await
    }

    pub async fn save_checkpoint(&self) -> Result<u8, BrookError> {
        self.checkpoints.save_checkpoint().await
    }

    pub async fn load_checkpoint(&self) -> Result<Option<u8>, BrookError> {
        self.checkpoints.load_checkpoint().await
    }

    /// A synchronizer pulling from `source` that reports into this node's
    /// sync status.
    pub fn synchronizer(&self, source: Arc<dyn BlockSource>, zip: bool) -> Synchronizer {
        Synchronizer::new(Arc::clone(&self.ingestor), source, zip, self.sync.clone())
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.sync.status()
    }

    // ------------------------------------------------------------------
    // Free transactions
    // ------------------------------------------------------------------

    pub async fn add_free_tx(&self, tx: Transaction) -> Result<Hash256, BrookError> {
        let (result, events) = {
            let mut pool = self.mempool.lock();
            let result = pool.add(tx);
            (result, pool.drain_events())
        };
        self.dispatch_pool_events(events).await?;
        let hash = result?;
        debug!(hash = %hash.short(), "free transaction added");
        Ok(hash)
    }

    /// Expired entries are dropped (and reported to hooks) before the lookup.
    pub async fn is_free_tx_known(&self, hash: &Hash256) -> Result<bool, BrookError> {
        let (known, events) = {
            let mut pool = self.mempool.lock();
            let known = pool.is_known(hash);
            (known, pool.drain_events())
        };
        self.dispatch_pool_events(events).await?;
        Ok(known)
    }

    pub async fn delete_free_tx(&self, hash: &Hash256) -> Result<bool, BrookError> {
        let (deleted, events) = {
            let mut pool = self.mempool.lock();
            let deleted = pool.delete(hash);
            (deleted, pool.drain_events())
        };
        self.dispatch_pool_events(events).await?;
        Ok(deleted)
    }

    pub fn is_output_referenced(&self, tx_hash: &Hash256, out_n: u32) -> bool {
        self.mempool.lock().is_output_referenced(tx_hash, out_n)
    }

    /// Pooled transactions in insertion order.
    pub fn free_txs(&self) -> Vec<Transaction> {
        self.mempool.lock().iter().map(|entry| entry.tx.clone()).collect()
    }

    async fn dispatch_pool_events(&self, events: Vec<PoolEvent>) -> Result<(), BrookError> {
        let hooks = self.ledger.hooks();
        for event in events {
            let result = match &event {
                PoolEvent::Added(tx) => hooks.free_tx_added(tx).await,
                PoolEvent::Removed(hash) => hooks.free_tx_removed(hash).await,
            };
            self.ledger.hook_outcome(result)?;
        }
        Ok(())
    }

    async fn drop_confirmed(&self, hash: &Hash256) -> Result<(), BrookError> {
        let Some(block) = self.ledger.block_by_hash(hash, 0).await? else {
            return Ok(());
        };
        let (removed, events) = {
            let mut pool = self.mempool.lock();
            let removed = pool.remove_confirmed(&block);
            (removed, pool.drain_events())
        };
        self.dispatch_pool_events(events).await?;
        if removed > 0 {
            debug!(hash = %hash.short(), removed, "dropped confirmed free transactions");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Serving peers
    // ------------------------------------------------------------------

    /// Answer a block-range request.
    ///
    /// Returns `None` when a master-only request is shed because the ledger
    /// lock is congested.
    pub async fn serve_blocks_after(
        &self,
        request: &BlocksAfterRequest,
    ) -> Result<Option<BlocksAfterResponse>, BrookError> {
        if !request.from_all_branches && self.ledger.lock().queue_len() > MAX_LOCK_QUEUE_FOR_SERVING {
            debug!(queued = self.ledger.lock().queue_len(), "shedding block-range request");
            return Ok(None);
        }

        let count = usize::from(request.count).min(MAX_BLOCKS_PER_RESPONSE);
        let found = if request.from_all_branches {
            self.ledger.blocks_after(&request.after_hash, count, 0).await?
        } else {
            self.ledger.master_blocks_after(&request.after_hash, count, 0).await?
        };

        let response = match found {
            BlocksAfter::UnknownHash => BlocksAfterResponse::NoBlock {
                chain_length: u32::try_from(self.ledger.length()).unwrap_or(u32::MAX),
            },
            BlocksAfter::AtTip => BlocksAfterResponse::NoBlockAfter,
            BlocksAfter::Blocks(rows) => {
                let mut batch = BlockBatch::new(self.config.max_packet_size, count);
                for row in rows {
                    if !batch.try_push(row.meta.hash, row.data) {
                        break;
                    }
                }
                debug!(after = %request.after_hash.short(), blocks = batch.len(), "serving blocks");
                batch.into_response(request.after_hash, request.zip)
            }
        };
        Ok(Some(response))
    }

    // ------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------

    /// Run until termination is requested or a fatal condition halts the
    /// ledger.
    ///
    /// Drops confirmed transactions from the pool after every accepted
    /// block, saves a checkpoint every `checkpoint_interval_secs` and prunes
    /// outdated branches every `prune_interval_secs`.
    pub async fn run(self: &Arc<Self>) -> Result<(), BrookError> {
        self.event_loop(None).await
    }

    /// [`Node::run`], also pulling blocks from `source`.
    ///
    /// Syncs once at start. After that, every `sync_interval_secs` the node
    /// syncs again if no block was added for `sync_idle_secs`.
    pub async fn run_with_source(self: &Arc<Self>, source: Arc<dyn BlockSource>, zip: bool) -> Result<(), BrookError> {
        let synchronizer = Arc::new(self.synchronizer(source, zip));
        spawn_sync(&synchronizer);
        self.event_loop(Some(synchronizer)).await
    }

    async fn event_loop(self: &Arc<Self>, synchronizer: Option<Arc<Synchronizer>>) -> Result<(), BrookError> {
        let mut events = self.ledger.subscribe();
        let mut checkpoint_timer = interval_secs(self.config.checkpoint_interval_secs);
        let mut prune_timer = interval_secs(self.config.prune_interval_secs);
        let mut sync_timer = interval_secs(self.config.sync_interval_secs);
        let idle_limit = Duration::from_secs(self.config.sync_idle_secs);
        let termination = self.ledger.termination().clone();
        let fatal = self.ledger.fatal().clone();

        loop {
            tokio::select! {
                _ = termination.requested() => {
                    info!("termination requested, leaving event loop");
                    break;
                }
                _ = fatal.halted() => {
                    return Err(BrookError::Halted(fatal.reason().unwrap_or_default()));
                }
                event = events.recv() => match event {
                    Ok(LedgerEvent::BlockAccepted { hash, .. }) => {
                        self.sync.block_added();
                        self.drop_confirmed(&hash).await?;
                    }
                    Ok(LedgerEvent::Changed) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "lagged behind on ledger events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = checkpoint_timer.tick() => {
                    self.save_checkpoint().await?;
                }
                _ = prune_timer.tick() => {
                    let passes = self.ledger.remove_outdated_branches(0).await?;
                    if passes > 0 {
                        info!(passes, "pruned outdated branches");
                    }
                }
                _ = sync_timer.tick(), if synchronizer.is_some() => {
                    let idle = self.sync.idle_for();
                    if let Some(sync) = synchronizer.as_ref().filter(|_| idle >= idle_limit) {
                        info!(idle_secs = idle.as_secs(), "no new blocks lately, synchronizing");
                        spawn_sync(sync);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Sync in the background. Store failures also halt the ledger, so the
/// event loop sees them through the fatal handler.
fn spawn_sync(synchronizer: &Arc<Synchronizer>) {
    let synchronizer = Arc::clone(synchronizer);
    tokio::spawn(async move {
        if let Err(e) = synchronizer.sync().await {
            warn!(error = %e, "synchronization failed");
        }
    });
}

/// A timer whose first tick is one full period away.
fn interval_secs(secs: u64) -> tokio::time::Interval {
    let period = Duration::from_secs(secs.max(1));
    let mut timer = tokio::time::interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::NullBroadcaster;
    use crate::rules::StandardRules;
    use brook_core::types::{TxInput, TxOutput};

    async fn test_node() -> (Arc<Node>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig { data_dir: dir.path().to_path_buf(), ..NodeConfig::default() };
        let node = Node::open(config, Arc::new(StandardRules::default()), Arc::new(NullBroadcaster))
            .await
            .unwrap();
        (node, dir)
    }

    fn free_tx(seed: u8) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput { tx_hash: Hash256([seed; 32]), out_n: 0 }],
            outputs: vec![TxOutput { address: b"bob".to_vec(), amount: 1 }],
            lock_time: 0,
        }
    }

    // ------------------------------------------------------------------
    // Opening
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn node_starts_with_genesis() {
        let (node, _dir) = test_node().await;
        assert_eq!(node.ledger().length(), 1);
        let master = node.ledger().master_branch(0).await.unwrap();
        assert_eq!(master.last_block_hash, genesis::genesis_hash());
    }

    #[tokio::test]
    async fn reopen_keeps_single_genesis() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig { data_dir: dir.path().to_path_buf(), ..NodeConfig::default() };
        for _ in 0..2 {
            let node = Node::open(config.clone(), Arc::new(StandardRules::default()), Arc::new(NullBroadcaster))
                .await
                .unwrap();
            assert_eq!(node.ledger().length(), 1);
        }
    }

    #[tokio::test]
    async fn foreign_genesis_config_leaves_ledger_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            data_dir: dir.path().to_path_buf(),
            genesis_hash: Some("11".repeat(32)),
            ..NodeConfig::default()
        };
        let node = Node::open(config, Arc::new(StandardRules::default()), Arc::new(NullBroadcaster))
            .await
            .unwrap();
        assert_eq!(node.ledger().length(), 0);
        let outcome = node.ingest(genesis::genesis_hash(), genesis::genesis_raw()).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Rejected(_)));
    }

    // ------------------------------------------------------------------
    // Free transactions
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn free_tx_add_and_delete() {
        let (node, _dir) = test_node().await;
        let tx = free_tx(7);
        let hash = node.add_free_tx(tx.clone()).await.unwrap();
        assert!(node.is_free_tx_known(&hash).await.unwrap());
        assert!(node.is_output_referenced(&Hash256([7; 32]), 0));
        assert!(matches!(node.add_free_tx(tx).await, Err(BrookError::Mempool(_))));

        assert!(node.delete_free_tx(&hash).await.unwrap());
        assert!(!node.is_free_tx_known(&hash).await.unwrap());
        assert!(node.free_txs().is_empty());
    }

    // ------------------------------------------------------------------
    // Serving
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn serves_genesis_after_initial_prev() {
        let (node, _dir) = test_node().await;
        let request = BlocksAfterRequest {
            after_hash: Hash256::INITIAL_PREV,
            count: 10,
            zip: false,
            from_all_branches: false,
        };
        match node.serve_blocks_after(&request).await.unwrap() {
            Some(BlocksAfterResponse::Blocks { blocks, .. }) => {
                assert_eq!(blocks.len(), 1);
                assert_eq!(blocks[0].hash, genesis::genesis_hash());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn tip_and_unknown_hash_responses() {
        let (node, _dir) = test_node().await;
        let at_tip = BlocksAfterRequest {
            after_hash: genesis::genesis_hash(),
            count: 10,
            zip: true,
            from_all_branches: true,
        };
        assert_eq!(node.serve_blocks_after(&at_tip).await.unwrap(), Some(BlocksAfterResponse::NoBlockAfter));

        let unknown = BlocksAfterRequest { after_hash: Hash256([0x42; 32]), ..at_tip };
        assert_eq!(
            node.serve_blocks_after(&unknown).await.unwrap(),
            Some(BlocksAfterResponse::NoBlock { chain_length: 1 })
        );
    }

    // ------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn run_stops_on_termination() {
        let (node, _dir) = test_node().await;
        let handle = {
            let node = Arc::clone(&node);
            tokio::spawn(async move { node.run().await })
        };
        node.termination().request();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn run_stops_on_fatal_halt() {
        let (node, _dir) = test_node().await;
        let handle = {
            let node = Arc::clone(&node);
            tokio::spawn(async move { node.run().await })
        };
        node.fatal().raise(&"test halt");
        assert!(matches!(handle.await.unwrap(), Err(BrookError::Halted(_))));
    }
}

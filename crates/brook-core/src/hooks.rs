//! Extension hooks.
//!
//! External modules observe ledger events by implementing [`LedgerHook`].
//! Every method has a no-op default, so a hook only overrides the events it
//! cares about. Hooks run one after another in registration order, each
//! awaited before the next starts. The first failure stops dispatch and
//! comes back as a [`HookError`], which callers treat as fatal.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::HookError;
use crate::types::{Hash256, Transaction};

pub type HookResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

#[async_trait]
pub trait LedgerHook: Send + Sync {
    async fn on_branch_added(&self, _branch_id: u64) -> HookResult {
        Ok(())
    }

    async fn on_branch_became_master(&self, _branch_id: u64) -> HookResult {
        Ok(())
    }

    async fn on_switched_master_branch(&self, _from_id: u64, _to_id: u64) -> HookResult {
        Ok(())
    }

    async fn on_empty_branch_removed(&self, _branch_id: u64) -> HookResult {
        Ok(())
    }

    async fn on_branches_merged(&self, _from_id: u64, _to_id: u64) -> HookResult {
        Ok(())
    }

    async fn on_free_tx_added(&self, _tx: &Transaction) -> HookResult {
        Ok(())
    }

    async fn on_free_tx_removed(&self, _hash: &Hash256) -> HookResult {
        Ok(())
    }

    async fn on_before_checkpoint_save(&self) -> HookResult {
        Ok(())
    }

    async fn on_checkpoint_saved(&self, _path: &Path) -> HookResult {
        Ok(())
    }

    async fn on_checkpoint_loaded(&self, _path: &Path) -> HookResult {
        Ok(())
    }

    async fn on_ledger_ready(&self) -> HookResult {
        Ok(())
    }
}

#[derive(Clone)]
struct Registered {
    name: String,
    hook: Arc<dyn LedgerHook>,
}

/// Registration table of hooks, in registration order.
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<Vec<Registered>>,
}

macro_rules! dispatch {
    ($registry:expr, $event:literal, |$hook:ident| $call:expr) => {{
        for Registered { name, hook: $hook } in $registry.snapshot() {
            debug!(hook = %name, event = $event, "running hook");
            if let Err(e) = $call.await {
                return Err(HookError::Failed { hook: name, event: $event, reason: e.to_string() });
            }
        }
        Ok(())
    }};
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `hook` under `name` unless that name is already taken.
    pub fn register_if_needed(&self, name: &str, hook: Arc<dyn LedgerHook>) -> bool {
        let mut hooks = self.hooks.write();
        if hooks.iter().any(|r| r.name == name) {
            return false;
        }
        hooks.push(Registered { name: name.to_string(), hook });
        true
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut hooks = self.hooks.write();
        let before = hooks.len();
        hooks.retain(|r| r.name != name);
        hooks.len() != before
    }

    pub fn names(&self) -> Vec<String> {
        self.hooks.read().iter().map(|r| r.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.hooks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.read().is_empty()
    }

    // The table is cloned so no lock is held while hooks run.
    fn snapshot(&self) -> Vec<Registered> {
        self.hooks.read().clone()
    }

    pub async fn branch_added(&self, branch_id: u64) -> Result<(), HookError> {
        dispatch!(self, "on_branch_added", |h| h.on_branch_added(branch_id))
    }

    pub async fn branch_became_master(&self, branch_id: u64) -> Result<(), HookError> {
        dispatch!(self, "on_branch_became_master", |h| h.on_branch_became_master(branch_id))
    }

    pub async fn switched_master_branch(&self, from_id: u64, to_id: u64) -> Result<(), HookError> {
        dispatch!(self, "on_switched_master_branch", |h| h.on_switched_master_branch(from_id, to_id))
    }

    pub async fn empty_branch_removed(&self, branch_id: u64) -> Result<(), HookError> {
        dispatch!(self, "on_empty_branch_removed", |h| h.on_empty_branch_removed(branch_id))
    }

    pub async fn branches_merged(&self, from_id: u64, to_id: u64) -> Result<(), HookError> {
        dispatch!(self, "on_branches_merged", |h| h.on_branches_merged(from_id, to_id))
    }

    pub async fn free_tx_added(&self, tx: &Transaction) -> Result<(), HookError> {
        dispatch!(self, "on_free_tx_added", |h| h.on_free_tx_added(tx))
    }

    pub async fn free_tx_removed(&self, hash: &Hash256) -> Result<(), HookError> {
        dispatch!(self, "on_free_tx_removed", |h| h.on_free_tx_removed(hash))
    }

    pub async fn before_checkpoint_save(&self) -> Result<(), HookError> {
        dispatch!(self, "on_before_checkpoint_save", |h| h.on_before_checkpoint_save())
    }

    pub async fn checkpoint_saved(&self, path: &Path) -> Result<(), HookError> {
        dispatch!(self, "on_checkpoint_saved", |h| h.on_checkpoint_saved(path))
    }

    pub async fn checkpoint_loaded(&self, path: &Path) -> Result<(), HookError> {
        dispatch!(self, "on_checkpoint_loaded", |h| h.on_checkpoint_loaded(path))
    }

    pub async fn ledger_ready(&self) -> Result<(), HookError> {
        dispatch!(self, "on_ledger_ready", |h| h.on_ledger_ready())
    }
}

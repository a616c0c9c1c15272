//! Crash-safe ledger checkpoints.
//!
//! Two slots alternate under `checkpoints/`. A save always writes the slot
//! that is not the last good one, drops a `ready` marker once the copy and
//! the hooks are done, and only then moves the pointer in the node state
//! file. A crash at any point before that leaves the previous checkpoint
//! in charge.
//!
//! Both save and load hold the ledger lock at allowance 0 for their whole
//! duration. Hooks invoked from here that read the ledger must pass an
//! allowance of at least 1.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use brook_core::error::{BrookError, CheckpointError};

use crate::ledger::Ledger;
use crate::state::{NodeState, StateFile};

const LEDGER_FILE: &str = "ledger.db";
const READY_FILE: &str = "ready";

pub struct CheckpointManager {
    ledger: Arc<Ledger>,
    dir: PathBuf,
    state: Mutex<StateFile>,
}

impl CheckpointManager {
    pub fn new(ledger: Arc<Ledger>, dir: impl Into<PathBuf>, state: StateFile) -> Self {
        Self { ledger, dir: dir.into(), state: Mutex::new(state) }
    }

    pub fn slot_dir(&self, slot: u8) -> PathBuf {
        self.dir.join(slot.to_string())
    }

    pub fn last_checkpoint(&self) -> Option<u8> {
        self.state.lock().state().last_checkpoint
    }

    pub fn state(&self) -> NodeState {
        self.state.lock().state().clone()
    }

    /// Id for plugin `name`, registering it on first sight.
    pub fn register_plugin(&self, name: &str) -> Result<u32, BrookError> {
        let now = chrono::Utc::now().timestamp();
        self.state
            .lock()
            .update(|s| s.register_plugin(name, now))
            .map_err(|e| self.fatal(e))
    }

    /// Write a new checkpoint and return its slot.
    pub async fn save_checkpoint(&self) -> Result<u8, BrookError> {
        self.ledger.fatal().ensure_running()?;
        let mut guard = self.ledger.lock().acquire(0, "CheckpointManager::save").await;
        let _defer = self.ledger.termination().defer();

        let slot = next_slot(self.last_checkpoint());
        let slot_dir = self.slot_dir(slot);
        reset_dir(&slot_dir).map_err(|e| self.fatal(e))?;

        let hooks = self.ledger.hooks();
        self.ledger.hook_outcome(hooks.before_checkpoint_save().await)?;
        self.ledger.backup_to(&slot_dir.join(LEDGER_FILE), 1).await?;
        self.ledger.hook_outcome(hooks.checkpoint_saved(&slot_dir).await)?;

        fs::write(slot_dir.join(READY_FILE), b"")
            .map_err(|e| self.fatal(CheckpointError::Io(format!("{}: {e}", slot_dir.display()))))?;
        self.state
            .lock()
            .update(|s| s.last_checkpoint = Some(slot))
            .map_err(|e| self.fatal(e))?;

        guard.release()?;
        info!(slot, length = self.ledger.length(), "checkpoint saved");
        Ok(slot)
    }

    /// Restore the ledger from the last good checkpoint, if there is one.
    pub async fn load_checkpoint(&self) -> Result<Option<u8>, BrookError> {
        self.ledger.fatal().ensure_running()?;
        let mut guard = self.ledger.lock().acquire(0, "CheckpointManager::load").await;
        let _defer = self.ledger.termination().defer();

        let Some(slot) = self.last_checkpoint() else {
            info!("no checkpoint recorded");
            return Ok(None);
        };
        let slot_dir = self.slot_dir(slot);
        if !slot_dir.join(READY_FILE).exists() {
            warn!(slot, path = %slot_dir.display(), "checkpoint not marked ready, ignoring it");
            return Ok(None);
        }

        self.ledger.restore_from(&slot_dir.join(LEDGER_FILE), 1).await?;
        self.ledger.hook_outcome(self.ledger.hooks().checkpoint_loaded(&slot_dir).await)?;

        guard.release()?;
        info!(slot, length = self.ledger.length(), "checkpoint loaded");
        Ok(Some(slot))
    }

    fn fatal(&self, err: CheckpointError) -> BrookError {
        self.ledger.fatal().check(err.into())
    }
}

fn next_slot(last: Option<u8>) -> u8 {
    match last {
        Some(1) => 2,
        _ => 1,
    }
}

fn reset_dir(dir: &Path) -> Result<(), CheckpointError> {
    if dir.exists() {
        fs::remove_dir_all(dir).map_err(|e| CheckpointError::Io(format!("{}: {e}", dir.display())))?;
    }
    fs::create_dir_all(dir).map_err(|e| CheckpointError::Io(format!("{}: {e}", dir.display())))
}

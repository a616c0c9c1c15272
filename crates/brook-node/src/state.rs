//! Persisted node state.
//!
//! A small JSON document next to the ledger database. It records which
//! checkpoint slot was last completed and the append-only plugin registry.
//! Writes go to a temp file first and are renamed into place, so a crash
//! leaves either the old or the new document.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use brook_core::error::CheckpointError;

/// A registered plugin. Ids are never reused, even after the plugin goes away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginRecord {
    pub name: String,
    pub id: u32,
    /// Unix time of the first registration.
    pub registered_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    /// Slot (1 or 2) of the last complete checkpoint.
    #[serde(default)]
    pub last_checkpoint: Option<u8>,
    #[serde(default)]
    pub plugins: Vec<PluginRecord>,
}

impl NodeState {
    /// Id for `name`, registering it on first sight.
    pub fn register_plugin(&mut self, name: &str, now: i64) -> u32 {
        if let Some(record) = self.plugins.iter().find(|p| p.name == name) {
            return record.id;
        }
        let id = self.plugins.iter().map(|p| p.id).max().map_or(1, |max| max + 1);
        self.plugins.push(PluginRecord { name: name.to_string(), id, registered_at: now });
        id
    }

    pub fn plugin(&self, name: &str) -> Option<&PluginRecord> {
        self.plugins.iter().find(|p| p.name == name)
    }
}

/// File-backed [`NodeState`].
#[derive(Debug)]
pub struct StateFile {
    path: PathBuf,
    state: NodeState,
}

impl StateFile {
    /// Load `path`, or start from the default state when it does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let path = path.into();
        let state = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| CheckpointError::State(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => NodeState::default(),
            Err(e) => return Err(CheckpointError::State(format!("{}: {e}", path.display()))),
        };
        Ok(Self { path, state })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &NodeState {
        &self.state
    }

    /// Apply `f` and persist the result.
    pub fn update<T>(&mut self, f: impl FnOnce(&mut NodeState) -> T) -> Result<T, CheckpointError> {
        let mut next = self.state.clone();
        let out = f(&mut next);
        write_atomic(&self.path, &next)?;
        self.state = next;
        Ok(out)
    }
}

fn write_atomic(path: &Path, state: &NodeState) -> Result<(), CheckpointError> {
    let json = serde_json::to_vec_pretty(state).map_err(|e| CheckpointError::State(e.to_string()))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| CheckpointError::Io(e.to_string()))?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &json).map_err(|e| CheckpointError::Io(e.to_string()))?;
    fs::rename(&tmp, path).map_err(|e| CheckpointError::Io(e.to_string()))?;
    debug!(path = %path.display(), "node state written");
    Ok(())
}

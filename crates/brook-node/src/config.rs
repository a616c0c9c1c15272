//! Node configuration.
//!
//! [`NodeConfig`] has defaults for every field. [`NodeConfig::load`] layers
//! an optional TOML file and then `BROOK_*` environment variables on top of
//! them, e.g. `BROOK_DATA_DIR=/srv/brook` or `BROOK_CHECKPOINT_INTERVAL_SECS=60`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use brook_core::constants::{
    DEFAULT_CHECKPOINT_INTERVAL_SECS, DEFAULT_MAX_PACKET_SIZE, DEFAULT_PRUNE_INTERVAL_SECS, DEFAULT_SYNC_IDLE_SECS,
    DEFAULT_SYNC_INTERVAL_SECS, FREE_TX_TTL_SECS, OUTDATED_BRANCH_DEPTH,
};
use brook_core::error::BrookError;
use brook_core::genesis;
use brook_core::types::Hash256;

/// Configuration for a ledger node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Root directory for the database, checkpoints and node state.
    pub data_dir: PathBuf,
    /// Log filter string (e.g. "info", "brook_node_lib=debug").
    pub log_level: String,
    /// Hex hash of the accepted genesis block. Defaults to the built-in one.
    pub genesis_hash: Option<String>,
    pub checkpoint_interval_secs: u64,
    pub prune_interval_secs: u64,
    /// Branches trailing the chain by more than this many blocks are pruned.
    pub outdated_branch_depth: u64,
    /// How often a running node checks whether it should sync.
    pub sync_interval_secs: u64,
    /// Sync once no block has been added for this long.
    pub sync_idle_secs: u64,
    /// Age after which an unconfirmed transaction is forgotten.
    pub free_tx_ttl_secs: i64,
    /// Upper bound for block-range responses, before compression.
    pub max_packet_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("brook");

        Self {
            data_dir,
            log_level: "info".to_string(),
            genesis_hash: None,
            checkpoint_interval_secs: DEFAULT_CHECKPOINT_INTERVAL_SECS,
            prune_interval_secs: DEFAULT_PRUNE_INTERVAL_SECS,
            outdated_branch_depth: OUTDATED_BRANCH_DEPTH,
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            sync_idle_secs: DEFAULT_SYNC_IDLE_SECS,
            free_tx_ttl_secs: FREE_TX_TTL_SECS,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

impl NodeConfig {
    /// Defaults, then the TOML file at `path` (if given), then `BROOK_*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, BrookError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder
            .add_source(config::Environment::with_prefix("BROOK").try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| BrookError::Config(e.to_string()))
    }

    /// Path to the SQLite ledger database.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("ledger.db")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }

    /// The configured genesis hash, or the built-in genesis.
    pub fn genesis_hash(&self) -> Result<Hash256, BrookError> {
        match &self.genesis_hash {
            None => Ok(genesis::genesis_hash()),
            Some(hex) => Hash256::from_hex(hex)
                .ok_or_else(|| BrookError::Config(format!("invalid genesis hash: {hex}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_data_dir_ends_with_brook() {
        let cfg = NodeConfig::default();
        assert!(cfg.data_dir.ends_with("brook"), "data_dir should end with 'brook': {:?}", cfg.data_dir);
    }

    #[test]
    fn default_intervals() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.checkpoint_interval_secs, 600);
        assert_eq!(cfg.prune_interval_secs, 600);
        assert_eq!(cfg.free_tx_ttl_secs, 600);
        assert_eq!(cfg.sync_interval_secs, 10);
        assert_eq!(cfg.sync_idle_secs, 120);
        assert_eq!(cfg.outdated_branch_depth, 10_000);
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn paths_live_under_data_dir() {
        let cfg = NodeConfig { data_dir: PathBuf::from("/tmp/brook-test"), ..NodeConfig::default() };
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/brook-test/ledger.db"));
        assert_eq!(cfg.checkpoints_dir(), PathBuf::from("/tmp/brook-test/checkpoints"));
        assert_eq!(cfg.state_path(), PathBuf::from("/tmp/brook-test/state.json"));
    }

    #[test]
    fn genesis_hash_defaults_to_builtin() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.genesis_hash().unwrap(), genesis::genesis_hash());
    }

    #[test]
    fn genesis_hash_parses_hex() {
        let cfg = NodeConfig { genesis_hash: Some("ab".repeat(32)), ..NodeConfig::default() };
        assert_eq!(cfg.genesis_hash().unwrap(), Hash256([0xAB; 32]));

        let bad = NodeConfig { genesis_hash: Some("xyz".into()), ..NodeConfig::default() };
        assert!(matches!(bad.genesis_hash(), Err(BrookError::Config(_))));
    }

    #[test]
    fn load_layers_toml_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("brook.toml");
        std::fs::write(&path, "data_dir = \"/srv/brook\"\ncheckpoint_interval_secs = 30\n").unwrap();

        let cfg = NodeConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/srv/brook"));
        assert_eq!(cfg.checkpoint_interval_secs, 30);
        assert_eq!(cfg.prune_interval_secs, 600);
    }

    #[test]
    fn load_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = NodeConfig::load(Some(&dir.path().join("absent.toml")));
        assert!(matches!(result, Err(BrookError::Config(_))));
    }
}

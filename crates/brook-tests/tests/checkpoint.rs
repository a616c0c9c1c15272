//! Checkpoint save/load, slot alternation and crash recovery.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use brook_core::hooks::{HookRegistry, HookResult, LedgerHook};
use brook_node_lib::ingest::NullBroadcaster;
use brook_tests::helpers::*;

#[derive(Default)]
struct CheckpointLog {
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl LedgerHook for CheckpointLog {
    async fn on_before_checkpoint_save(&self) -> HookResult {
        self.calls.lock().push("before_save".into());
        Ok(())
    }

    async fn on_checkpoint_saved(&self, path: &Path) -> HookResult {
        assert!(path.join("ledger.db").exists());
        self.calls.lock().push("saved".into());
        Ok(())
    }

    async fn on_checkpoint_loaded(&self, _path: &Path) -> HookResult {
        self.calls.lock().push("loaded".into());
        Ok(())
    }
}

#[tokio::test]
async fn load_restores_state_at_save_time() {
    let (node, _dir) = test_node().await;
    let early = chain_from(&genesis(), 1, 1, 3);
    submit_all(&node, &early).await;
    assert_eq!(node.save_checkpoint().await.unwrap(), 1);

    let late = chain_from(&early[2], 1, 10, 2);
    submit_all(&node, &late).await;
    assert_eq!(node.ledger().length(), 6);

    assert_eq!(node.load_checkpoint().await.unwrap(), Some(1));
    assert_eq!(node.ledger().length(), 4);
    assert!(node.ledger().block_by_hash(&late[0].hash(), 0).await.unwrap().is_none());
    assert_eq!(node.ledger().master_branch(0).await.unwrap().last_block_hash, early[2].hash());

    // The restored ledger keeps accepting blocks.
    submit_all(&node, &late).await;
    assert_eq!(node.ledger().length(), 6);
}

#[tokio::test]
async fn interrupted_save_keeps_previous_checkpoint() {
    let (node, _dir) = test_node().await;
    let early = chain_from(&genesis(), 1, 1, 2);
    submit_all(&node, &early).await;
    node.save_checkpoint().await.unwrap();

    // A save that died half way: slot 2 has data but no ready marker, and
    // the pointer was never moved.
    let slot2 = node.checkpoints().slot_dir(2);
    std::fs::create_dir_all(&slot2).unwrap();
    std::fs::write(slot2.join("ledger.db"), b"partial copy").unwrap();

    submit_all(&node, &chain_from(&early[1], 1, 10, 3)).await;
    assert_eq!(node.load_checkpoint().await.unwrap(), Some(1));
    assert_eq!(node.ledger().length(), 3);
}

#[tokio::test]
async fn checkpoint_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let blocks = chain_from(&genesis(), 1, 1, 2);
    {
        let node = brook_node_lib::Node::open(
            test_config(&dir),
            Arc::new(brook_node_lib::StandardRules::default()),
            Arc::new(NullBroadcaster),
        )
        .await
        .unwrap();
        submit_all(&node, &blocks).await;
        assert_eq!(node.save_checkpoint().await.unwrap(), 1);
        assert_eq!(node.save_checkpoint().await.unwrap(), 2);
    }

    let node = brook_node_lib::Node::open(
        test_config(&dir),
        Arc::new(brook_node_lib::StandardRules::default()),
        Arc::new(NullBroadcaster),
    )
    .await
    .unwrap();
    assert_eq!(node.checkpoints().last_checkpoint(), Some(2));
    assert_eq!(node.load_checkpoint().await.unwrap(), Some(2));
    assert_eq!(node.ledger().length(), 3);
}

#[tokio::test]
async fn hooks_see_save_and_load() {
    let log = Arc::new(CheckpointLog::default());
    let hooks = Arc::new(HookRegistry::new());
    hooks.register_if_needed("checkpoint-log", log.clone());
    let (node, _dir) = test_node_with(Arc::new(NullBroadcaster), hooks).await;

    node.save_checkpoint().await.unwrap();
    node.load_checkpoint().await.unwrap();
    assert_eq!(*log.calls.lock(), vec!["before_save", "saved", "loaded"]);
}

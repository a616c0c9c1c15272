//! Ingestion pipeline: deduplication, rejection paths, relaying, events and
//! the node event loop.

use std::sync::Arc;
use std::time::Duration;

use brook_core::error::BlockError;
use brook_core::hooks::HookRegistry;
use brook_core::types::Hash256;
use brook_node_lib::ingest::IngestOutcome;
use brook_node_lib::ledger::LedgerEvent;
use brook_tests::helpers::*;

#[tokio::test]
async fn same_block_twice_is_idempotent() {
    let (node, _dir) = test_node().await;
    let block = child_of(&genesis(), 1, 1, vec![]);

    assert!(submit(&node, &block).await.is_accepted());
    assert_eq!(submit(&node, &block).await, IngestOutcome::Known);
    assert_eq!(node.ledger().length(), 2);
    assert_eq!(node.ledger().branches(0).await.unwrap().len(), 1);
}

#[tokio::test]
async fn undecodable_and_mislabelled_blocks_are_malformed() {
    let (node, _dir) = test_node().await;
    let block = child_of(&genesis(), 1, 1, vec![]);

    let garbage = node.ingest(Hash256([1; 32]), b"not a block").await.unwrap();
    assert_eq!(garbage, IngestOutcome::Malformed);

    let mislabelled = node.ingest(Hash256([2; 32]), &block.to_raw().unwrap()).await.unwrap();
    assert_eq!(mislabelled, IngestOutcome::Malformed);
    assert_eq!(node.ledger().length(), 1);
}

#[tokio::test]
async fn orphan_is_reported_as_unknown_parent() {
    let (node, _dir) = test_node().await;
    let parent = child_of(&genesis(), 1, 1, vec![]);
    let orphan = child_of(&parent, 1, 2, vec![]);

    assert_eq!(submit(&node, &orphan).await, IngestOutcome::UnknownParent);
    submit_all(&node, &[parent, orphan]).await;
    assert_eq!(node.ledger().length(), 3);
}

#[tokio::test]
async fn rule_violation_is_rejected_with_reason() {
    let (node, _dir) = test_node().await;
    let mut block = child_of(&genesis(), 1, 1, vec![]);
    block.header.tx_root = Hash256::ZERO;

    assert_eq!(submit(&node, &block).await, IngestOutcome::Rejected(BlockError::InvalidTxRoot));
    assert_eq!(node.ledger().lock().holders(), 0);
}

#[tokio::test]
async fn foreign_genesis_is_rejected() {
    let (node, _dir) = test_node().await;
    let other = make_block(Hash256::INITIAL_PREV, genesis().header.time, vec![make_coinbase(&addr(3), 0)]);
    assert!(matches!(
        submit(&node, &other).await,
        IngestOutcome::Rejected(BlockError::UnexpectedGenesis(_))
    ));
}

#[tokio::test]
async fn termination_aborts_before_commit() {
    let (node, _dir) = test_node().await;
    node.termination().request();

    let block = child_of(&genesis(), 1, 1, vec![]);
    assert_eq!(submit(&node, &block).await, IngestOutcome::Aborted);
    assert_eq!(node.ledger().length(), 1);
    assert!(node.ledger().block_by_hash(&block.hash(), 0).await.unwrap().is_none());
}

#[tokio::test]
async fn accepted_blocks_are_relayed_and_announced() {
    let broadcaster = Arc::new(RecordingBroadcaster::default());
    let (node, _dir) = test_node_with(broadcaster.clone(), Arc::new(HookRegistry::new())).await;
    let mut events = node.ledger().subscribe();

    let block = child_of(&genesis(), 1, 1, vec![]);
    submit_all(&node, &[block.clone()]).await;
    assert_eq!(submit(&node, &block).await, IngestOutcome::Known);

    assert_eq!(broadcaster.relayed().last(), Some(&block.hash()));
    assert_eq!(broadcaster.relayed().iter().filter(|h| **h == block.hash()).count(), 1);

    let mut accepted = None;
    while let Ok(event) = events.try_recv() {
        if let LedgerEvent::BlockAccepted { hash, branch_id, height } = event {
            accepted = Some((hash, branch_id, height));
        }
    }
    assert_eq!(accepted, Some((block.hash(), 1, 1)));
}

#[tokio::test]
async fn event_loop_drops_confirmed_free_transactions() {
    let (node, _dir) = test_node().await;
    let runner = {
        let node = Arc::clone(&node);
        tokio::spawn(async move { node.run().await })
    };
    // Let the loop subscribe to ledger events before anything is ingested.
    tokio::task::yield_now().await;

    let spend = make_tx(&[(genesis().transactions[0].hash(), 0)], vec![(10, addr(4))]);
    let unrelated = make_tx(&[(Hash256([0x77; 32]), 1)], vec![(1, addr(5))]);
    node.add_free_tx(spend.clone()).await.unwrap();
    node.add_free_tx(unrelated.clone()).await.unwrap();

    submit_all(&node, &[child_of(&genesis(), 1, 1, vec![spend])]).await;

    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while node.free_txs().len() != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(drained.is_ok(), "confirmed transaction still pooled");
    assert_eq!(node.free_txs(), vec![unrelated]);

    node.termination().request();
    runner.await.unwrap().unwrap();
}

//! Fork choice and reorganization scenarios, driven through ingestion.

use brook_core::error::BlockError;
use brook_core::genesis::{GENESIS_ADDRESS, GENESIS_AMOUNT};
use brook_core::types::Hash256;
use brook_node_lib::ingest::IngestOutcome;
use brook_tests::helpers::*;

fn genesis_output() -> (Hash256, u32) {
    (genesis().transactions[0].hash(), 0)
}

// ------------------------------------------------------------------
// Master selection
// ------------------------------------------------------------------

#[tokio::test]
async fn equal_length_fork_keeps_lower_id_master() {
    let (node, _dir) = test_node().await;
    let g = genesis();
    let main = chain_from(&g, 1, 1, 5);
    submit_all(&node, &main).await;
    assert_eq!(node.ledger().length(), 6);

    // Fork off after main[2] (height 3).
    let fork = chain_from(&main[2], 2, 100, 2);
    match submit(&node, &fork[0]).await {
        IngestOutcome::Accepted { branch_id, height, forked } => {
            assert_eq!(branch_id, 2);
            assert_eq!(height, 4);
            assert!(forked);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(
        submit(&node, &fork[1]).await,
        IngestOutcome::Accepted { branch_id: 2, height: 5, forked: false }
    );

    let branch = node.ledger().branch(2, 0).await.unwrap().unwrap();
    assert_eq!(branch.length, 6);
    assert_eq!(branch.last_block_hash, fork[1].hash());
    assert_eq!(node.ledger().master_branch(0).await.unwrap().id, 1);

    let longer = child_of(&fork[1], 2, 102, vec![]);
    submit_all(&node, &[longer.clone()]).await;
    let master = node.ledger().master_branch(0).await.unwrap();
    assert_eq!(master.id, 2);
    assert_eq!(master.length, 7);
    let at_four = node.ledger().master_block_at_height(4, 0).await.unwrap().unwrap();
    assert_eq!(at_four.meta.hash, fork[0].hash());
    let at_three = node.ledger().master_block_at_height(3, 0).await.unwrap().unwrap();
    assert_eq!(at_three.meta.hash, main[2].hash());
}

#[tokio::test]
async fn fork_at_genesis_records_branch_start() {
    let (node, _dir) = test_node().await;
    let g = genesis();
    submit_all(&node, &chain_from(&g, 1, 1, 2)).await;
    submit_all(&node, &chain_from(&g, 2, 50, 1)).await;

    let branch = node.ledger().branch(2, 0).await.unwrap().unwrap();
    assert_eq!(branch.parent_id, 1);
    assert_eq!(branch.length, 2);
    let structure = node.ledger().branch_structure(2, 0).await.unwrap();
    assert_eq!(structure.ids(), &[2, 1]);
}

// ------------------------------------------------------------------
// Spends across reorganizations
// ------------------------------------------------------------------

#[tokio::test]
async fn reorg_rebuilds_spent_state() {
    let (node, _dir) = test_node().await;
    let g = genesis();
    let payee = addr(9);
    let spend = make_tx(&[genesis_output()], vec![(GENESIS_AMOUNT, payee.clone())]);

    let a1 = child_of(&g, 1, 1, vec![spend.clone()]);
    submit_all(&node, &[a1.clone()]).await;
    assert_eq!(node.ledger().balance(&payee, 0).await.unwrap(), GENESIS_AMOUNT);
    assert_eq!(node.ledger().balance(GENESIS_ADDRESS, 0).await.unwrap(), 0);

    // A competing chain without the spend takes over.
    let b = chain_from(&g, 2, 50, 2);
    submit_all(&node, &b).await;
    assert_eq!(node.ledger().master_branch(0).await.unwrap().id, 2);
    assert_eq!(node.ledger().balance(&payee, 0).await.unwrap(), 0);
    assert_eq!(node.ledger().balance(GENESIS_ADDRESS, 0).await.unwrap(), GENESIS_AMOUNT);

    // The original chain grows back past it.
    let a = chain_from(&a1, 1, 2, 3);
    submit_all(&node, &a).await;
    assert_eq!(node.ledger().master_branch(0).await.unwrap().id, 1);
    assert_eq!(node.ledger().balance(&payee, 0).await.unwrap(), GENESIS_AMOUNT);
    assert_eq!(node.ledger().balance(GENESIS_ADDRESS, 0).await.unwrap(), 0);
}

#[tokio::test]
async fn double_spend_rejected_on_same_chain_but_allowed_on_fork() {
    let (node, _dir) = test_node().await;
    let g = genesis();
    let first = make_tx(&[genesis_output()], vec![(GENESIS_AMOUNT, addr(9))]);
    let second = make_tx(&[genesis_output()], vec![(GENESIS_AMOUNT, addr(8))]);

    let a1 = child_of(&g, 1, 1, vec![first]);
    submit_all(&node, &[a1.clone()]).await;

    let a2 = child_of(&a1, 1, 2, vec![second.clone()]);
    assert!(matches!(
        submit(&node, &a2).await,
        IngestOutcome::Rejected(BlockError::AlreadySpent(_))
    ));

    // On a longer competing chain the same output is still unspent.
    let b = chain_from(&g, 2, 50, 2);
    submit_all(&node, &b).await;
    let b3 = child_of(&b[1], 2, 52, vec![second]);
    submit_all(&node, &[b3]).await;
    assert_eq!(node.ledger().balance(&addr(8), 0).await.unwrap(), GENESIS_AMOUNT);
    assert_eq!(node.ledger().balance(&addr(9), 0).await.unwrap(), 0);
}

#[tokio::test]
async fn spend_of_output_created_in_same_block() {
    let (node, _dir) = test_node().await;
    let g = genesis();
    let first = make_tx(&[genesis_output()], vec![(GENESIS_AMOUNT, addr(9))]);
    let chained = make_tx(&[(first.hash(), 0)], vec![(GENESIS_AMOUNT, addr(7))]);
    submit_all(&node, &[child_of(&g, 1, 1, vec![first, chained])]).await;

    assert_eq!(node.ledger().balance(&addr(9), 0).await.unwrap(), 0);
    assert_eq!(node.ledger().balance(&addr(7), 0).await.unwrap(), GENESIS_AMOUNT);
}

#[tokio::test]
async fn unknown_output_rejected() {
    let (node, _dir) = test_node().await;
    let g = genesis();
    let bogus = make_tx(&[(Hash256([0x55; 32]), 0)], vec![(1, addr(9))]);
    assert!(matches!(
        submit(&node, &child_of(&g, 1, 1, vec![bogus])).await,
        IngestOutcome::Rejected(BlockError::UnknownOutput(_))
    ));
    assert_eq!(node.ledger().length(), 1);
}

// ------------------------------------------------------------------
// Shrinking branches
// ------------------------------------------------------------------

#[tokio::test]
async fn shrinking_to_fork_point_folds_child_branch() {
    let (node, _dir) = test_node().await;
    let g = genesis();
    let main = chain_from(&g, 1, 1, 3); // heights 1..=3
    submit_all(&node, &main).await;
    let fork = chain_from(&main[0], 2, 100, 4); // heights 2..=5
    submit_all(&node, &fork).await;
    assert_eq!(node.ledger().master_branch(0).await.unwrap().id, 2);

    let ledger = node.ledger();
    assert!(ledger.remove_last_block_of_branch(1, 0).await.unwrap());
    assert!(!ledger.remove_last_block_of_branch(1, 0).await.unwrap());

    let branches = ledger.branches(0).await.unwrap();
    assert_eq!(branches.len(), 1);
    let root = &branches[0];
    assert_eq!(root.id, 1);
    assert!(root.is_master);
    assert_eq!(root.length, 6);
    assert_eq!(root.last_block_hash, fork[3].hash());
    assert!(ledger.block_by_hash(&main[2].hash(), 0).await.unwrap().is_none());
    let meta = ledger.block_meta_by_hash(&fork[0].hash(), 0).await.unwrap().unwrap();
    assert_eq!(meta.branch_id, 1);
}

#[tokio::test]
async fn removing_a_fork_restores_previous_master() {
    let (node, _dir) = test_node().await;
    let g = genesis();
    let main = chain_from(&g, 1, 1, 3);
    submit_all(&node, &main).await;
    let fork = chain_from(&main[1], 2, 100, 3);
    submit_all(&node, &fork).await;
    assert_eq!(node.ledger().master_branch(0).await.unwrap().id, 2);

    node.ledger().remove_branch(2, 0).await.unwrap();

    let branches = node.ledger().branches(0).await.unwrap();
    assert_eq!(branches.len(), 1);
    assert_eq!(node.ledger().master_branch(0).await.unwrap().id, 1);
    assert_eq!(node.ledger().length(), 4);
    for block in &fork {
        assert!(node.ledger().block_by_hash(&block.hash(), 0).await.unwrap().is_none());
    }
    assert_eq!(node.ledger().balance(&addr(2), 0).await.unwrap(), 0);
    assert_eq!(node.ledger().balance(&addr(1), 0).await.unwrap(), 3 * COINBASE_AMOUNT);
}

#[tokio::test]
async fn short_forks_are_not_outdated() {
    let (node, _dir) = test_node().await;
    let g = genesis();
    submit_all(&node, &chain_from(&g, 1, 1, 4)).await;
    submit_all(&node, &chain_from(&g, 2, 50, 1)).await;

    assert!(node.ledger().find_outdated_branch(0).await.unwrap().is_none());
    assert_eq!(node.ledger().remove_outdated_branches(0).await.unwrap(), 0);
    assert_eq!(node.ledger().branches(0).await.unwrap().len(), 2);
}

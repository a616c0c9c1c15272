//! Shared builders for scenario tests.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use brook_core::genesis;
use brook_core::hooks::HookRegistry;
use brook_core::types::{Block, BlockHeader, Hash256, Transaction, TxInput, TxOutput, transactions_root};
use brook_network::{BlocksAfterRequest, BlocksAfterResponse};
use brook_node_lib::config::NodeConfig;
use brook_node_lib::ingest::{BlockBroadcaster, IngestOutcome, NullBroadcaster};
use brook_node_lib::node::Node;
use brook_node_lib::rules::StandardRules;
use brook_node_lib::sync::BlockSource;

/// Seconds between consecutive test blocks.
pub const BLOCK_SPACING: u64 = 60;

pub const COINBASE_AMOUNT: u64 = 50;

/// Address derived from a seed byte.
pub fn addr(seed: u8) -> Vec<u8> {
    vec![seed; 20]
}

/// Coinbase paying `address`. `marker` keeps its hash unique.
pub fn make_coinbase(address: &[u8], marker: u64) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![],
        outputs: vec![TxOutput { address: address.to_vec(), amount: COINBASE_AMOUNT }],
        lock_time: marker,
    }
}

/// Transaction spending `inputs` into `outputs`.
pub fn make_tx(inputs: &[(Hash256, u32)], outputs: Vec<(u64, Vec<u8>)>) -> Transaction {
    Transaction {
        version: 1,
        inputs: inputs.iter().map(|&(tx_hash, out_n)| TxInput { tx_hash, out_n }).collect(),
        outputs: outputs
            .into_iter()
            .map(|(amount, address)| TxOutput { address, amount })
            .collect(),
        lock_time: 0,
    }
}

/// Block with a correct transaction root.
pub fn make_block(prev_block: Hash256, time: u64, transactions: Vec<Transaction>) -> Block {
    Block {
        header: BlockHeader {
            version: 1,
            prev_block,
            time,
            diff: 1,
            nonce: 0,
            tx_root: transactions_root(&transactions),
        },
        transactions,
    }
}

/// Block on top of `prev` with a coinbase for `miner` followed by `extra`.
pub fn child_of(prev: &Block, miner: u8, marker: u64, extra: Vec<Transaction>) -> Block {
    let mut txs = vec![make_coinbase(&addr(miner), marker)];
    txs.extend(extra);
    make_block(prev.hash(), prev.header.time + BLOCK_SPACING, txs)
}

/// `count` empty blocks on top of `prev`, markers starting at `first_marker`.
pub fn chain_from(prev: &Block, miner: u8, first_marker: u64, count: usize) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::with_capacity(count);
    for i in 0..count {
        let parent = blocks.last().unwrap_or(prev);
        blocks.push(child_of(parent, miner, first_marker + i as u64, vec![]));
    }
    blocks
}

pub fn genesis() -> Block {
    genesis::genesis_block().clone()
}

// ------------------------------------------------------------------
// Nodes
// ------------------------------------------------------------------

pub fn test_config(dir: &tempfile::TempDir) -> NodeConfig {
    NodeConfig { data_dir: dir.path().to_path_buf(), ..NodeConfig::default() }
}

/// Node with standard rules and no peers, backed by a temp directory.
pub async fn test_node() -> (Arc<Node>, tempfile::TempDir) {
    test_node_with(Arc::new(NullBroadcaster), Arc::new(HookRegistry::new())).await
}

pub async fn test_node_with(
    broadcaster: Arc<dyn BlockBroadcaster>,
    hooks: Arc<HookRegistry>,
) -> (Arc<Node>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let node = Node::open_with_hooks(test_config(&dir), Arc::new(StandardRules::default()), broadcaster, hooks)
        .await
        .unwrap();
    (node, dir)
}

/// Ingest `block` as announced by its own header hash.
pub async fn submit(node: &Node, block: &Block) -> IngestOutcome {
    node.ingest(block.hash(), &block.to_raw().unwrap()).await.unwrap()
}

/// Ingest every block, asserting each one is accepted.
pub async fn submit_all(node: &Node, blocks: &[Block]) {
    for block in blocks {
        let outcome = submit(node, block).await;
        assert!(outcome.is_accepted(), "block {} not accepted: {outcome:?}", block.hash().short());
    }
}

// ------------------------------------------------------------------
// Peers
// ------------------------------------------------------------------

/// Block source answering from in-process nodes, through the wire codec.
pub struct PeerSource {
    peers: Vec<Arc<Node>>,
}

impl PeerSource {
    pub fn new(peers: Vec<Arc<Node>>) -> Self {
        Self { peers }
    }
}

#[async_trait]
impl BlockSource for PeerSource {
    async fn request_blocks_after(&self, request: BlocksAfterRequest) -> Vec<BlocksAfterResponse> {
        let wire_request = BlocksAfterRequest::decode(&request.encode()).unwrap();
        let mut responses = Vec::new();
        for peer in &self.peers {
            if let Some(response) = peer.serve_blocks_after(&wire_request).await.unwrap() {
                responses.push(BlocksAfterResponse::decode(&response.encode().unwrap()).unwrap());
            }
        }
        responses
    }
}

/// Broadcaster that remembers what it relayed.
#[derive(Default)]
pub struct RecordingBroadcaster {
    relayed: Mutex<Vec<Hash256>>,
}

impl RecordingBroadcaster {
    pub fn relayed(&self) -> Vec<Hash256> {
        self.relayed.lock().clone()
    }
}

#[async_trait]
impl BlockBroadcaster for RecordingBroadcaster {
    async fn broadcast(&self, hash: &Hash256, _raw: &[u8]) {
        self.relayed.lock().push(*hash);
    }
}

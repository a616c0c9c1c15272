//! Built-in genesis block.
//!
//! Nodes that are not configured with another genesis hash accept this block
//! as the only child of [`Hash256::INITIAL_PREV`].

use std::sync::LazyLock;

use crate::types::{Block, BlockHeader, Hash256, Transaction, TxOutput, transactions_root};

/// Genesis timestamp: January 1, 2026 00:00:00 UTC.
pub const GENESIS_TIME: u64 = 1_767_225_600;

/// Address credited by the genesis coinbase.
pub const GENESIS_ADDRESS: &[u8] = b"brook genesis";

pub const GENESIS_AMOUNT: u64 = 50 * 100_000_000;

struct GenesisData {
    block: Block,
    raw: Vec<u8>,
    hash: Hash256,
}

static GENESIS: LazyLock<GenesisData> = LazyLock::new(build_genesis);

fn build_genesis() -> GenesisData {
    let coinbase = Transaction {
        version: 1,
        inputs: vec![],
        outputs: vec![TxOutput { address: GENESIS_ADDRESS.to_vec(), amount: GENESIS_AMOUNT }],
        lock_time: 0,
    };
    let transactions = vec![coinbase];
    let block = Block {
        header: BlockHeader {
            version: 1,
            prev_block: Hash256::INITIAL_PREV,
            time: GENESIS_TIME,
            diff: u64::MAX,
            nonce: 0,
            tx_root: transactions_root(&transactions),
        },
        transactions,
    };
    let hash = block.hash();
    // Only plain integers and byte vectors are encoded; bincode cannot fail here.
    let raw = block.to_raw().unwrap_or_default();
    GenesisData { block, raw, hash }
}

pub fn genesis_block() -> &'static Block {
    &GENESIS.block
}

pub fn genesis_raw() -> &'static [u8] {
    &GENESIS.raw
}

pub fn genesis_hash() -> Hash256 {
    GENESIS.hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_is_deterministic() {
        assert_eq!(genesis_hash(), build_genesis().hash);
    }

    #[test]
    fn genesis_follows_sentinel() {
        assert!(genesis_block().is_genesis());
        assert_eq!(genesis_block().transactions.len(), 1);
        assert!(genesis_block().transactions[0].is_coinbase());
    }

    #[test]
    fn genesis_raw_decodes() {
        let decoded = Block::from_raw(genesis_raw()).unwrap();
        assert_eq!(decoded.hash(), genesis_hash());
    }
}

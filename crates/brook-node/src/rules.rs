//! Block validation rules.
//!
//! Ingestion validates every block against the current master structure
//! through [`BlockRules`]. Proof-of-work, signatures and fee policy belong to
//! other implementations of the trait; [`StandardRules`] only enforces the
//! structural and spending rules the ledger itself relies on.

use std::collections::HashSet;

use async_trait::async_trait;

use brook_core::branch::BranchStructure;
use brook_core::constants::MAX_FUTURE_BLOCK_TIME_SECS;
use brook_core::error::{BlockError, BrookError};
use brook_core::types::{Block, Hash256, TxInput, transactions_root};

use crate::ledger::Ledger;

#[async_trait]
pub trait BlockRules: Send + Sync {
    /// Check `block` against the chain described by `structure`.
    ///
    /// `Err(BrookError::Block(_))` rejects the block. Any other error is an
    /// internal failure and aborts ingestion.
    async fn validate(
        &self,
        ledger: &Ledger,
        block: &Block,
        structure: &BranchStructure,
        allowance: usize,
    ) -> Result<(), BrookError>;
}

/// Shape and spending rules.
#[derive(Debug, Clone)]
pub struct StandardRules {
    max_future_secs: u64,
}

impl Default for StandardRules {
    fn default() -> Self {
        Self::new(MAX_FUTURE_BLOCK_TIME_SECS)
    }
}

impl StandardRules {
    pub fn new(max_future_secs: u64) -> Self {
        Self { max_future_secs }
    }

    /// Rules that need no ledger access, evaluated at unix time `now`.
    pub fn check_shape(&self, block: &Block, now: u64) -> Result<(), BlockError> {
        let Some(first) = block.transactions.first() else {
            return Err(BlockError::NoTransactions);
        };
        if !first.is_coinbase() {
            return Err(BlockError::FirstTxNotCoinbase);
        }
        if block.transactions.iter().skip(1).any(|tx| tx.is_coinbase()) {
            return Err(BlockError::MultipleCoinbase);
        }
        if transactions_root(&block.transactions) != block.header.tx_root {
            return Err(BlockError::InvalidTxRoot);
        }
        if block.header.time > now.saturating_add(self.max_future_secs) {
            return Err(BlockError::TimestampTooFar(block.header.time));
        }

        let mut seen = HashSet::new();
        for tx in &block.transactions {
            if tx.outputs.is_empty() {
                return Err(BlockError::NoOutputs(tx.hash().to_string()));
            }
            for input in &tx.inputs {
                if !seen.insert(input) {
                    return Err(BlockError::DuplicateInput(input.to_string()));
                }
            }
        }
        Ok(())
    }

    /// Every input must spend an output that exists on `structure`, or that
    /// an earlier transaction of the same block created, and that nothing on
    /// `structure` has spent yet.
    async fn check_inputs(
        &self,
        ledger: &Ledger,
        block: &Block,
        structure: &BranchStructure,
        allowance: usize,
    ) -> Result<(), BrookError> {
        let mut created: HashSet<(Hash256, u32)> = HashSet::new();
        for tx in &block.transactions {
            for input in &tx.inputs {
                if created.contains(&(input.tx_hash, input.out_n)) {
                    continue;
                }
                self.check_input(ledger, input, structure, allowance).await?;
            }
            let tx_hash = tx.hash();
            created.extend((0..tx.outputs.len() as u32).map(|n| (tx_hash, n)));
        }
        Ok(())
    }

    async fn check_input(
        &self,
        ledger: &Ledger,
        input: &TxInput,
        structure: &BranchStructure,
        allowance: usize,
    ) -> Result<(), BrookError> {
        let output = ledger
            .output_in_branch_structure(&input.tx_hash, input.out_n, structure, allowance)
            .await?;
        if output.is_none() {
            return Err(BlockError::UnknownOutput(input.to_string()).into());
        }
        let spent = ledger
            .tx_out_spent_in_branch_structure(&input.tx_hash, input.out_n, structure, allowance)
            .await?;
        if spent.is_some() {
            return Err(BlockError::AlreadySpent(input.to_string()).into());
        }
        Ok(())
    }
}

#[async_trait]
impl BlockRules for StandardRules {
    async fn validate(
        &self,
        ledger: &Ledger,
        block: &Block,
        structure: &BranchStructure,
        allowance: usize,
    ) -> Result<(), BrookError> {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        self.check_shape(block, now)?;
        self.check_inputs(ledger, block, structure, allowance).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brook_core::types::{BlockHeader, Transaction, TxOutput};

    const NOW: u64 = 1_800_000_000;

    fn coinbase(marker: u64) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![],
            outputs: vec![TxOutput { address: b"miner".to_vec(), amount: 50 }],
            lock_time: marker,
        }
    }

    fn spend(tx_hash: Hash256, out_n: u32) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput { tx_hash, out_n }],
            outputs: vec![TxOutput { address: b"bob".to_vec(), amount: 10 }],
            lock_time: 0,
        }
    }

    fn block_with(transactions: Vec<Transaction>, time: u64) -> Block {
        Block {
            header: BlockHeader {
                version: 1,
                prev_block: Hash256([3; 32]),
                time,
                diff: 1,
                nonce: 0,
                tx_root: transactions_root(&transactions),
            },
            transactions,
        }
    }

    #[test]
    fn accepts_plain_coinbase_block() {
        let rules = StandardRules::default();
        assert_eq!(rules.check_shape(&block_with(vec![coinbase(0)], NOW), NOW), Ok(()));
    }

    #[test]
    fn rejects_empty_block() {
        let rules = StandardRules::default();
        assert_eq!(rules.check_shape(&block_with(vec![], NOW), NOW), Err(BlockError::NoTransactions));
    }

    #[test]
    fn coinbase_must_lead_and_be_unique() {
        let rules = StandardRules::default();
        let leading_spend = block_with(vec![spend(Hash256([1; 32]), 0), coinbase(0)], NOW);
        assert_eq!(rules.check_shape(&leading_spend, NOW), Err(BlockError::FirstTxNotCoinbase));

        let two = block_with(vec![coinbase(0), coinbase(1)], NOW);
        assert_eq!(rules.check_shape(&two, NOW), Err(BlockError::MultipleCoinbase));
    }

    #[test]
    fn rejects_wrong_tx_root() {
        let rules = StandardRules::default();
        let mut block = block_with(vec![coinbase(0)], NOW);
        block.header.tx_root = Hash256::ZERO;
        assert_eq!(rules.check_shape(&block, NOW), Err(BlockError::InvalidTxRoot));
    }

    #[test]
    fn future_limit_is_inclusive() {
        let rules = StandardRules::default();
        let edge = block_with(vec![coinbase(0)], NOW + MAX_FUTURE_BLOCK_TIME_SECS);
        assert_eq!(rules.check_shape(&edge, NOW), Ok(()));

        let late = block_with(vec![coinbase(0)], NOW + MAX_FUTURE_BLOCK_TIME_SECS + 1);
        assert!(matches!(rules.check_shape(&late, NOW), Err(BlockError::TimestampTooFar(_))));
    }

    #[test]
    fn rejects_double_spend_inside_block() {
        let rules = StandardRules::default();
        let funding = Hash256([9; 32]);
        let mut second = spend(funding, 0);
        second.lock_time = 7;
        let block = block_with(vec![coinbase(0), spend(funding, 0), second], NOW);
        assert!(matches!(rules.check_shape(&block, NOW), Err(BlockError::DuplicateInput(_))));
    }

    #[test]
    fn rejects_transaction_without_outputs() {
        let rules = StandardRules::default();
        let mut empty = spend(Hash256([9; 32]), 0);
        empty.outputs.clear();
        let block = block_with(vec![coinbase(0), empty], NOW);
        assert!(matches!(rules.check_shape(&block, NOW), Err(BlockError::NoOutputs(_))));
    }
}

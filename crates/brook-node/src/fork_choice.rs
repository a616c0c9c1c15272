//! Fork-choice engine: every operation that changes the branch forest.
//!
//! Invariants kept here:
//! - exactly one branch is master, and it is the one [`select_master`] picks
//!   (greatest length, ties to the lowest id);
//! - `outs.inMasterBranch` is set exactly for outputs of blocks on the master
//!   structure, and `outs.spentAt` names the master block that spent them;
//! - a branch never loses a block that a child branch builds on. When a
//!   branch shrinks down to the point where a later branch forked, the later
//!   branch is folded back into it.
//!
//! Each operation runs inside the ledger lock and one store transaction, so a
//! failure or a crash leaves no half-applied step.

use tracing::{debug, info, warn};

use brook_core::branch::{Branch, BranchStructure, select_master};
use brook_core::constants::ROOT_BRANCH_ID;
use brook_core::error::{BrookError, StoreError};
use brook_core::types::{Block, Hash256};

use crate::ledger::{
    Ledger, SCAN_YIELD_EVERY, StoreTx, block_in_structure_at_height, contains_block, structure_in, tx_in_structure,
};
use crate::store::LedgerStore;

impl Ledger {
    /// Create a branch forking off `parent_id` after its first `length` blocks.
    pub async fn add_branch(&self, parent_id: u64, length: u64, allowance: usize) -> Result<u64, BrookError> {
        self.fatal.ensure_running()?;
        let mut guard = self.lock.acquire(allowance, "Ledger::add_branch").await;
        let db_tx = StoreTx::begin(self)?;
        let id = self.with_store(|s| {
            let last_block_hash = match length.checked_sub(1) {
                None => Hash256::INITIAL_PREV,
                Some(height) => {
                    let structure = structure_in(s, parent_id)?;
                    block_in_structure_at_height(s, &structure, height)?
                        .map(|meta| meta.hash)
                        .ok_or_else(|| StoreError::MissingBlock(format!("branch {parent_id} height {height}")))?
                }
            };
            s.insert_branch(parent_id, length, &last_block_hash)
        })?;
        self.hook_outcome(self.hooks.branch_added(id).await)?;
        db_tx.commit()?;
        guard.release()?;
        info!(branch_id = id, parent_id, length, "branch added");
        Ok(id)
    }

    /// Append `block` at the tip of `branch_id`, then re-run fork choice.
    ///
    /// Returns the new block id.
    pub async fn add_block_to_branch(
        &self,
        branch_id: u64,
        height: u64,
        block: &Block,
        allowance: usize,
    ) -> Result<u64, BrookError> {
        self.fatal.ensure_running()?;
        let mut guard = self.lock.acquire(allowance, "Ledger::add_block_to_branch").await;
        let _defer = self.termination.defer();
        let hash = block.hash();
        let raw = block.to_raw()?;

        let db_tx = StoreTx::begin(self)?;
        let block_id = self.with_store(|s| {
            let branch = s.branch(branch_id)?.ok_or(StoreError::MissingBranch(branch_id))?;
            if branch.length != height {
                return Err(StoreError::Corrupt(format!(
                    "block {hash} at height {height} does not extend branch {branch_id} of length {}",
                    branch.length
                )));
            }
            let block_id = s.insert_block(branch_id, height, block, &hash, &raw)?;
            let mut master_spends = Vec::new();
            for tx in &block.transactions {
                let tx_hash = tx.hash();
                s.insert_tx(block_id, &tx_hash)?;
                for input in &tx.inputs {
                    s.insert_spend(&input.tx_hash, input.out_n, block_id)?;
                    if branch.is_master {
                        master_spends.push(input);
                    }
                }
                for (out_n, output) in tx.outputs.iter().enumerate() {
                    s.insert_output(block_id, height, &tx_hash, out_n as u32, output, branch.is_master)?;
                }
            }
            // After all outputs exist, so spends of outputs created earlier in
            // this block are marked as well.
            for input in master_spends {
                s.mark_spent_in_master(&input.tx_hash, input.out_n, block_id)?;
            }
            s.update_branch_tip(branch_id, branch.length + 1, &hash)?;
            s.refresh_first_block(branch_id)?;
            Ok(block_id)
        })?;

        self.switch_master_if_needed(allowance + 1).await?;
        db_tx.commit()?;
        let length = self.refresh_length()?;
        guard.release()?;
        debug!(branch_id, height, block_id, hash = %hash.short(), length, "block added to branch");
        Ok(block_id)
    }

    /// Make the best branch master if it is not already.
    ///
    /// Returns whether the master branch changed.
    pub async fn switch_master_if_needed(&self, allowance: usize) -> Result<bool, BrookError> {
        self.fatal.ensure_running()?;
        let mut guard = self.lock.acquire(allowance, "Ledger::switch_master_if_needed").await;
        let _defer = self.termination.defer();
        let (current, best) = self.with_store(|s| {
            let branches = s.branches()?;
            let current = branches.iter().find(|b| b.is_master).cloned().ok_or(StoreError::MissingMaster)?;
            let best = select_master(&branches).cloned().ok_or(StoreError::MissingMaster)?;
            Ok((current, best))
        })?;
        let switched = current.id != best.id;
        if switched {
            self.switch_master(&current, &best).await?;
        }
        guard.release()?;
        Ok(switched)
    }

    /// Move master from `from` to `to` and rebuild the master view of outputs.
    ///
    /// The caller holds the ledger lock.
    async fn switch_master(&self, from: &Branch, to: &Branch) -> Result<(), BrookError> {
        let db_tx = StoreTx::begin(self)?;
        let (from_structure, to_structure) =
            self.with_store(|s| Ok((structure_in(s, from.id)?, structure_in(s, to.id)?)))?;

        let removed = self.blocks_off_structure(&from.last_block_hash, &to_structure).await?;
        let added = self.blocks_off_structure(&to.last_block_hash, &from_structure).await?;

        self.with_store(|s| {
            for block_id in &removed {
                s.clear_master_outputs(*block_id)?;
            }
            s.set_master(to.id)?;
            bring_into_master(s, &added, &to_structure)
        })?;
        self.hook_outcome(self.hooks.switched_master_branch(from.id, to.id).await)?;
        db_tx.commit()?;
        info!(from = from.id, to = to.id, removed = removed.len(), added = added.len(), "switched master branch");
        Ok(())
    }

    /// Ids of the blocks reached by walking back from `tip` until the walk
    /// meets a block of `other`.
    async fn blocks_off_structure(&self, tip: &Hash256, other: &BranchStructure) -> Result<Vec<u64>, BrookError> {
        let mut ids = Vec::new();
        let mut next = *tip;
        while next != Hash256::INITIAL_PREV {
            let current = next;
            let meta = self.with_store(|s| {
                let meta = s
                    .block_meta_by_hash(&current)?
                    .ok_or_else(|| StoreError::MissingBlock(current.to_string()))?;
                Ok((!contains_block(s, &meta, other)?).then_some(meta))
            })?;
            let Some(meta) = meta else { break };
            ids.push(meta.id);
            next = meta.prev_block;
            if ids.len() % SCAN_YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }
        }
        Ok(ids)
    }

    /// Delete the tip block of `branch_id`, then fold or drop the branch if
    /// it ended up empty or back at a fork point, and re-run fork choice.
    ///
    /// Returns whether the branch still exists with blocks of its own.
    pub async fn remove_last_block_of_branch(&self, branch_id: u64, allowance: usize) -> Result<bool, BrookError> {
        self.fatal.ensure_running()?;
        let mut guard = self.lock.acquire(allowance, "Ledger::remove_last_block_of_branch").await;
        let _defer = self.termination.defer();

        let db_tx = StoreTx::begin(self)?;
        let removed_tip = self.with_store(|s| {
            let branch = s.branch(branch_id)?.ok_or(StoreError::MissingBranch(branch_id))?;
            if branch.last_block_hash == Hash256::INITIAL_PREV {
                return Ok(None);
            }
            let meta = s
                .block_meta_by_hash(&branch.last_block_hash)?
                .ok_or_else(|| StoreError::MissingBlock(branch.last_block_hash.to_string()))?;
            // A branch that owns no block yet points into its parent.
            if meta.branch_id != branch_id {
                return Ok(None);
            }
            s.delete_block(meta.id)?;
            s.update_branch_tip(branch_id, branch.length - 1, &meta.prev_block)?;
            s.refresh_first_block(branch_id)?;
            Ok(Some(meta))
        })?;

        let folded_or_deleted = self.remove_branch_if_empty(branch_id, allowance + 1).await?;
        self.switch_master_if_needed(allowance + 1).await?;
        db_tx.commit()?;
        self.refresh_length()?;
        let has_blocks = !folded_or_deleted && self.with_store(|s| s.count_blocks_in_branch(branch_id))? > 0;
        guard.release()?;

        if let Some(meta) = removed_tip {
            info!(branch_id, height = meta.height, hash = %meta.hash.short(), "removed last block of branch");
        }
        Ok(has_blocks)
    }

    /// Remove a branch block by block from its tip.
    ///
    /// Stops early when termination is requested; blocks already removed
    /// stay removed.
    pub async fn remove_branch(&self, branch_id: u64, allowance: usize) -> Result<(), BrookError> {
        self.fatal.ensure_running()?;
        let mut guard = self.lock.acquire(allowance, "Ledger::remove_branch").await;
        let mut removed = 0usize;
        while self.with_store(|s| s.branch(branch_id))?.is_some() {
            if self.termination.is_requested() {
                warn!(branch_id, removed, "branch removal interrupted by termination");
                break;
            }
            let has_blocks = self.remove_last_block_of_branch(branch_id, allowance + 1).await?;
            removed += 1;
            if !has_blocks {
                break;
            }
            if removed % SCAN_YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }
        }
        guard.release()?;
        info!(branch_id, removed, "branch removed");
        Ok(())
    }

    /// Drop `branch_id` if it owns no blocks, or fold into it the later
    /// branch that forks exactly at its tip.
    ///
    /// Returns whether the branch was dropped or absorbed another one.
    pub async fn remove_branch_if_empty(&self, branch_id: u64, allowance: usize) -> Result<bool, BrookError> {
        self.fatal.ensure_running()?;
        let mut guard = self.lock.acquire(allowance, "Ledger::remove_branch_if_empty").await;
        let _defer = self.termination.defer();
        let db_tx = StoreTx::begin(self)?;

        let Some(branch) = self.with_store(|s| s.branch(branch_id))? else {
            db_tx.commit()?;
            guard.release()?;
            return Ok(false);
        };
        let own_blocks = self.with_store(|s| s.count_blocks_in_branch(branch_id))?;
        let changed = if own_blocks == 0 {
            self.delete_empty_branch(&branch).await?
        } else {
            self.fold_next_branch(&branch).await?
        };

        db_tx.commit()?;
        guard.release()?;
        Ok(changed)
    }

    /// The caller holds the ledger lock.
    async fn delete_empty_branch(&self, branch: &Branch) -> Result<bool, BrookError> {
        if branch.id == ROOT_BRANCH_ID {
            debug!("root branch is empty, keeping it");
            return Ok(false);
        }
        if branch.is_master {
            let best = self.with_store(|s| {
                let branches = s.branches()?;
                select_master(branches.iter().filter(|b| b.id != branch.id))
                    .cloned()
                    .ok_or(StoreError::MissingMaster)
            })?;
            self.switch_master(branch, &best).await?;
        }
        self.with_store(|s| {
            s.reparent_branches(branch.id, branch.parent_id)?;
            s.delete_branch(branch.id)
        })?;
        self.hook_outcome(self.hooks.empty_branch_removed(branch.id).await)?;
        info!(branch_id = branch.id, "removed empty branch");
        Ok(true)
    }

    /// The caller holds the ledger lock.
    async fn fold_next_branch(&self, into: &Branch) -> Result<bool, BrookError> {
        let Some(first) = self.with_store(|s| s.child_block_in_later_branch(&into.last_block_hash, into.id))? else {
            return Ok(false);
        };
        let from = self
            .with_store(|s| s.branch(first.branch_id))?
            .ok_or_else(|| self.fatal.check(StoreError::MissingBranch(first.branch_id).into()))?;

        let moved = self.with_store(|s| {
            s.update_branch_tip(into.id, from.length, &from.last_block_hash)?;
            s.delete_branch(from.id)?;
            s.reparent_branches(from.id, into.id)?;
            let moved = s.move_blocks(from.id, into.id)?;
            s.refresh_first_block(into.id)?;
            Ok(moved)
        })?;
        self.hook_outcome(self.hooks.branches_merged(from.id, into.id).await)?;

        if from.is_master {
            self.with_store(|s| s.set_master(into.id))?;
            self.hook_outcome(self.hooks.branch_became_master(into.id).await)?;
        } else if into.is_master {
            // The absorbed blocks now extend the master chain.
            self.with_store(|s| {
                let structure = structure_in(s, into.id)?;
                bring_into_master(s, &moved, &structure)
            })?;
        }
        info!(from = from.id, to = into.id, blocks = moved.len(), "merged branches");
        Ok(true)
    }

    /// The oldest branch trailing the chain length by more than the
    /// outdated depth.
    pub async fn find_outdated_branch(&self, allowance: usize) -> Result<Option<Branch>, BrookError> {
        self.next_outdated_branch(&[], allowance).await
    }

    async fn next_outdated_branch(&self, skip: &[u64], allowance: usize) -> Result<Option<Branch>, BrookError> {
        let _guard = self.lock.acquire(allowance, "Ledger::find_outdated_branch").await;
        let Some(limit) = self.length().checked_sub(self.outdated_depth) else {
            return Ok(None);
        };
        let candidates = self.with_store(|s| s.branches_shorter_than(limit))?;
        Ok(candidates.into_iter().find(|b| !skip.contains(&b.id)))
    }

    /// Remove outdated branches until none is left or termination is
    /// requested. Returns how many removal passes ran.
    ///
    /// A branch that absorbed a shorter fork may still be outdated and is
    /// visited again. A branch whose removal changed nothing (the root) is
    /// skipped for the rest of the sweep.
    pub async fn remove_outdated_branches(&self, allowance: usize) -> Result<usize, BrookError> {
        self.fatal.ensure_running()?;
        let mut guard = self.lock.acquire(allowance, "Ledger::remove_outdated_branches").await;
        let mut stalled = Vec::new();
        let mut passes = 0usize;
        while !self.termination.is_requested() {
            let Some(branch) = self.next_outdated_branch(&stalled, allowance + 1).await? else { break };
            info!(branch_id = branch.id, length = branch.length, chain_length = self.length(), "removing outdated branch");
            self.remove_branch(branch.id, allowance + 1).await?;
            passes += 1;
            let after = self.with_store(|s| s.branch(branch.id))?;
            if after.is_some_and(|b| b.length == branch.length && b.last_block_hash == branch.last_block_hash) {
                stalled.push(branch.id);
            }
        }
        guard.release()?;
        Ok(passes)
    }
}

/// Put `block_ids` into the master view: flag their outputs and point every
/// output they spend at them.
fn bring_into_master(store: &LedgerStore, block_ids: &[u64], master: &BranchStructure) -> Result<(), StoreError> {
    for block_id in block_ids {
        store.set_master_outputs(*block_id)?;
    }
    for block_id in block_ids {
        for (tx_hash, out_n) in store.spends_at(*block_id)? {
            if let Some(funding) = tx_in_structure(store, &tx_hash, master)? {
                store.set_output_spent(funding.id, &tx_hash, out_n, *block_id)?;
            }
        }
    }
    Ok(())
}

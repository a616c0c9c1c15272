//! Branch forest: records, ancestor structures and the fork-choice rule.
//!
//! Branches form a forest through `parent_id` links (0 = root). The
//! ancestor chain of a branch, tip first, is its [`BranchStructure`]; chain
//! membership of a block is decided against it.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::types::Hash256;

/// A candidate chain segment.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Branch {
    pub id: u64,
    /// Parent branch id, 0 for a root branch.
    pub parent_id: u64,
    pub is_master: bool,
    /// Block count along the whole ancestor chain (tip height + 1).
    pub length: u64,
    /// Id of the first block stored in this branch.
    pub block_id: Option<u64>,
    pub last_block_hash: Hash256,
}

/// Fork choice: greatest `length`, ties broken by the smallest `id`.
///
/// Depends only on the set of `(length, id)` pairs, never on input order.
pub fn select_master<'a, I>(branches: I) -> Option<&'a Branch>
where
    I: IntoIterator<Item = &'a Branch>,
{
    branches
        .into_iter()
        .min_by(|a, b| b.length.cmp(&a.length).then(a.id.cmp(&b.id)))
}

/// Ancestor chain of a branch: the branch itself first, the root last.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct BranchStructure(Vec<u64>);

impl BranchStructure {
    pub fn new(ids: Vec<u64>) -> Self {
        Self(ids)
    }

    /// The branch this structure was built for.
    pub fn tip(&self) -> Option<u64> {
        self.0.first().copied()
    }

    pub fn position(&self, branch_id: u64) -> Option<usize> {
        self.0.iter().position(|id| *id == branch_id)
    }

    pub fn contains(&self, branch_id: u64) -> bool {
        self.0.contains(&branch_id)
    }

    /// The branch one step closer to the tip than `index`.
    pub fn child_of(&self, index: usize) -> Option<u64> {
        index.checked_sub(1).and_then(|i| self.0.get(i).copied())
    }

    pub fn ids(&self) -> &[u64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// All branches indexed by id. Parent links are plain ids.
#[derive(Clone, Debug, Default)]
pub struct BranchArena {
    branches: HashMap<u64, Branch>,
}

impl BranchArena {
    pub fn from_branches(branches: impl IntoIterator<Item = Branch>) -> Self {
        Self {
            branches: branches.into_iter().map(|b| (b.id, b)).collect(),
        }
    }

    pub fn get(&self, id: u64) -> Option<&Branch> {
        self.branches.get(&id)
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Branch> {
        self.branches.values()
    }

    pub fn master(&self) -> Option<&Branch> {
        self.branches.values().find(|b| b.is_master)
    }

    pub fn best(&self) -> Option<&Branch> {
        select_master(self.branches.values())
    }

    /// Walk parent links from `id` to the root.
    ///
    /// Stops at a parent that no longer exists. A revisited id is reported
    /// as [`StoreError::BranchCycle`].
    pub fn structure(&self, id: u64) -> Result<BranchStructure, StoreError> {
        let mut ids = Vec::new();
        let mut seen = HashSet::new();
        let mut current = id;
        while current != 0 {
            if !seen.insert(current) {
                return Err(StoreError::BranchCycle(current));
            }
            let Some(branch) = self.branches.get(&current) else { break };
            ids.push(current);
            current = branch.parent_id;
        }
        Ok(BranchStructure(ids))
    }
}

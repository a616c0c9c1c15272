//! Pool of free (not yet confirmed) transactions.
//!
//! Entries expire a fixed number of seconds after insertion. Expiry is
//! lazy: it runs when the pool is consulted through [`FreeTxPool::add_at`]
//! or [`FreeTxPool::is_known_at`], never on a timer.
//!
//! Every insertion and removal is recorded as a [`PoolEvent`]. The owner
//! drains them with [`FreeTxPool::drain_events`] and forwards them to the
//! hook registry, which keeps this type free of async code.
//!
//! Methods taking `now` (unix seconds) exist so tests can drive the clock;
//! the plain variants read `chrono::Utc::now()`.

use std::collections::{BTreeMap, HashMap};

use crate::constants::FREE_TX_TTL_SECS;
use crate::error::MempoolError;
use crate::types::{Block, Hash256, Transaction};

/// A free transaction with its raw bytes and local insertion time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeTx {
    pub hash: Hash256,
    pub tx: Transaction,
    pub raw: Vec<u8>,
    /// Unix seconds at insertion.
    pub added: i64,
}

/// Pool change to report to hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    Added(Transaction),
    Removed(Hash256),
}

/// In-memory free transaction pool, iterated in insertion order.
#[derive(Debug)]
pub struct FreeTxPool {
    ttl_secs: i64,
    next_seq: u64,
    entries: BTreeMap<u64, FreeTx>,
    by_hash: HashMap<Hash256, u64>,
    events: Vec<PoolEvent>,
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

impl FreeTxPool {
    pub fn new(ttl_secs: i64) -> Self {
        Self {
            ttl_secs,
            next_seq: 0,
            entries: BTreeMap::new(),
            by_hash: HashMap::new(),
            events: Vec::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(FREE_TX_TTL_SECS)
    }

    /// Insert a transaction. Fails if its hash is already pooled.
    pub fn add(&mut self, tx: Transaction) -> Result<Hash256, MempoolError> {
        self.add_at(tx, now_secs())
    }

    pub fn add_at(&mut self, tx: Transaction, now: i64) -> Result<Hash256, MempoolError> {
        self.purge_expired_at(now);
        let hash = tx.hash();
        if self.by_hash.contains_key(&hash) {
            return Err(MempoolError::AlreadyExists(hash.to_string()));
        }
        let raw = tx.to_raw().map_err(|e| MempoolError::Malformed(e.to_string()))?;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_hash.insert(hash, seq);
        self.entries.insert(seq, FreeTx { hash, tx: tx.clone(), raw, added: now });
        self.events.push(PoolEvent::Added(tx));
        Ok(hash)
    }

    /// Purge expired entries, then test membership.
    pub fn is_known(&mut self, hash: &Hash256) -> bool {
        self.is_known_at(hash, now_secs())
    }

    pub fn is_known_at(&mut self, hash: &Hash256, now: i64) -> bool {
        self.purge_expired_at(now);
        self.by_hash.contains_key(hash)
    }

    /// Remove a transaction. Returns whether it was pooled.
    pub fn delete(&mut self, hash: &Hash256) -> bool {
        match self.by_hash.remove(hash) {
            Some(seq) => {
                self.entries.remove(&seq);
                self.events.push(PoolEvent::Removed(*hash));
                true
            }
            None => false,
        }
    }

    /// Whether any pooled transaction spends output `out_n` of `tx_hash`.
    pub fn is_output_referenced(&self, tx_hash: &Hash256, out_n: u32) -> bool {
        self.entries.values().any(|entry| {
            entry
                .tx
                .inputs
                .iter()
                .any(|input| input.tx_hash == *tx_hash && input.out_n == out_n)
        })
    }

    /// Drop pooled transactions that a block just confirmed.
    pub fn remove_confirmed(&mut self, block: &Block) -> usize {
        block
            .transactions
            .iter()
            .filter(|tx| self.delete(&tx.hash()))
            .count()
    }

    /// Remove entries older than the TTL. Returns the removed hashes.
    pub fn purge_expired_at(&mut self, now: i64) -> Vec<Hash256> {
        let min_added = now - self.ttl_secs;
        let expired: Vec<Hash256> = self
            .entries
            .values()
            .filter(|entry| entry.added < min_added)
            .map(|entry| entry.hash)
            .collect();
        for hash in &expired {
            self.delete(hash);
        }
        expired
    }

    pub fn get(&self, hash: &Hash256) -> Option<&FreeTx> {
        self.by_hash.get(hash).and_then(|seq| self.entries.get(seq))
    }

    pub fn iter(&self) -> impl Iterator<Item = &FreeTx> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Take the events recorded since the last call.
    pub fn drain_events(&mut self) -> Vec<PoolEvent> {
        std::mem::take(&mut self.events)
    }
}

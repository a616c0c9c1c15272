//! SQLite-backed relational ledger store.
//!
//! Five tables hold the ledger: `branches`, `blocks`, `txs`, `outs` and
//! `spends`. The `inMasterBranch`/`spentAt` columns of `outs` are a view of
//! the master branch that the fork-choice engine keeps up to date; nothing in
//! this module interprets them.
//!
//! The store is synchronous and knows nothing about the ledger lock. Callers
//! serialize access through [`Ledger`](crate::ledger::Ledger). Transactions
//! nest: only the outermost [`LedgerStore::begin`] issues `BEGIN`, inner
//! scopes use savepoints.

use std::path::{Path, PathBuf};

use rusqlite::backup::Progress;
use rusqlite::types::Type;
use rusqlite::{Connection, DatabaseName, OptionalExtension, Row, params};

use brook_core::branch::Branch;
use brook_core::constants::ROOT_BRANCH_ID;
use brook_core::error::{CodecError, StoreError};
use brook_core::types::{Block, Hash256, TxOutput};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS branches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    parentId INTEGER NOT NULL,
    isMaster INTEGER NOT NULL,
    length INTEGER NOT NULL,
    blockId INTEGER,
    lastBlockHash BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS branches_parentId ON branches (parentId);
CREATE INDEX IF NOT EXISTS branches_isMaster ON branches (isMaster);

CREATE TABLE IF NOT EXISTS blocks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    branchId INTEGER NOT NULL,
    height INTEGER NOT NULL,
    prevBlock BLOB NOT NULL,
    time INTEGER NOT NULL,
    hash BLOB NOT NULL,
    data BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS blocks_branchId ON blocks (branchId);
CREATE INDEX IF NOT EXISTS blocks_height ON blocks (height);
CREATE INDEX IF NOT EXISTS blocks_prevBlock ON blocks (prevBlock);
CREATE INDEX IF NOT EXISTS blocks_time ON blocks (time);
CREATE INDEX IF NOT EXISTS blocks_hash ON blocks (hash);

CREATE TABLE IF NOT EXISTS txs (
    id INTEGER PRIMARY KEY,
    blockId INTEGER NOT NULL,
    hash BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS txs_blockId ON txs (blockId);
CREATE INDEX IF NOT EXISTS txs_hash ON txs (hash);

CREATE TABLE IF NOT EXISTS outs (
    id INTEGER PRIMARY KEY,
    blockId INTEGER NOT NULL,
    blockHeight INTEGER NOT NULL,
    txHash BLOB NOT NULL,
    outN INTEGER NOT NULL,
    address BLOB NOT NULL,
    amount INTEGER NOT NULL,
    inMasterBranch INTEGER NOT NULL,
    spentAt INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS outs_blockId ON outs (blockId);
CREATE INDEX IF NOT EXISTS outs_blockHeight ON outs (blockHeight);
CREATE INDEX IF NOT EXISTS outs_txHash ON outs (txHash);
CREATE INDEX IF NOT EXISTS outs_address ON outs (address);
CREATE INDEX IF NOT EXISTS outs_inMasterBranch ON outs (inMasterBranch);
CREATE INDEX IF NOT EXISTS outs_spentAt ON outs (spentAt);

CREATE TABLE IF NOT EXISTS spends (
    id INTEGER PRIMARY KEY,
    txHash BLOB NOT NULL,
    outN INTEGER NOT NULL,
    spentAt INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS spends_txHash ON spends (txHash);
CREATE INDEX IF NOT EXISTS spends_spentAt ON spends (spentAt);
";

const BRANCH_COLUMNS: &str = "id, parentId, isMaster, length, blockId, lastBlockHash";
const META_COLUMNS: &str = "id, branchId, height, prevBlock, time, hash";
const ROW_COLUMNS: &str = "id, branchId, height, prevBlock, time, hash, data";
const OUT_COLUMNS: &str = "id, blockId, blockHeight, txHash, outN, address, amount, inMasterBranch, spentAt";

/// Location and identity of a stored block, without its payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockMeta {
    pub id: u64,
    pub branch_id: u64,
    pub height: u64,
    pub prev_block: Hash256,
    pub time: u64,
    pub hash: Hash256,
}

/// A stored block with its raw payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockRow {
    pub meta: BlockMeta,
    pub data: Vec<u8>,
}

impl BlockRow {
    pub fn block(&self) -> Result<Block, CodecError> {
        Block::from_raw(&self.data)
    }
}

/// One row of the `outs` table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputRow {
    pub id: u64,
    pub block_id: u64,
    pub block_height: u64,
    pub tx_hash: Hash256,
    pub out_n: u32,
    pub address: Vec<u8>,
    pub amount: u64,
    pub in_master_branch: bool,
    /// Id of the master block that spent this output, 0 when unspent.
    pub spent_at: u64,
}

fn sql_err(e: rusqlite::Error) -> StoreError {
    StoreError::Sqlite(e.to_string())
}

fn u64_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    row.get::<_, i64>(idx).map(|v| v as u64)
}

fn hash_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Hash256> {
    let bytes: Vec<u8> = row.get(idx)?;
    Hash256::from_slice(&bytes).ok_or_else(|| rusqlite::Error::InvalidColumnType(idx, "hash".into(), Type::Blob))
}

fn branch_from_row(row: &Row<'_>) -> rusqlite::Result<Branch> {
    Ok(Branch {
        id: u64_at(row, 0)?,
        parent_id: u64_at(row, 1)?,
        is_master: row.get(2)?,
        length: u64_at(row, 3)?,
        block_id: row.get::<_, Option<i64>>(4)?.map(|v| v as u64),
        last_block_hash: hash_at(row, 5)?,
    })
}

fn meta_from_row(row: &Row<'_>) -> rusqlite::Result<BlockMeta> {
    Ok(BlockMeta {
        id: u64_at(row, 0)?,
        branch_id: u64_at(row, 1)?,
        height: u64_at(row, 2)?,
        prev_block: hash_at(row, 3)?,
        time: u64_at(row, 4)?,
        hash: hash_at(row, 5)?,
    })
}

fn block_row_from_row(row: &Row<'_>) -> rusqlite::Result<BlockRow> {
    Ok(BlockRow { meta: meta_from_row(row)?, data: row.get(6)? })
}

fn output_from_row(row: &Row<'_>) -> rusqlite::Result<OutputRow> {
    Ok(OutputRow {
        id: u64_at(row, 0)?,
        block_id: u64_at(row, 1)?,
        block_height: u64_at(row, 2)?,
        tx_hash: hash_at(row, 3)?,
        out_n: row.get(4)?,
        address: row.get(5)?,
        amount: u64_at(row, 6)?,
        in_master_branch: row.get(7)?,
        spent_at: u64_at(row, 8)?,
    })
}

/// Durable ledger tables in a single SQLite file.
pub struct LedgerStore {
    conn: Connection,
    path: PathBuf,
    depth: usize,
}

impl LedgerStore {
    /// Open or create the ledger database at `path`.
    ///
    /// Creates the schema if needed. An empty database gets the root branch
    /// (id 1, master, length 0).
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
        }
        let conn = Connection::open(&path).map_err(sql_err)?;
        let store = Self { conn, path, depth: 0 };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(SCHEMA).map_err(sql_err)?;
        let branches: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM branches", [], |row| row.get(0))
            .map_err(sql_err)?;
        if branches == 0 {
            self.conn
                .execute(
                    "INSERT INTO branches (id, parentId, isMaster, length, blockId, lastBlockHash) VALUES (?1, 0, 1, 0, NULL, ?2)",
                    params![ROOT_BRANCH_ID as i64, &Hash256::INITIAL_PREV.0[..]],
                )
                .map_err(sql_err)?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Open a transaction scope. Nested scopes become savepoints.
    pub fn begin(&mut self) -> Result<(), StoreError> {
        let sql = match self.depth {
            0 => "BEGIN".to_string(),
            d => format!("SAVEPOINT sp{d}"),
        };
        self.conn.execute_batch(&sql).map_err(sql_err)?;
        self.depth += 1;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<(), StoreError> {
        let sql = match self.depth {
            0 => return Err(StoreError::Transaction("commit outside a transaction")),
            1 => "COMMIT".to_string(),
            d => format!("RELEASE sp{}", d - 1),
        };
        self.conn.execute_batch(&sql).map_err(sql_err)?;
        self.depth -= 1;
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<(), StoreError> {
        let sql = match self.depth {
            0 => return Err(StoreError::Transaction("rollback outside a transaction")),
            1 => "ROLLBACK".to_string(),
            d => format!("ROLLBACK TO sp{0}; RELEASE sp{0}", d - 1),
        };
        self.depth -= 1;
        self.conn.execute_batch(&sql).map_err(sql_err)
    }

    pub fn in_transaction(&self) -> bool {
        self.depth > 0
    }

    // ------------------------------------------------------------------
    // Branches
    // ------------------------------------------------------------------

    pub fn branches(&self) -> Result<Vec<Branch>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("SELECT {BRANCH_COLUMNS} FROM branches ORDER BY id"))
            .map_err(sql_err)?;
        let rows = stmt.query_map([], branch_from_row).map_err(sql_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)
    }

    pub fn branch(&self, id: u64) -> Result<Option<Branch>, StoreError> {
        self.conn
            .query_row(
                &format!("SELECT {BRANCH_COLUMNS} FROM branches WHERE id = ?1"),
                params![id as i64],
                branch_from_row,
            )
            .optional()
            .map_err(sql_err)
    }

    /// The master branch. Its absence is a broken invariant.
    pub fn master_branch(&self) -> Result<Branch, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("SELECT {BRANCH_COLUMNS} FROM branches WHERE isMaster = 1"))
            .map_err(sql_err)?;
        let masters = stmt
            .query_map([], branch_from_row)
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        match masters.as_slice() {
            [master] => Ok(master.clone()),
            [] => Err(StoreError::MissingMaster),
            many => Err(StoreError::Corrupt(format!("{} master branches", many.len()))),
        }
    }

    pub fn insert_branch(&self, parent_id: u64, length: u64, last_block_hash: &Hash256) -> Result<u64, StoreError> {
        self.conn
            .execute(
                "INSERT INTO branches (parentId, isMaster, length, blockId, lastBlockHash) VALUES (?1, 0, ?2, NULL, ?3)",
                params![parent_id as i64, length as i64, &last_block_hash.0[..]],
            )
            .map_err(sql_err)?;
        Ok(self.conn.last_insert_rowid() as u64)
    }

    pub fn update_branch_tip(&self, id: u64, length: u64, last_block_hash: &Hash256) -> Result<(), StoreError> {
        self.conn
            .execute(
                "UPDATE branches SET length = ?1, lastBlockHash = ?2 WHERE id = ?3",
                params![length as i64, &last_block_hash.0[..], id as i64],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    /// Make `id` the only master branch.
    pub fn set_master(&self, id: u64) -> Result<(), StoreError> {
        self.conn
            .execute("UPDATE branches SET isMaster = (id = ?1)", params![id as i64])
            .map_err(sql_err)?;
        Ok(())
    }

    /// Point `blockId` at the lowest block the branch owns, or NULL.
    pub fn refresh_first_block(&self, id: u64) -> Result<(), StoreError> {
        self.conn
            .execute(
                "UPDATE branches SET blockId = (SELECT id FROM blocks WHERE branchId = ?1 ORDER BY height LIMIT 1) WHERE id = ?1",
                params![id as i64],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn delete_branch(&self, id: u64) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM branches WHERE id = ?1", params![id as i64])
            .map_err(sql_err)?;
        Ok(())
    }

    /// Move every child of `from` under `to`.
    pub fn reparent_branches(&self, from: u64, to: u64) -> Result<usize, StoreError> {
        self.conn
            .execute("UPDATE branches SET parentId = ?1 WHERE parentId = ?2", params![to as i64, from as i64])
            .map_err(sql_err)
    }

    /// Branches shorter than `length`, oldest first.
    pub fn branches_shorter_than(&self, length: u64) -> Result<Vec<Branch>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("SELECT {BRANCH_COLUMNS} FROM branches WHERE length < ?1 ORDER BY id"))
            .map_err(sql_err)?;
        let rows = stmt.query_map(params![length as i64], branch_from_row).map_err(sql_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)
    }

    // ------------------------------------------------------------------
    // Blocks
    // ------------------------------------------------------------------

    pub fn insert_block(
        &self,
        branch_id: u64,
        height: u64,
        block: &Block,
        hash: &Hash256,
        raw: &[u8],
    ) -> Result<u64, StoreError> {
        self.conn
            .execute(
                "INSERT INTO blocks (branchId, height, prevBlock, time, hash, data) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    branch_id as i64,
                    height as i64,
                    &block.header.prev_block.0[..],
                    block.header.time as i64,
                    &hash.0[..],
                    raw,
                ],
            )
            .map_err(sql_err)?;
        Ok(self.conn.last_insert_rowid() as u64)
    }

    /// Look a block up by hash. Two blocks sharing a hash is corruption.
    pub fn block_meta_by_hash(&self, hash: &Hash256) -> Result<Option<BlockMeta>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("SELECT {META_COLUMNS} FROM blocks WHERE hash = ?1 LIMIT 2"))
            .map_err(sql_err)?;
        let mut metas = stmt
            .query_map(params![&hash.0[..]], meta_from_row)
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        if metas.len() > 1 {
            return Err(StoreError::DuplicateHash(hash.to_string()));
        }
        Ok(metas.pop())
    }

    pub fn block_meta_by_id(&self, id: u64) -> Result<Option<BlockMeta>, StoreError> {
        self.conn
            .query_row(&format!("SELECT {META_COLUMNS} FROM blocks WHERE id = ?1"), params![id as i64], meta_from_row)
            .optional()
            .map_err(sql_err)
    }

    pub fn block_row_by_hash(&self, hash: &Hash256) -> Result<Option<BlockRow>, StoreError> {
        match self.block_meta_by_hash(hash)? {
            Some(meta) => self.block_row_by_id(meta.id),
            None => Ok(None),
        }
    }

    pub fn block_row_by_id(&self, id: u64) -> Result<Option<BlockRow>, StoreError> {
        self.conn
            .query_row(&format!("SELECT {ROW_COLUMNS} FROM blocks WHERE id = ?1"), params![id as i64], block_row_from_row)
            .optional()
            .map_err(sql_err)
    }

    pub fn block_exists_at(&self, branch_id: u64, height: u64) -> Result<bool, StoreError> {
        self.conn
            .query_row(
                "SELECT 1 FROM blocks WHERE branchId = ?1 AND height = ?2 LIMIT 1",
                params![branch_id as i64, height as i64],
                |_| Ok(()),
            )
            .optional()
            .map(|found| found.is_some())
            .map_err(sql_err)
    }

    /// All blocks at `height`, any branch.
    pub fn blocks_at_height(&self, height: u64) -> Result<Vec<BlockMeta>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("SELECT {META_COLUMNS} FROM blocks WHERE height = ?1 ORDER BY branchId"))
            .map_err(sql_err)?;
        let rows = stmt.query_map(params![height as i64], meta_from_row).map_err(sql_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)
    }

    /// Up to `limit` blocks with an id greater than `after_id`, in id order.
    pub fn blocks_after_id(&self, after_id: u64, limit: usize) -> Result<Vec<BlockRow>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("SELECT {ROW_COLUMNS} FROM blocks WHERE id > ?1 ORDER BY id LIMIT ?2"))
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![after_id as i64, limit as i64], block_row_from_row)
            .map_err(sql_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)
    }

    pub fn blocks_in_time_range(&self, from: u64, to: u64) -> Result<Vec<BlockMeta>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("SELECT {META_COLUMNS} FROM blocks WHERE time >= ?1 AND time <= ?2 ORDER BY time, id"))
            .map_err(sql_err)?;
        let rows = stmt.query_map(params![from as i64, to as i64], meta_from_row).map_err(sql_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)
    }

    pub fn count_blocks_in_branch(&self, branch_id: u64) -> Result<u64, StoreError> {
        self.conn
            .query_row("SELECT COUNT(*) FROM blocks WHERE branchId = ?1", params![branch_id as i64], |row| u64_at(row, 0))
            .map_err(sql_err)
    }

    /// Height of the lowest block owned by `branch_id`.
    pub fn first_height_in_branch(&self, branch_id: u64) -> Result<Option<u64>, StoreError> {
        self.conn
            .query_row("SELECT MIN(height) FROM blocks WHERE branchId = ?1", params![branch_id as i64], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .map(|h| h.map(|v| v as u64))
            .map_err(sql_err)
    }

    pub fn max_height(&self) -> Result<Option<u64>, StoreError> {
        self.conn
            .query_row("SELECT MAX(height) FROM blocks", [], |row| row.get::<_, Option<i64>>(0))
            .map(|h| h.map(|v| v as u64))
            .map_err(sql_err)
    }

    /// First block of the lowest-id branch after `branch_id` that builds on `prev_hash`.
    pub fn child_block_in_later_branch(&self, prev_hash: &Hash256, branch_id: u64) -> Result<Option<BlockMeta>, StoreError> {
        self.conn
            .query_row(
                &format!("SELECT {META_COLUMNS} FROM blocks WHERE prevBlock = ?1 AND branchId > ?2 ORDER BY branchId LIMIT 1"),
                params![&prev_hash.0[..], branch_id as i64],
                meta_from_row,
            )
            .optional()
            .map_err(sql_err)
    }

    pub fn move_blocks(&self, from: u64, to: u64) -> Result<Vec<u64>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT id FROM blocks WHERE branchId = ?1 ORDER BY height")
            .map_err(sql_err)?;
        let ids = stmt
            .query_map(params![from as i64], |row| u64_at(row, 0))
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        self.conn
            .execute("UPDATE blocks SET branchId = ?1 WHERE branchId = ?2", params![to as i64, from as i64])
            .map_err(sql_err)?;
        Ok(ids)
    }

    /// Delete a block with its transactions and outputs, and forget the
    /// spends it recorded.
    pub fn delete_block(&self, id: u64) -> Result<(), StoreError> {
        let id = id as i64;
        for sql in [
            "DELETE FROM blocks WHERE id = ?1",
            "DELETE FROM txs WHERE blockId = ?1",
            "DELETE FROM outs WHERE blockId = ?1",
            "UPDATE outs SET spentAt = 0 WHERE spentAt = ?1",
            "DELETE FROM spends WHERE spentAt = ?1",
        ] {
            self.conn.execute(sql, params![id]).map_err(sql_err)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transactions, outputs and spends
    // ------------------------------------------------------------------

    pub fn insert_tx(&self, block_id: u64, hash: &Hash256) -> Result<(), StoreError> {
        self.conn
            .execute("INSERT INTO txs (blockId, hash) VALUES (?1, ?2)", params![block_id as i64, &hash.0[..]])
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn insert_spend(&self, tx_hash: &Hash256, out_n: u32, spent_at: u64) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO spends (txHash, outN, spentAt) VALUES (?1, ?2, ?3)",
                params![&tx_hash.0[..], out_n, spent_at as i64],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn insert_output(
        &self,
        block_id: u64,
        block_height: u64,
        tx_hash: &Hash256,
        out_n: u32,
        output: &TxOutput,
        in_master_branch: bool,
    ) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO outs (blockId, blockHeight, txHash, outN, address, amount, inMasterBranch, spentAt) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
                params![
                    block_id as i64,
                    block_height as i64,
                    &tx_hash.0[..],
                    out_n,
                    &output.address,
                    output.amount as i64,
                    in_master_branch,
                ],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    /// Mark a master output as spent by `block_id`.
    pub fn mark_spent_in_master(&self, tx_hash: &Hash256, out_n: u32, block_id: u64) -> Result<(), StoreError> {
        self.conn
            .execute(
                "UPDATE outs SET spentAt = ?1 WHERE txHash = ?2 AND outN = ?3 AND inMasterBranch = 1",
                params![block_id as i64, &tx_hash.0[..], out_n],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    /// Take a block out of the master view: its outputs leave it, and the
    /// outputs it spent become unspent.
    pub fn clear_master_outputs(&self, block_id: u64) -> Result<(), StoreError> {
        let id = block_id as i64;
        self.conn
            .execute("UPDATE outs SET inMasterBranch = 0, spentAt = 0 WHERE blockId = ?1", params![id])
            .map_err(sql_err)?;
        self.conn
            .execute("UPDATE outs SET spentAt = 0 WHERE spentAt = ?1", params![id])
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn set_master_outputs(&self, block_id: u64) -> Result<(), StoreError> {
        self.conn
            .execute("UPDATE outs SET inMasterBranch = 1 WHERE blockId = ?1", params![block_id as i64])
            .map_err(sql_err)?;
        Ok(())
    }

    /// Inputs recorded by a block, as `(tx_hash, out_n)`.
    pub fn spends_at(&self, block_id: u64) -> Result<Vec<(Hash256, u32)>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT txHash, outN FROM spends WHERE spentAt = ?1 ORDER BY id")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![block_id as i64], |row| Ok((hash_at(row, 0)?, row.get(1)?)))
            .map_err(sql_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)
    }

    /// Ids of every block, in any branch, that spent `(tx_hash, out_n)`.
    pub fn spending_blocks(&self, tx_hash: &Hash256, out_n: u32) -> Result<Vec<u64>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT spentAt FROM spends WHERE txHash = ?1 AND outN = ?2 ORDER BY id")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![&tx_hash.0[..], out_n], |row| u64_at(row, 0))
            .map_err(sql_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)
    }

    pub fn set_output_spent(&self, block_id: u64, tx_hash: &Hash256, out_n: u32, spent_at: u64) -> Result<(), StoreError> {
        self.conn
            .execute(
                "UPDATE outs SET spentAt = ?1 WHERE blockId = ?2 AND txHash = ?3 AND outN = ?4",
                params![spent_at as i64, block_id as i64, &tx_hash.0[..], out_n],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    /// Every block, in any branch, that contains transaction `tx_hash`.
    pub fn blocks_with_tx(&self, tx_hash: &Hash256) -> Result<Vec<BlockMeta>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT b.id, b.branchId, b.height, b.prevBlock, b.time, b.hash \
                 FROM txs t JOIN blocks b ON b.id = t.blockId WHERE t.hash = ?1 ORDER BY b.id",
            )
            .map_err(sql_err)?;
        let rows = stmt.query_map(params![&tx_hash.0[..]], meta_from_row).map_err(sql_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)
    }

    pub fn output_in_block(&self, block_id: u64, tx_hash: &Hash256, out_n: u32) -> Result<Option<OutputRow>, StoreError> {
        self.conn
            .query_row(
                &format!("SELECT {OUT_COLUMNS} FROM outs WHERE blockId = ?1 AND txHash = ?2 AND outN = ?3"),
                params![block_id as i64, &tx_hash.0[..], out_n],
                output_from_row,
            )
            .optional()
            .map_err(sql_err)
    }

    pub fn outputs_in_block(&self, block_id: u64) -> Result<Vec<OutputRow>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("SELECT {OUT_COLUMNS} FROM outs WHERE blockId = ?1 ORDER BY id"))
            .map_err(sql_err)?;
        let rows = stmt.query_map(params![block_id as i64], output_from_row).map_err(sql_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)
    }

    /// Unspent outputs paying `address` in the master view.
    pub fn unspent_master_outputs(&self, address: &[u8]) -> Result<Vec<OutputRow>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!(
                "SELECT {OUT_COLUMNS} FROM outs WHERE address = ?1 AND inMasterBranch = 1 AND spentAt = 0 ORDER BY blockHeight, id"
            ))
            .map_err(sql_err)?;
        let rows = stmt.query_map(params![address], output_from_row).map_err(sql_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)
    }

    // ------------------------------------------------------------------
    // Backup
    // ------------------------------------------------------------------

    /// Copy the whole database to `dest` with SQLite's online backup.
    pub fn backup_to(&self, dest: &Path) -> Result<(), StoreError> {
        if self.in_transaction() {
            return Err(StoreError::Transaction("backup inside a transaction"));
        }
        self.conn
            .backup(DatabaseName::Main, dest, None)
            .map_err(sql_err)
    }

    /// Replace the whole database with the contents of `src`.
    pub fn restore_from(&mut self, src: &Path) -> Result<(), StoreError> {
        if self.in_transaction() {
            return Err(StoreError::Transaction("restore inside a transaction"));
        }
        self.conn
            .restore(DatabaseName::Main, src, None::<fn(Progress)>)
            .map_err(sql_err)?;
        self.init()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brook_core::types::{BlockHeader, Transaction, transactions_root};

    fn temp_store() -> (LedgerStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::open(dir.path().join("ledger.db")).unwrap();
        (store, dir)
    }

    fn block(prev: Hash256, marker: u64) -> Block {
        let txs = vec![Transaction {
            version: 1,
            inputs: vec![],
            outputs: vec![TxOutput { address: b"miner".to_vec(), amount: 50 }],
            lock_time: marker,
        }];
        Block {
            header: BlockHeader {
                version: 1,
                prev_block: prev,
                time: 1_000 + marker,
                diff: 1,
                nonce: marker,
                tx_root: transactions_root(&txs),
            },
            transactions: txs,
        }
    }

    fn insert(store: &LedgerStore, branch_id: u64, height: u64, block: &Block) -> u64 {
        let raw = block.to_raw().unwrap();
        store.insert_block(branch_id, height, block, &block.hash(), &raw).unwrap()
    }

    // ------------------------------------------------------------------
    // Open
    // ------------------------------------------------------------------

    #[test]
    fn fresh_store_has_root_master() {
        let (store, _dir) = temp_store();
        let master = store.master_branch().unwrap();
        assert_eq!(master.id, ROOT_BRANCH_ID);
        assert_eq!(master.parent_id, 0);
        assert_eq!(master.length, 0);
        assert_eq!(master.block_id, None);
        assert_eq!(master.last_block_hash, Hash256::INITIAL_PREV);
        assert_eq!(store.max_height().unwrap(), None);
    }

    #[test]
    fn reopen_keeps_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let b = block(Hash256::INITIAL_PREV, 0);
        {
            let store = LedgerStore::open(&path).unwrap();
            insert(&store, 1, 0, &b);
        }
        let store = LedgerStore::open(&path).unwrap();
        assert_eq!(store.branches().unwrap().len(), 1);
        assert!(store.block_meta_by_hash(&b.hash()).unwrap().is_some());
    }

    // ------------------------------------------------------------------
    // Blocks
    // ------------------------------------------------------------------

    #[test]
    fn block_lookup_by_hash_and_id() {
        let (store, _dir) = temp_store();
        let b = block(Hash256::INITIAL_PREV, 0);
        let id = insert(&store, 1, 0, &b);

        let meta = store.block_meta_by_hash(&b.hash()).unwrap().unwrap();
        assert_eq!(meta.id, id);
        assert_eq!(meta.height, 0);
        assert_eq!(meta.prev_block, Hash256::INITIAL_PREV);

        let row = store.block_row_by_id(id).unwrap().unwrap();
        assert_eq!(row.block().unwrap(), b);
        assert!(store.block_exists_at(1, 0).unwrap());
        assert!(!store.block_exists_at(1, 1).unwrap());
    }

    #[test]
    fn duplicate_hash_is_reported() {
        let (store, _dir) = temp_store();
        let b = block(Hash256::INITIAL_PREV, 0);
        insert(&store, 1, 0, &b);
        insert(&store, 1, 0, &b);
        let err = store.block_meta_by_hash(&b.hash()).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateHash(_)));
    }

    #[test]
    fn ids_are_never_reused() {
        let (store, _dir) = temp_store();
        let a = insert(&store, 1, 0, &block(Hash256::INITIAL_PREV, 0));
        store.delete_block(a).unwrap();
        let b = insert(&store, 1, 0, &block(Hash256::INITIAL_PREV, 1));
        assert!(b > a);
    }

    #[test]
    fn delete_block_reverts_spends() {
        let (store, _dir) = temp_store();
        let funding = Hash256([7; 32]);
        let out = TxOutput { address: b"alice".to_vec(), amount: 5 };
        store.insert_output(99, 0, &funding, 0, &out, true).unwrap();

        let spender = insert(&store, 1, 1, &block(Hash256::INITIAL_PREV, 1));
        store.insert_spend(&funding, 0, spender).unwrap();
        store.mark_spent_in_master(&funding, 0, spender).unwrap();
        assert_eq!(store.output_in_block(99, &funding, 0).unwrap().unwrap().spent_at, spender);

        store.delete_block(spender).unwrap();
        assert_eq!(store.output_in_block(99, &funding, 0).unwrap().unwrap().spent_at, 0);
        assert!(store.spending_blocks(&funding, 0).unwrap().is_empty());
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    #[test]
    fn nested_rollback_keeps_outer_work() {
        let (mut store, _dir) = temp_store();
        store.begin().unwrap();
        let outer = store.insert_branch(1, 0, &Hash256::INITIAL_PREV).unwrap();

        store.begin().unwrap();
        let inner = store.insert_branch(1, 0, &Hash256::INITIAL_PREV).unwrap();
        store.rollback().unwrap();

        store.commit().unwrap();
        assert!(!store.in_transaction());
        assert!(store.branch(outer).unwrap().is_some());
        assert!(store.branch(inner).unwrap().is_none());
    }

    #[test]
    fn outer_rollback_discards_everything() {
        let (mut store, _dir) = temp_store();
        store.begin().unwrap();
        store.begin().unwrap();
        store.insert_branch(1, 0, &Hash256::INITIAL_PREV).unwrap();
        store.commit().unwrap();
        store.rollback().unwrap();
        assert_eq!(store.branches().unwrap().len(), 1);
    }

    #[test]
    fn commit_without_begin_is_misuse() {
        let (mut store, _dir) = temp_store();
        assert!(matches!(store.commit(), Err(StoreError::Transaction(_))));
    }

    // ------------------------------------------------------------------
    // Backup
    // ------------------------------------------------------------------

    #[test]
    fn backup_then_restore() {
        let (mut store, dir) = temp_store();
        let b = block(Hash256::INITIAL_PREV, 0);
        insert(&store, 1, 0, &b);
        let copy = dir.path().join("copy.db");
        store.backup_to(&copy).unwrap();

        let later = block(b.hash(), 1);
        insert(&store, 1, 1, &later);
        store.restore_from(&copy).unwrap();

        assert!(store.block_meta_by_hash(&b.hash()).unwrap().is_some());
        assert!(store.block_meta_by_hash(&later.hash()).unwrap().is_none());
    }
}

//! Ledger types: hashes, transactions, blocks.
//!
//! Amounts are u64 base units. Raw encodings (what is stored in the ledger
//! and sent to peers) use bincode with the standard config. Hashes are taken
//! over fixed little-endian layouts so they never depend on the codec.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::CodecError;

/// A 32-byte hash value.
///
/// Used for block hashes (double SHA-256) and transaction hashes (BLAKE3).
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Predecessor of the genesis block (32 bytes of 0xFF).
    pub const INITIAL_PREV: Self = Self([0xFFu8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Build from a slice; `None` unless it is exactly 32 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 32]>::try_from(bytes).ok().map(Self)
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        hex::decode(s).ok().and_then(|bytes| Self::from_slice(&bytes))
    }

    /// First eight bytes as hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A transaction input: a reference to an output of an earlier transaction.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub struct TxInput {
    pub tx_hash: Hash256,
    pub out_n: u32,
}

impl fmt::Display for TxInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx_hash, self.out_n)
    }
}

/// A transaction output: an amount payable to an address.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxOutput {
    pub address: Vec<u8>,
    pub amount: u64,
}

/// The single transaction shape the ledger understands.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    pub version: u32,
    /// Outputs being spent. Empty for a coinbase.
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    /// Height marker for coinbases so that each one hashes uniquely.
    pub lock_time: u64,
}

impl Transaction {
    /// Transaction hash: BLAKE3 over a fixed little-endian layout.
    ///
    /// version(4) || input count(4) || (tx_hash(32) || out_n(4))* ||
    /// output count(4) || (address len(4) || address || amount(8))* || lock_time(8)
    ///
    /// The layout does not follow the bincode wire encoding, so hashes stay
    /// stable if the codec configuration changes.
    pub fn hash(&self) -> Hash256 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.version.to_le_bytes());
        hasher.update(&(self.inputs.len() as u32).to_le_bytes());
        for input in &self.inputs {
            hasher.update(input.tx_hash.as_bytes());
            hasher.update(&input.out_n.to_le_bytes());
        }
        hasher.update(&(self.outputs.len() as u32).to_le_bytes());
        for output in &self.outputs {
            hasher.update(&(output.address.len() as u32).to_le_bytes());
            hasher.update(&output.address);
            hasher.update(&output.amount.to_le_bytes());
        }
        hasher.update(&self.lock_time.to_le_bytes());
        Hash256(hasher.finalize().into())
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Sum of all output amounts. Returns None on overflow.
    pub fn total_output_amount(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.amount))
    }

    pub fn to_raw(&self) -> Result<Vec<u8>, CodecError> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CodecError::Serialization(e.to_string()))
    }

    pub fn from_raw(raw: &[u8]) -> Result<Self, CodecError> {
        decode_exact(raw)
    }
}

/// Block header.
///
/// Hash is double SHA-256 over a fixed little-endian byte layout.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockHeader {
    pub version: u32,
    /// Hash of the predecessor, or [`Hash256::INITIAL_PREV`] for genesis.
    pub prev_block: Hash256,
    /// Unix timestamp in seconds.
    pub time: u64,
    /// Difficulty target carried for the external rule set.
    pub diff: u64,
    pub nonce: u64,
    /// See [`transactions_root`].
    pub tx_root: Hash256,
}

impl BlockHeader {
    /// version(4) || prev_block(32) || time(8) || diff(8) || nonce(8) || tx_root(32)
    const HASH_SIZE: usize = 4 + 32 + 3 * 8 + 32;

    pub fn hash(&self) -> Hash256 {
        let mut data = Vec::with_capacity(Self::HASH_SIZE);
        data.extend_from_slice(&self.version.to_le_bytes());
        data.extend_from_slice(self.prev_block.as_bytes());
        data.extend_from_slice(&self.time.to_le_bytes());
        data.extend_from_slice(&self.diff.to_le_bytes());
        data.extend_from_slice(&self.nonce.to_le_bytes());
        data.extend_from_slice(self.tx_root.as_bytes());
        let first = Sha256::digest(&data);
        Hash256(Sha256::digest(first).into())
    }
}

/// A complete block: header plus transactions.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Block {
    pub header: BlockHeader,
    /// First transaction is the coinbase.
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn prev_block(&self) -> Hash256 {
        self.header.prev_block
    }

    pub fn is_genesis(&self) -> bool {
        self.header.prev_block == Hash256::INITIAL_PREV
    }

    pub fn to_raw(&self) -> Result<Vec<u8>, CodecError> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CodecError::Serialization(e.to_string()))
    }

    pub fn from_raw(raw: &[u8]) -> Result<Self, CodecError> {
        decode_exact(raw)
    }
}

/// BLAKE3 over the concatenated transaction hashes, in block order.
pub fn transactions_root(transactions: &[Transaction]) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    for tx in transactions {
        hasher.update(tx.hash().as_bytes());
    }
    Hash256(hasher.finalize().into())
}

/// Decode a bincode value, rejecting trailing bytes.
fn decode_exact<T: bincode::Decode<()>>(raw: &[u8]) -> Result<T, CodecError> {
    let (value, read) = bincode::decode_from_slice(raw, bincode::config::standard())
        .map_err(|e| CodecError::Serialization(e.to_string()))?;
    if read != raw.len() {
        return Err(CodecError::TrailingBytes(raw.len() - read));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coinbase(height: u64) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![],
            outputs: vec![TxOutput { address: b"miner".to_vec(), amount: 50 }],
            lock_time: height,
        }
    }

    fn block(prev: Hash256, txs: Vec<Transaction>) -> Block {
        Block {
            header: BlockHeader {
                version: 1,
                prev_block: prev,
                time: 1_700_000_000,
                diff: u64::MAX,
                nonce: 0,
                tx_root: transactions_root(&txs),
            },
            transactions: txs,
        }
    }

    // --- Hash256 ---

    #[test]
    fn initial_prev_is_all_ones() {
        assert!(Hash256::INITIAL_PREV.0.iter().all(|b| *b == 0xFF));
        assert!(!Hash256::INITIAL_PREV.is_zero());
    }

    #[test]
    fn hash256_hex_parse() {
        let h = Hash256([0xAB; 32]);
        assert_eq!(Hash256::from_hex(&h.to_string()), Some(h));
        assert_eq!(Hash256::from_hex("abcd"), None);
        assert_eq!(h.short(), "abababababababab");
    }

    #[test]
    fn from_slice_requires_32_bytes() {
        assert!(Hash256::from_slice(&[1u8; 31]).is_none());
        assert_eq!(Hash256::from_slice(&[1u8; 32]), Some(Hash256([1; 32])));
    }

    // --- Transaction ---

    #[test]
    fn coinbase_has_no_inputs() {
        assert!(coinbase(0).is_coinbase());
        let spend = Transaction {
            inputs: vec![TxInput { tx_hash: Hash256([1; 32]), out_n: 0 }],
            ..coinbase(0)
        };
        assert!(!spend.is_coinbase());
    }

    #[test]
    fn tx_hash_depends_on_lock_time() {
        assert_ne!(coinbase(1).hash(), coinbase(2).hash());
        assert_eq!(coinbase(1).hash(), coinbase(1).hash());
    }

    #[test]
    fn tx_hash_follows_fixed_layout() {
        let tx = Transaction {
            version: 2,
            inputs: vec![TxInput { tx_hash: Hash256([7; 32]), out_n: 3 }],
            outputs: vec![TxOutput { address: b"ab".to_vec(), amount: 9 }],
            lock_time: 5,
        };
        let mut expected = Vec::new();
        expected.extend_from_slice(&2u32.to_le_bytes());
        expected.extend_from_slice(&1u32.to_le_bytes());
        expected.extend_from_slice(&[7; 32]);
        expected.extend_from_slice(&3u32.to_le_bytes());
        expected.extend_from_slice(&1u32.to_le_bytes());
        expected.extend_from_slice(&2u32.to_le_bytes());
        expected.extend_from_slice(b"ab");
        expected.extend_from_slice(&9u64.to_le_bytes());
        expected.extend_from_slice(&5u64.to_le_bytes());
        assert_eq!(tx.hash(), Hash256(blake3::hash(&expected).into()));
        assert_ne!(tx.hash(), Hash256(blake3::hash(&tx.to_raw().unwrap()).into()));
    }

    #[test]
    fn tx_total_output_overflow() {
        let tx = Transaction {
            outputs: vec![
                TxOutput { address: vec![], amount: u64::MAX },
                TxOutput { address: vec![], amount: 1 },
            ],
            ..coinbase(0)
        };
        assert_eq!(tx.total_output_amount(), None);
    }

    // --- Block ---

    #[test]
    fn block_raw_decodes_to_same_hash() {
        let b = block(Hash256::INITIAL_PREV, vec![coinbase(0)]);
        let raw = b.to_raw().unwrap();
        let decoded = Block::from_raw(&raw).unwrap();
        assert_eq!(decoded.hash(), b.hash());
        assert!(decoded.is_genesis());
    }

    #[test]
    fn block_from_garbage_fails() {
        assert!(Block::from_raw(&[0xde, 0xad]).is_err());
    }

    #[test]
    fn block_from_raw_rejects_trailing_bytes() {
        let mut raw = block(Hash256::ZERO, vec![coinbase(0)]).to_raw().unwrap();
        raw.push(0);
        assert_eq!(Block::from_raw(&raw), Err(CodecError::TrailingBytes(1)));
    }

    #[test]
    fn header_hash_changes_with_nonce() {
        let mut b = block(Hash256::ZERO, vec![coinbase(0)]);
        let before = b.hash();
        b.header.nonce = 1;
        assert_ne!(before, b.hash());
    }

    #[test]
    fn tx_root_is_order_sensitive() {
        let a = transactions_root(&[coinbase(1), coinbase(2)]);
        let b = transactions_root(&[coinbase(2), coinbase(1)]);
        assert_ne!(a, b);
    }
}

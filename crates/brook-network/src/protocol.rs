//! Block-range wire messages.
//!
//! Request (36 bytes):
//!
//! ```text
//! tag(1) after_hash(32) count(u16 LE) flags(1)
//! ```
//!
//! `TAKE_BLOCKS_AFTER` response:
//!
//! ```text
//! tag(1) flags(1) after_hash(32) after_id(u32 LE, 0) count(u16 LE)   -- 40-byte header
//! { hash(32) len(u32 LE) data(len) } * count
//! ```
//!
//! With the zip flag set, everything after the 40-byte header is a single
//! raw deflate stream (no zlib or gzip framing). `NO_BLOCK_AFTER` is the tag
//! alone; `NO_BLOCK` is the tag followed by the responder's chain length
//! (u32 LE).
//!
//! Decoding never panics on hostile input; every failure is a [`CodecError`].

use std::io::{Read, Write};

use bytes::{Buf, BufMut, BytesMut};
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use tracing::trace;

use brook_core::constants::MAX_BLOCKS_PER_RESPONSE;
use brook_core::error::CodecError;
use brook_core::types::Hash256;

pub const GET_BLOCKS_AFTER: u8 = 0x10;
pub const TAKE_BLOCKS_AFTER: u8 = 0x11;
pub const NO_BLOCK_AFTER: u8 = 0x12;
pub const NO_BLOCK: u8 = 0x13;

/// Payload is raw-deflate compressed (request: please compress).
pub const FLAG_ZIP: u8 = 0b0000_0001;
/// Request only: serve from all branches instead of the master branch.
pub const FLAG_FROM_ALL_BRANCHES: u8 = 0b0000_0010;

pub const REQUEST_LEN: usize = 1 + 32 + 2 + 1;
pub const RESPONSE_HEADER_LEN: usize = 1 + 1 + 32 + 4 + 2;

/// Offset of the block count inside the response header.
pub const BLOCK_COUNT_OFFSET: usize = 38;

/// Per-block framing overhead: hash plus length prefix.
const BLOCK_FRAME_LEN: usize = 32 + 4;

/// Inflated payloads larger than this are rejected.
const MAX_INFLATED_SIZE: u64 = 256 * 1024 * 1024;

fn need(buf: &[u8], needed: usize) -> Result<(), CodecError> {
    if buf.remaining() < needed {
        return Err(CodecError::Truncated { needed, available: buf.remaining() });
    }
    Ok(())
}

fn get_hash(buf: &mut &[u8]) -> Hash256 {
    let mut bytes = [0u8; 32];
    buf.copy_to_slice(&mut bytes);
    Hash256(bytes)
}

/// Ask a peer for the blocks that follow `after_hash`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlocksAfterRequest {
    pub after_hash: Hash256,
    pub count: u16,
    pub zip: bool,
    pub from_all_branches: bool,
}

impl BlocksAfterRequest {
    pub fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.zip {
            flags |= FLAG_ZIP;
        }
        if self.from_all_branches {
            flags |= FLAG_FROM_ALL_BRANCHES;
        }
        flags
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(REQUEST_LEN);
        buf.put_u8(GET_BLOCKS_AFTER);
        buf.put_slice(self.after_hash.as_bytes());
        buf.put_u16_le(self.count);
        buf.put_u8(self.flags());
        buf.to_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut buf = data;
        need(buf, REQUEST_LEN)?;
        let tag = buf.get_u8();
        if tag != GET_BLOCKS_AFTER {
            return Err(CodecError::UnexpectedCommand { expected: GET_BLOCKS_AFTER, got: tag });
        }
        let after_hash = get_hash(&mut buf);
        let count = buf.get_u16_le();
        let flags = buf.get_u8();
        if buf.has_remaining() {
            return Err(CodecError::TrailingBytes(buf.remaining()));
        }
        Ok(Self {
            after_hash,
            count,
            zip: flags & FLAG_ZIP != 0,
            from_all_branches: flags & FLAG_FROM_ALL_BRANCHES != 0,
        })
    }
}

/// A block as carried on the wire: announced hash plus raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireBlock {
    pub hash: Hash256,
    pub data: Vec<u8>,
}

/// The three outcomes of a block-range request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlocksAfterResponse {
    /// Blocks following `after_hash`, in order.
    Blocks { after_hash: Hash256, zip: bool, blocks: Vec<WireBlock> },
    /// `after_hash` is the responder's tip.
    NoBlockAfter,
    /// `after_hash` is unknown to the responder.
    NoBlock { chain_length: u32 },
}

impl BlocksAfterResponse {
    pub fn tag(&self) -> u8 {
        match self {
            Self::Blocks { .. } => TAKE_BLOCKS_AFTER,
            Self::NoBlockAfter => NO_BLOCK_AFTER,
            Self::NoBlock { .. } => NO_BLOCK,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        match self {
            Self::NoBlockAfter => Ok(vec![NO_BLOCK_AFTER]),
            Self::NoBlock { chain_length } => {
                let mut buf = BytesMut::with_capacity(5);
                buf.put_u8(NO_BLOCK);
                buf.put_u32_le(*chain_length);
                Ok(buf.to_vec())
            }
            Self::Blocks { after_hash, zip, blocks } => {
                if blocks.len() > MAX_BLOCKS_PER_RESPONSE {
                    return Err(CodecError::TooManyBlocks { count: blocks.len(), max: MAX_BLOCKS_PER_RESPONSE });
                }
                let body_len: usize = blocks.iter().map(|b| BLOCK_FRAME_LEN + b.data.len()).sum();
                let mut body = BytesMut::with_capacity(body_len);
                for block in blocks {
                    let len = u32::try_from(block.data.len())
                        .map_err(|_| CodecError::Serialization(format!("block {} too large", block.hash)))?;
                    body.put_slice(block.hash.as_bytes());
                    body.put_u32_le(len);
                    body.put_slice(&block.data);
                }

                let mut buf = BytesMut::with_capacity(RESPONSE_HEADER_LEN + body_len);
                buf.put_u8(TAKE_BLOCKS_AFTER);
                buf.put_u8(if *zip { FLAG_ZIP } else { 0 });
                buf.put_slice(after_hash.as_bytes());
                buf.put_u32_le(0);
                buf.put_u16_le(blocks.len() as u16);
                if *zip {
                    buf.put_slice(&deflate(&body)?);
                } else {
                    buf.put_slice(&body);
                }
                Ok(buf.to_vec())
            }
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut buf = data;
        need(buf, 1)?;
        match buf.get_u8() {
            NO_BLOCK_AFTER => {
                if buf.has_remaining() {
                    return Err(CodecError::TrailingBytes(buf.remaining()));
                }
                Ok(Self::NoBlockAfter)
            }
            NO_BLOCK => {
                need(buf, 4)?;
                let chain_length = buf.get_u32_le();
                if buf.has_remaining() {
                    return Err(CodecError::TrailingBytes(buf.remaining()));
                }
                Ok(Self::NoBlock { chain_length })
            }
            TAKE_BLOCKS_AFTER => Self::decode_blocks(data),
            other => Err(CodecError::UnknownCommand(other)),
        }
    }

    fn decode_blocks(data: &[u8]) -> Result<Self, CodecError> {
        let mut buf = data;
        need(buf, RESPONSE_HEADER_LEN)?;
        buf.advance(1);
        let flags = buf.get_u8();
        let after_hash = get_hash(&mut buf);
        let _after_id = buf.get_u32_le();
        let count = buf.get_u16_le() as usize;
        if count > MAX_BLOCKS_PER_RESPONSE {
            return Err(CodecError::TooManyBlocks { count, max: MAX_BLOCKS_PER_RESPONSE });
        }

        let zip = flags & FLAG_ZIP != 0;
        let inflated;
        let mut body: &[u8] = if zip {
            inflated = inflate(buf)?;
            &inflated
        } else {
            buf
        };

        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            need(body, BLOCK_FRAME_LEN)?;
            let hash = get_hash(&mut body);
            let len = body.get_u32_le() as usize;
            need(body, len)?;
            let block_data = body[..len].to_vec();
            body.advance(len);
            blocks.push(WireBlock { hash, data: block_data });
        }
        if body.has_remaining() {
            return Err(CodecError::TrailingBytes(body.remaining()));
        }
        Ok(Self::Blocks { after_hash, zip, blocks })
    }
}

fn deflate(body: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body).map_err(|e| CodecError::Deflate(e.to_string()))?;
    encoder.finish().map_err(|e| CodecError::Deflate(e.to_string()))
}

fn inflate(compressed: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    DeflateDecoder::new(compressed)
        .take(MAX_INFLATED_SIZE)
        .read_to_end(&mut out)
        .map_err(|e| CodecError::Deflate(e.to_string()))?;
    Ok(out)
}

/// Accumulates blocks for a response without exceeding the packet size
/// (measured uncompressed) or the per-response block limit.
#[derive(Debug)]
pub struct BlockBatch {
    max_packet_size: usize,
    max_blocks: usize,
    size: usize,
    blocks: Vec<WireBlock>,
}

impl BlockBatch {
    pub fn new(max_packet_size: usize, max_blocks: usize) -> Self {
        Self {
            max_packet_size,
            max_blocks: max_blocks.min(MAX_BLOCKS_PER_RESPONSE),
            size: RESPONSE_HEADER_LEN,
            blocks: Vec::new(),
        }
    }

    /// Add a block unless the batch is full. Returns whether it was added.
    pub fn try_push(&mut self, hash: Hash256, data: Vec<u8>) -> bool {
        let next = self.size + BLOCK_FRAME_LEN + data.len();
        if self.blocks.len() >= self.max_blocks || next > self.max_packet_size {
            trace!(blocks = self.blocks.len(), size = self.size, "block batch full");
            return false;
        }
        self.size = next;
        self.blocks.push(WireBlock { hash, data });
        true
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Uncompressed packet size so far.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn into_response(self, after_hash: Hash256, zip: bool) -> BlocksAfterResponse {
        BlocksAfterResponse::Blocks { after_hash, zip, blocks: self.blocks }
    }
}

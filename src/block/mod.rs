//! Block primitives: handles, trailers, checksums, compression, buffer
//! ownership, and the block reader.
//!
//! A table is a sequence of **blocks**. Each block is addressed by a
//! [`BlockHandle`] `{offset, length}` and followed on disk by a fixed
//! 5-byte trailer that is *not* counted in `length`:
//!
//! ```text
//! [BLOCK_BYTES (length)] [COMPRESSION_BYTE (1)] [CHECKSUM_LE (4)]
//! ```
//!
//! The checksum covers `BLOCK_BYTES || COMPRESSION_BYTE`, so flipping any
//! byte of the block body or its compression marker is detected. The
//! checksum function (CRC32 or XXH64, low 32 bits) is fixed per file by the
//! footer.
//!
//! # Buffer discipline
//!
//! [`BlockReader::read`] returns a [`BufferHandle`]: a reference-counted,
//! immutable view of the loaded block plus its derived [`BlockMetadata`].
//! The metadata is initialized exactly once per materialized buffer and
//! shared by every iterator reading the same block. Data-block reads go
//! through the shared [`BlockCache`](cache::BlockCache); metadata-path
//! reads (metaindex, properties) route through a small [`BufferPool`] so
//! single-use buffers never evict cached data blocks.

pub mod cache;
pub mod reader;

use std::mem;
use std::sync::{Arc, Mutex};

use crc32fast::Hasher as Crc32;
use xxhash_rust::xxh64::Xxh64;

use crate::base::wire_config;
use crate::error::{Result, SstError};

pub use reader::{BlockReader, ReadEnv};

/// On-disk length of a block trailer: 1 compression byte + 4 checksum
/// bytes.
pub const TRAILER_LEN: u64 = 5;

// ------------------------------------------------------------------------------------------------
// Handles
// ------------------------------------------------------------------------------------------------

/// Locates one block: byte offset and body length, trailer excluded.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct BlockHandle {
    /// Byte offset of the block body within the file.
    pub offset: u64,

    /// Length of the block body, excluding the trailer.
    pub length: u64,
}

impl BlockHandle {
    /// Builds a handle from parts.
    pub fn new(offset: u64, length: u64) -> BlockHandle {
        BlockHandle { offset, length }
    }

    /// Whether this handle refers to no block at all.
    pub fn is_zero(&self) -> bool {
        self.offset == 0 && self.length == 0
    }
}

/// A [`BlockHandle`] plus the opaque block-property bytes recorded in the
/// index entry pointing at it. Block-property filters evaluate these bytes
/// to veto whole blocks before they are fetched.
#[derive(Debug, Default, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct HandleWithProperties {
    /// The referenced block.
    pub handle: BlockHandle,

    /// Opaque per-block property bytes; empty when the writer recorded
    /// none.
    pub props: Vec<u8>,
}

impl HandleWithProperties {
    /// Encodes this value for storage in an index entry.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::encode_to_vec(self, wire_config())?)
    }

    /// Decodes an index entry value. Trailing garbage is corruption.
    pub fn decode(data: &[u8]) -> Result<HandleWithProperties> {
        let (v, used) = bincode::decode_from_slice::<HandleWithProperties, _>(data, wire_config())?;
        if used != data.len() {
            return Err(SstError::Corruption(format!(
                "corrupt index entry: {} trailing bytes",
                data.len() - used
            )));
        }
        Ok(v)
    }
}

// ------------------------------------------------------------------------------------------------
// Checksums
// ------------------------------------------------------------------------------------------------

/// Checksum function used for every block trailer in a file. Recorded in
/// the footer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ChecksumKind {
    /// CRC-32 (IEEE), via `crc32fast`.
    Crc32 = 0,

    /// XXH64, truncated to the low 32 bits.
    XxHash64 = 1,
}

impl ChecksumKind {
    /// Decodes a checksum-kind byte. Unknown bytes are corruption.
    pub fn from_u8(v: u8) -> Result<ChecksumKind> {
        match v {
            0 => Ok(ChecksumKind::Crc32),
            1 => Ok(ChecksumKind::XxHash64),
            _ => Err(SstError::Corruption(format!("unknown checksum kind {v}"))),
        }
    }

    /// Computes the checksum of `data` under this kind.
    pub fn checksum(self, data: &[u8]) -> u32 {
        match self {
            ChecksumKind::Crc32 => {
                let mut hasher = Crc32::new();
                hasher.update(data);
                hasher.finalize()
            }
            ChecksumKind::XxHash64 => {
                let mut hasher = Xxh64::new(0);
                hasher.update(data);
                (hasher.digest() & 0xffff_ffff) as u32
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Compression
// ------------------------------------------------------------------------------------------------

/// Per-block compression, recorded in the trailer's first byte.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionKind {
    /// Stored uncompressed.
    None = 0,

    /// Snappy raw format, via the `snap` crate.
    Snappy = 1,
}

impl CompressionKind {
    /// Decodes a compression byte. Unknown bytes are corruption.
    pub fn from_u8(v: u8) -> Result<CompressionKind> {
        match v {
            0 => Ok(CompressionKind::None),
            1 => Ok(CompressionKind::Snappy),
            _ => Err(SstError::Corruption(format!(
                "unsupported compression type {v}"
            ))),
        }
    }

    /// Compresses `data`. Returns `None` when this kind stores bytes as-is
    /// or compression did not shrink the block.
    pub fn compress(self, data: &[u8]) -> Result<Option<Vec<u8>>> {
        match self {
            CompressionKind::None => Ok(None),
            CompressionKind::Snappy => {
                let compressed = snap::raw::Encoder::new()
                    .compress_vec(data)
                    .map_err(|e| SstError::Corruption(format!("snappy compression: {e}")))?;
                if compressed.len() >= data.len() {
                    Ok(None)
                } else {
                    Ok(Some(compressed))
                }
            }
        }
    }

    /// Decompresses `data` into a fresh buffer.
    pub fn decompress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            CompressionKind::None => Ok(data.to_vec()),
            CompressionKind::Snappy => snap::raw::Decoder::new()
                .decompress_vec(data)
                .map_err(|e| SstError::Corruption(format!("snappy decompression: {e}"))),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Block metadata
// ------------------------------------------------------------------------------------------------

/// Derived, per-buffer metadata. Initialized exactly once when a block is
/// materialized and immutable thereafter; every iterator over the same
/// buffer shares it.
///
/// Row-oriented blocks need no derived state. Column-oriented blocks
/// precompute their region offsets here so per-row accesses are plain
/// arithmetic.
#[derive(Debug, Default)]
pub enum BlockMetadata {
    /// No derived state (row blocks, filter, properties, value blocks).
    #[default]
    None,

    /// Columnar data block regions.
    ColumnarData(crate::colblk::ColumnarDataMeta),

    /// Columnar index block regions.
    ColumnarIndex(crate::colblk::ColumnarIndexMeta),

    /// Columnar keyspan block regions.
    ColumnarKeyspan(crate::colblk::ColumnarKeyspanMeta),
}

/// Metadata initializer invoked once per newly materialized buffer.
pub type InitMetadataFn<'a> = &'a dyn Fn(&[u8]) -> Result<BlockMetadata>;

/// Initializer for blocks without derived metadata.
pub fn no_metadata(_data: &[u8]) -> Result<BlockMetadata> {
    Ok(BlockMetadata::None)
}

// ------------------------------------------------------------------------------------------------
// Loaded blocks and buffer handles
// ------------------------------------------------------------------------------------------------

/// An immutable, fully verified block in memory: decompressed bytes plus
/// derived metadata. Never mutated after construction.
pub struct LoadedBlock {
    data: Vec<u8>,
    metadata: BlockMetadata,
    recycle: Option<BufferPool>,
}

impl LoadedBlock {
    pub(crate) fn new(
        data: Vec<u8>,
        metadata: BlockMetadata,
        recycle: Option<BufferPool>,
    ) -> LoadedBlock {
        LoadedBlock {
            data,
            metadata,
            recycle,
        }
    }
}

impl Drop for LoadedBlock {
    fn drop(&mut self) {
        if let Some(pool) = &self.recycle {
            pool.put(mem::take(&mut self.data));
        }
    }
}

/// Reference-counted handle on a [`LoadedBlock`]. Cloning bumps the
/// refcount; the backing buffer is released (or returned to its pool) when
/// the last handle drops.
#[derive(Clone)]
pub struct BufferHandle {
    block: Arc<LoadedBlock>,
}

impl BufferHandle {
    pub(crate) fn new(block: Arc<LoadedBlock>) -> BufferHandle {
        BufferHandle { block }
    }

    /// The decompressed block bytes.
    pub fn data(&self) -> &[u8] {
        &self.block.data
    }

    /// The block's derived metadata.
    pub fn metadata(&self) -> &BlockMetadata {
        &self.block.metadata
    }
}

// ------------------------------------------------------------------------------------------------
// Buffer pool
// ------------------------------------------------------------------------------------------------

/// Fixed-capacity recycling pool of byte buffers.
///
/// Used on the metadata read path with a capacity of 3: one slot for the
/// metaindex block plus the compressed and decompressed properties buffers,
/// which are held simultaneously. Buffers handed out by a pool are never
/// inserted into the shared block cache.
#[derive(Clone)]
pub struct BufferPool {
    slots: Arc<Mutex<Vec<Vec<u8>>>>,
    capacity: usize,
}

impl BufferPool {
    /// A pool retaining at most `capacity` free buffers.
    pub fn with_capacity(capacity: usize) -> BufferPool {
        BufferPool {
            slots: Arc::new(Mutex::new(Vec::with_capacity(capacity))),
            capacity,
        }
    }

    /// Takes a zeroed buffer of exactly `len` bytes, reusing a pooled
    /// allocation when one is available.
    pub fn get(&self, len: usize) -> Vec<u8> {
        let mut buf = {
            let mut slots = self.slots.lock().expect("buffer pool poisoned");
            slots.pop().unwrap_or_default()
        };
        buf.clear();
        buf.resize(len, 0);
        buf
    }

    /// Returns a buffer to the pool. Dropped if the pool is full.
    pub fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut slots = self.slots.lock().expect("buffer pool poisoned");
        if slots.len() < self.capacity {
            slots.push(buf);
        }
    }
}

thread_local! {
    /// Per-thread pool for the metaindex read path. Reused across files;
    /// see [`BufferPool`] for the 3-slot rationale.
    pub(crate) static META_BUFFER_POOL: BufferPool = BufferPool::with_capacity(3);
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_kinds_differ_and_are_stable() {
        let data = b"some block bytes\x00";
        let crc = ChecksumKind::Crc32.checksum(data);
        let xxh = ChecksumKind::XxHash64.checksum(data);
        assert_eq!(crc, ChecksumKind::Crc32.checksum(data));
        assert_eq!(xxh, ChecksumKind::XxHash64.checksum(data));
        assert_ne!(crc, xxh);
    }

    #[test]
    fn unknown_compression_byte_is_corruption() {
        assert!(matches!(
            CompressionKind::from_u8(9),
            Err(SstError::Corruption(_))
        ));
    }

    #[test]
    fn snappy_round_trip() {
        let data = vec![7u8; 4096];
        let compressed = CompressionKind::Snappy.compress(&data).unwrap().unwrap();
        assert!(compressed.len() < data.len());
        let restored = CompressionKind::Snappy.decompress(&compressed).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn incompressible_blocks_stay_raw() {
        // 16 bytes of "random" data should not shrink under snappy.
        let data: Vec<u8> = (0..16u8).map(|i| i.wrapping_mul(97).wrapping_add(13)).collect();
        assert!(CompressionKind::Snappy.compress(&data).unwrap().is_none());
    }

    #[test]
    fn handle_with_properties_round_trip() {
        let hp = HandleWithProperties {
            handle: BlockHandle::new(128, 4096),
            props: vec![1],
        };
        let enc = hp.encode().unwrap();
        assert_eq!(HandleWithProperties::decode(&enc).unwrap(), hp);

        let mut trailing = enc.clone();
        trailing.push(0);
        assert!(matches!(
            HandleWithProperties::decode(&trailing),
            Err(SstError::Corruption(_))
        ));
    }

    #[test]
    fn buffer_pool_recycles_up_to_capacity() {
        let pool = BufferPool::with_capacity(2);
        let a = pool.get(16);
        let b = pool.get(32);
        let c = pool.get(8);
        pool.put(a);
        pool.put(b);
        pool.put(c); // dropped: pool already holds 2

        assert_eq!(pool.slots.lock().unwrap().len(), 2);
        let reused = pool.get(4);
        assert_eq!(reused.len(), 4);
        assert!(reused.iter().all(|&b| b == 0));
    }
}

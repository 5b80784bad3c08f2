//! The block reader: fetch, verify, decompress, publish.
//!
//! [`BlockReader::read`] is the single choke point every block in a table
//! passes through. Given a [`BlockHandle`] it reads `length + 5` bytes,
//! verifies the trailer checksum over `body || compression_byte`,
//! decompresses if needed, runs the caller's metadata initializer exactly
//! once, and hands back a reference-counted [`BufferHandle`].
//!
//! Reads either go through the shared [`BlockCache`] (the default for data,
//! index, and keyspan blocks) or through a caller-supplied [`BufferPool`]
//! (the metaindex path), never both. Cache loads are single-flight per
//! `(file_num, offset)`.

use std::sync::Arc;

use tracing::error;

use super::cache::{BlockCache, LoadTicket};
use super::{
    BlockHandle, BufferHandle, BufferPool, ChecksumKind, CompressionKind, InitMetadataFn,
    LoadedBlock, TRAILER_LEN,
};
use crate::error::{Result, SstError};
use crate::readable::{ReadContext, ReadHandle, Readable};

/// Per-read environment: where buffers come from.
///
/// With a `buffer_pool`, the loaded block borrows a pooled allocation and
/// is *not* inserted into the shared cache. Without one, the block reader
/// consults and populates the cache.
#[derive(Clone, Default)]
pub struct ReadEnv {
    /// Optional recycling pool for this read path.
    pub buffer_pool: Option<BufferPool>,
}

impl ReadEnv {
    /// Environment with no pool: cacheable reads.
    pub fn none() -> ReadEnv {
        ReadEnv::default()
    }

    /// Environment routing buffers through `pool`.
    pub fn pooled(pool: BufferPool) -> ReadEnv {
        ReadEnv {
            buffer_pool: Some(pool),
        }
    }
}

/// Reads, verifies, and caches blocks for one table file.
pub struct BlockReader {
    readable: Arc<dyn Readable>,
    checksum: ChecksumKind,
    file_num: u64,
    cache: Option<Arc<BlockCache>>,
}

impl BlockReader {
    /// Creates a block reader over `readable` using the checksum kind the
    /// footer selected.
    pub fn new(
        readable: Arc<dyn Readable>,
        checksum: ChecksumKind,
        file_num: u64,
        cache: Option<Arc<BlockCache>>,
    ) -> BlockReader {
        BlockReader {
            readable,
            checksum,
            file_num,
            cache,
        }
    }

    /// The file number this reader serves; used in cache keys and error
    /// messages.
    pub fn file_num(&self) -> u64 {
        self.file_num
    }

    /// The underlying readable.
    pub fn readable(&self) -> &Arc<dyn Readable> {
        &self.readable
    }

    /// Reads the block at `bh`.
    ///
    /// `init_metadata` runs exactly once per newly materialized buffer;
    /// cache hits reuse the metadata computed by the original load. The
    /// returned handle keeps the buffer alive until dropped.
    pub fn read(
        &self,
        rctx: &ReadContext,
        env: &ReadEnv,
        read_handle: Option<&ReadHandle>,
        bh: BlockHandle,
        init_metadata: InitMetadataFn<'_>,
    ) -> Result<BufferHandle> {
        rctx.check()?;

        // Pooled reads bypass the cache entirely.
        if env.buffer_pool.is_some() || self.cache.is_none() {
            let block = self.load(rctx, env, read_handle, bh, init_metadata)?;
            return Ok(BufferHandle::new(Arc::new(block)));
        }

        let cache = self.cache.as_ref().expect("cache presence checked above");
        let key = (self.file_num, bh.offset);
        loop {
            if let Some(block) = cache.get(key) {
                return Ok(BufferHandle::new(block));
            }
            match cache.begin_load(key) {
                LoadTicket::Leader => {
                    let loaded = self.load(rctx, env, read_handle, bh, init_metadata);
                    match loaded {
                        Ok(block) => {
                            let block = Arc::new(block);
                            cache.insert(key, block.clone());
                            cache.finish_load(key);
                            return Ok(BufferHandle::new(block));
                        }
                        Err(e) => {
                            cache.finish_load(key);
                            return Err(e);
                        }
                    }
                }
                LoadTicket::Follower(entry) => {
                    cache.wait(&entry);
                    // Re-check the cache; on leader failure this retries as
                    // the new leader.
                }
            }
        }
    }

    /// Performs the raw read + verify + decompress + metadata pipeline.
    fn load(
        &self,
        rctx: &ReadContext,
        env: &ReadEnv,
        read_handle: Option<&ReadHandle>,
        bh: BlockHandle,
        init_metadata: InitMetadataFn<'_>,
    ) -> Result<LoadedBlock> {
        let raw_len = (bh.length + TRAILER_LEN) as usize;
        let mut raw = match &env.buffer_pool {
            Some(pool) => pool.get(raw_len),
            None => vec![0u8; raw_len],
        };

        let read_result = match read_handle {
            Some(rh) => rh.read_at(rctx, &mut raw, bh.offset),
            None => self.readable.read_at(rctx, &mut raw, bh.offset),
        };
        if let Err(e) = read_result {
            if let Some(pool) = &env.buffer_pool {
                pool.put(raw);
            }
            return Err(match e {
                SstError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                    SstError::Corruption(format!(
                        "table {}: short read of block at offset {} length {}",
                        self.file_num, bh.offset, bh.length
                    ))
                }
                other => other,
            });
        }

        let body_len = bh.length as usize;
        let compression_byte = raw[body_len];
        let stored = u32::from_le_bytes(
            raw[body_len + 1..body_len + 5]
                .try_into()
                .expect("trailer is 4 bytes"),
        );
        // Checksum covers body and compression byte, which are contiguous.
        let computed = self.checksum.checksum(&raw[..body_len + 1]);
        if computed != stored {
            error!(
                file_num = self.file_num,
                offset = bh.offset,
                stored,
                computed,
                "block checksum mismatch"
            );
            if let Some(pool) = &env.buffer_pool {
                pool.put(raw);
            }
            return Err(SstError::ChecksumMismatch);
        }

        let compression = match CompressionKind::from_u8(compression_byte) {
            Ok(c) => c,
            Err(e) => {
                if let Some(pool) = &env.buffer_pool {
                    pool.put(raw);
                }
                return Err(e);
            }
        };

        let (data, recycle) = match compression {
            CompressionKind::None => {
                raw.truncate(body_len);
                (raw, env.buffer_pool.clone())
            }
            CompressionKind::Snappy => {
                let decompressed = CompressionKind::Snappy.decompress(&raw[..body_len]);
                if let Some(pool) = &env.buffer_pool {
                    pool.put(raw);
                } else {
                    drop(raw);
                }
                (decompressed?, None)
            }
        };

        let metadata = match init_metadata(&data) {
            Ok(m) => m,
            Err(e) => {
                if let (Some(pool), true) = (&env.buffer_pool, recycle.is_some()) {
                    pool.put(data);
                }
                return Err(e);
            }
        };
        Ok(LoadedBlock::new(data, metadata, recycle))
    }
}

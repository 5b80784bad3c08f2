//! Value blocks and lazy values.
//!
//! Formats that support value separation store large values outside the
//! data blocks: the data-block entry carries a small **value handle**
//! (block number, offset, length) and the bytes live in a dedicated value
//! block. A self-describing **value-block index** maps block numbers to
//! block handles using the field widths recorded in the metaindex.
//!
//! Iterators therefore yield [`LazyValue`]s. An inline lazy value owns its
//! bytes; a stored one re-enters the reader through a [`ReaderProvider`]
//! when fetched — possibly long after the iterator that produced it was
//! dropped. The provider is the one place the iterator/reader lifetime
//! contract is enforced: fetching through a closed reader fails with the
//! reader-closed sentinel.

use std::borrow::Cow;
use std::sync::Arc;

use crate::base::wire_config;
use crate::block::BlockHandle;
use crate::error::{Result, SstError};
use crate::readable::ReadContext;
use crate::reader::Reader;

/// Value-prefix byte: the remaining bytes are the value itself.
pub const VALUE_PREFIX_INLINE: u8 = 0;

/// Value-prefix byte: the remaining bytes encode a [`ValueHandle`].
pub const VALUE_PREFIX_HANDLE: u8 = 1;

// ------------------------------------------------------------------------------------------------
// Handles
// ------------------------------------------------------------------------------------------------

/// Locates the value-block index and describes its row encoding.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct ValueBlockIndexHandle {
    /// Handle of the value-block index block; zero when the file has no
    /// value blocks.
    pub handle: BlockHandle,

    /// Byte width of the block-number field in each index row.
    pub block_num_width: u8,

    /// Byte width of the block-offset and block-length fields.
    pub block_offset_width: u8,
}

impl ValueBlockIndexHandle {
    /// Byte length of one index row under these widths.
    pub fn row_width(&self) -> usize {
        self.block_num_width as usize + 2 * self.block_offset_width as usize
    }
}

/// Locates one value inside a value block.
#[derive(Debug, Copy, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct ValueHandle {
    /// Length of the value in bytes.
    pub value_len: u32,

    /// Value block number, an index into the value-block index.
    pub block_num: u32,

    /// Byte offset of the value within its block.
    pub offset_in_block: u32,
}

/// Encodes a value field referencing a stored value. Writer-side only.
pub(crate) fn encode_handle_value(vh: &ValueHandle) -> Result<Vec<u8>> {
    let mut out = vec![VALUE_PREFIX_HANDLE];
    out.extend_from_slice(&bincode::encode_to_vec(vh, wire_config())?);
    Ok(out)
}

/// Encodes an inline value field. Writer-side only.
pub(crate) fn encode_inline_value(value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() + 1);
    out.push(VALUE_PREFIX_INLINE);
    out.extend_from_slice(value);
    out
}

/// Splits a prefixed value field into its interpretation.
pub(crate) fn decode_value_field(raw: &[u8]) -> Result<ValueField<'_>> {
    let Some((&prefix, rest)) = raw.split_first() else {
        return Err(SstError::Corruption("empty value field".into()));
    };
    match prefix {
        VALUE_PREFIX_INLINE => Ok(ValueField::Inline(rest)),
        VALUE_PREFIX_HANDLE => {
            let (vh, used) = bincode::decode_from_slice::<ValueHandle, _>(rest, wire_config())?;
            if used != rest.len() {
                return Err(SstError::Corruption(
                    "trailing bytes after value handle".into(),
                ));
            }
            Ok(ValueField::Handle(vh))
        }
        other => Err(SstError::Corruption(format!(
            "unknown value prefix {other}"
        ))),
    }
}

/// Interpretation of a prefixed value field.
pub(crate) enum ValueField<'a> {
    Inline(&'a [u8]),
    Handle(ValueHandle),
}

// ------------------------------------------------------------------------------------------------
// Value-block index codec
// ------------------------------------------------------------------------------------------------

fn write_uint(out: &mut Vec<u8>, v: u64, width: usize) {
    out.extend_from_slice(&v.to_le_bytes()[..width]);
}

fn read_uint(data: &[u8], at: usize, width: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf[..width].copy_from_slice(&data[at..at + width]);
    u64::from_le_bytes(buf)
}

/// Encodes the value-block index for the given blocks. Writer-side only.
pub(crate) fn encode_index(blocks: &[BlockHandle], ih: &ValueBlockIndexHandle) -> Vec<u8> {
    let mut out = Vec::with_capacity(blocks.len() * ih.row_width());
    for (num, bh) in blocks.iter().enumerate() {
        write_uint(&mut out, num as u64, ih.block_num_width as usize);
        write_uint(&mut out, bh.offset, ih.block_offset_width as usize);
        write_uint(&mut out, bh.length, ih.block_offset_width as usize);
    }
    out
}

/// Decodes the value-block index: one handle per block number, dense.
pub fn decode_index(data: &[u8], ih: &ValueBlockIndexHandle) -> Result<Vec<BlockHandle>> {
    let row = ih.row_width();
    if row == 0 || data.len() % row != 0 {
        return Err(SstError::Corruption(format!(
            "value-block index length {} is not a multiple of row width {row}",
            data.len()
        )));
    }
    let num_width = ih.block_num_width as usize;
    let off_width = ih.block_offset_width as usize;
    let mut blocks = Vec::with_capacity(data.len() / row);
    for (i, at) in (0..data.len()).step_by(row).enumerate() {
        let num = read_uint(data, at, num_width);
        if num != i as u64 {
            return Err(SstError::Corruption(format!(
                "value-block index row {i} has block number {num}"
            )));
        }
        let offset = read_uint(data, at + num_width, off_width);
        let length = read_uint(data, at + num_width + off_width, off_width);
        blocks.push(BlockHandle::new(offset, length));
    }
    Ok(blocks)
}

// ------------------------------------------------------------------------------------------------
// Reader provider
// ------------------------------------------------------------------------------------------------

/// Hands lazy values a reader to fetch through, after their producing
/// iterator is gone.
pub trait ReaderProvider: Send + Sync {
    /// Returns the reader, or fails if it is no longer usable.
    fn get_reader(&self) -> Result<Arc<Reader>>;
}

/// Provider for the common case where the caller holds the reader for the
/// whole lifetime of every lazy value: hands out the same reader each
/// time.
pub struct TrivialReaderProvider {
    reader: Arc<Reader>,
}

impl TrivialReaderProvider {
    /// Wraps a reader.
    pub fn new(reader: Arc<Reader>) -> TrivialReaderProvider {
        TrivialReaderProvider { reader }
    }
}

impl ReaderProvider for TrivialReaderProvider {
    fn get_reader(&self) -> Result<Arc<Reader>> {
        Ok(self.reader.clone())
    }
}

// ------------------------------------------------------------------------------------------------
// Lazy values
// ------------------------------------------------------------------------------------------------

enum LazyValueRepr {
    Inline(Vec<u8>),
    Stored {
        handle: ValueHandle,
        provider: Arc<dyn ReaderProvider>,
    },
}

/// A value that may not have been fetched yet.
///
/// Inline values own their bytes. Stored values carry a handle into a
/// value block and fetch through their [`ReaderProvider`] on demand; the
/// reader must still be open at fetch time.
pub struct LazyValue {
    repr: LazyValueRepr,
}

impl LazyValue {
    /// A value whose bytes are already in hand.
    pub fn inline(bytes: impl Into<Vec<u8>>) -> LazyValue {
        LazyValue {
            repr: LazyValueRepr::Inline(bytes.into()),
        }
    }

    /// A value stored in a value block.
    pub fn stored(handle: ValueHandle, provider: Arc<dyn ReaderProvider>) -> LazyValue {
        LazyValue {
            repr: LazyValueRepr::Stored { handle, provider },
        }
    }

    /// Length of the value in bytes, known without fetching.
    pub fn len(&self) -> usize {
        match &self.repr {
            LazyValueRepr::Inline(b) => b.len(),
            LazyValueRepr::Stored { handle, .. } => handle.value_len as usize,
        }
    }

    /// Whether the value is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the bytes are already in hand.
    pub fn is_inline(&self) -> bool {
        matches!(self.repr, LazyValueRepr::Inline(_))
    }

    /// The value bytes, fetching from the value block if necessary.
    pub fn get(&self, rctx: &ReadContext) -> Result<Cow<'_, [u8]>> {
        match &self.repr {
            LazyValueRepr::Inline(b) => Ok(Cow::Borrowed(b)),
            LazyValueRepr::Stored { handle, provider } => {
                let reader = provider.get_reader()?;
                Ok(Cow::Owned(reader.read_value(rctx, *handle)?))
            }
        }
    }
}

impl std::fmt::Debug for LazyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.repr {
            LazyValueRepr::Inline(b) => f.debug_tuple("LazyValue::Inline").field(&b.len()).finish(),
            LazyValueRepr::Stored { handle, .. } => {
                f.debug_tuple("LazyValue::Stored").field(handle).finish()
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

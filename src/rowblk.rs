//! Row-oriented block encoding and iterators.
//!
//! A row block is a flat sequence of cells, each a fixed-int encoded
//! header followed by the key and value bytes:
//!
//! ```text
//! [RowCell { key_len, value_len, trailer, flags }][KEY_BYTES][VALUE_BYTES]
//! ```
//!
//! Index blocks reuse the same cell stream: the key is the separator (the
//! last user key of the referenced block) and the value is an encoded
//! [`HandleWithProperties`].
//!
//! Seeking is linear within a block; blocks are small (4 KiB by default)
//! so a scan beats the constant factors of anything cleverer. Backward
//! steps re-scan from the block head. If a cell fails to decode after the
//! block's checksum already passed, the cursor treats the block as
//! exhausted; index iterators additionally surface corrupt entries through
//! [`IndexIterator::block_handle_with_properties`].

use std::ops::Range;
use std::sync::Arc;

use crate::base::{trailer_with_seqnum, wire_config, Comparator, KeyRef};
use crate::block::{BufferHandle, HandleWithProperties};
use crate::error::{Result, SstError};
use crate::iterator::{DataIterator, IndexIterator, IterTransforms};

/// Flag bit marking a point entry shadowed by a newer entry in this file.
pub(crate) const ROW_FLAG_OBSOLETE: u8 = 1;

/// Fixed-int encoded size of a [`RowCell`].
const ROW_CELL_SIZE: usize = 17;

/// Per-entry header.
#[derive(Debug, bincode::Encode, bincode::Decode)]
struct RowCell {
    key_len: u32,
    value_len: u32,
    trailer: u64,
    flags: u8,
}

// ------------------------------------------------------------------------------------------------
// Block builder (writer side)
// ------------------------------------------------------------------------------------------------

/// Accumulates cells for one row block.
#[derive(Default)]
pub(crate) struct RowBlockBuilder {
    buf: Vec<u8>,
    count: usize,
}

impl RowBlockBuilder {
    pub(crate) fn new() -> RowBlockBuilder {
        RowBlockBuilder::default()
    }

    /// Appends an entry. Keys must arrive in sorted order.
    pub(crate) fn add(
        &mut self,
        user_key: &[u8],
        trailer: u64,
        flags: u8,
        value: &[u8],
    ) -> Result<()> {
        let cell = RowCell {
            key_len: user_key.len() as u32,
            value_len: value.len() as u32,
            trailer,
            flags,
        };
        let header = bincode::encode_to_vec(&cell, wire_config())?;
        debug_assert_eq!(header.len(), ROW_CELL_SIZE);
        self.buf.extend_from_slice(&header);
        self.buf.extend_from_slice(user_key);
        self.buf.extend_from_slice(value);
        self.count += 1;
        Ok(())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub(crate) fn size_estimate(&self) -> usize {
        self.buf.len()
    }

    /// Finishes the block, returning its bytes and resetting the builder.
    pub(crate) fn finish(&mut self) -> Vec<u8> {
        self.count = 0;
        std::mem::take(&mut self.buf)
    }
}

// ------------------------------------------------------------------------------------------------
// Cursor
// ------------------------------------------------------------------------------------------------

/// Shared positioning machinery for row data and index iterators.
struct RowCursor {
    block: BufferHandle,
    /// Start of the current cell.
    offset: usize,
    /// Start of the cell after the current one.
    next_offset: usize,
    key: Range<usize>,
    value: Range<usize>,
    trailer: u64,
    flags: u8,
    valid: bool,
}

impl RowCursor {
    fn new(block: BufferHandle) -> RowCursor {
        RowCursor {
            block,
            offset: 0,
            next_offset: 0,
            key: 0..0,
            value: 0..0,
            trailer: 0,
            flags: 0,
            valid: false,
        }
    }

    fn data(&self) -> &[u8] {
        self.block.data()
    }

    /// Decodes the cell at `off`. Returns validity; decode failures and
    /// truncation exhaust the cursor.
    fn parse_at(&mut self, off: usize) -> bool {
        let data = self.block.data();
        if off >= data.len() {
            self.valid = false;
            return false;
        }
        let cell = match bincode::decode_from_slice::<RowCell, _>(&data[off..], wire_config()) {
            Ok((cell, used)) => {
                debug_assert_eq!(used, ROW_CELL_SIZE);
                cell
            }
            Err(_) => {
                debug_assert!(false, "row cell decode failed after checksum passed");
                self.valid = false;
                return false;
            }
        };
        let key_start = off + ROW_CELL_SIZE;
        let key_end = key_start + cell.key_len as usize;
        let value_end = key_end + cell.value_len as usize;
        if value_end > data.len() {
            debug_assert!(false, "row cell overruns block after checksum passed");
            self.valid = false;
            return false;
        }
        self.offset = off;
        self.next_offset = value_end;
        self.key = key_start..key_end;
        self.value = key_end..value_end;
        self.trailer = cell.trailer;
        self.flags = cell.flags;
        self.valid = true;
        true
    }

    fn first(&mut self) -> bool {
        self.parse_at(0)
    }

    fn next(&mut self) -> bool {
        if !self.valid {
            return false;
        }
        let next = self.next_offset;
        self.parse_at(next)
    }

    fn prev(&mut self) -> bool {
        if !self.valid || self.offset == 0 {
            self.valid = false;
            return false;
        }
        // Re-scan from the head to find the predecessor.
        let target = self.offset;
        let mut off = 0;
        if !self.parse_at(off) {
            return false;
        }
        while self.next_offset != target {
            off = self.next_offset;
            if !self.parse_at(off) {
                return false;
            }
        }
        true
    }

    fn last(&mut self) -> bool {
        if !self.first() {
            return false;
        }
        while self.next_offset < self.data().len() {
            let next = self.next_offset;
            if !self.parse_at(next) {
                return false;
            }
        }
        true
    }

    /// Positions at the first entry with user key ≥ `key`.
    fn seek_ge(&mut self, cmp: &dyn Comparator, key: &[u8]) -> bool {
        if !self.first() {
            return false;
        }
        loop {
            let current = &self.data()[self.key.clone()];
            if cmp.compare(current, key) != std::cmp::Ordering::Less {
                return true;
            }
            if !self.next() {
                return false;
            }
        }
    }

    fn raw_key(&self) -> &[u8] {
        &self.data()[self.key.clone()]
    }

    fn raw_value(&self) -> &[u8] {
        &self.data()[self.value.clone()]
    }
}

// ------------------------------------------------------------------------------------------------
// Data iterator
// ------------------------------------------------------------------------------------------------

/// Row-block implementation of [`DataIterator`].
pub struct RowDataIter {
    cursor: RowCursor,
    cmp: Arc<dyn Comparator>,
    transforms: IterTransforms,
    /// Scratch for the prefixed key when a synthetic prefix is set.
    key_buf: Vec<u8>,
}

impl RowDataIter {
    fn hide(&self) -> bool {
        self.transforms.hide_obsolete_points
    }

    fn current_obsolete(&self) -> bool {
        self.cursor.flags & ROW_FLAG_OBSOLETE != 0
    }

    /// Skips obsolete entries in the given direction, then rebuilds the
    /// scratch key.
    fn settle(&mut self, forward: bool) -> bool {
        if self.hide() {
            while self.cursor.valid && self.current_obsolete() {
                let more = if forward {
                    self.cursor.next()
                } else {
                    self.cursor.prev()
                };
                if !more {
                    return false;
                }
            }
        }
        if !self.cursor.valid {
            return false;
        }
        if let Some(prefix) = &self.transforms.synthetic_prefix {
            self.key_buf.clear();
            self.key_buf.extend_from_slice(prefix);
            self.key_buf.extend_from_slice(self.cursor.raw_key());
        }
        true
    }
}

impl DataIterator for RowDataIter {
    fn new(
        block: BufferHandle,
        cmp: Arc<dyn Comparator>,
        transforms: IterTransforms,
    ) -> Result<RowDataIter> {
        Ok(RowDataIter {
            cursor: RowCursor::new(block),
            cmp,
            transforms,
            key_buf: Vec::new(),
        })
    }

    fn seek_ge(&mut self, key: &[u8]) -> bool {
        self.cursor.seek_ge(self.cmp.as_ref(), key) && self.settle(true)
    }

    fn first(&mut self) -> bool {
        self.cursor.first() && self.settle(true)
    }

    fn last(&mut self) -> bool {
        self.cursor.last() && self.settle(false)
    }

    fn next(&mut self) -> bool {
        self.cursor.next() && self.settle(true)
    }

    fn prev(&mut self) -> bool {
        self.cursor.prev() && self.settle(false)
    }

    fn valid(&self) -> bool {
        self.cursor.valid
    }

    fn key(&self) -> KeyRef<'_> {
        debug_assert!(self.cursor.valid);
        let user_key: &[u8] = if self.transforms.synthetic_prefix.is_some() {
            &self.key_buf
        } else {
            self.cursor.raw_key()
        };
        let trailer = match self.transforms.synthetic_seqnum {
            Some(seqnum) => trailer_with_seqnum(self.cursor.trailer, seqnum),
            None => self.cursor.trailer,
        };
        KeyRef { user_key, trailer }
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.cursor.valid);
        self.cursor.raw_value()
    }
}

// ------------------------------------------------------------------------------------------------
// Index iterator
// ------------------------------------------------------------------------------------------------

/// Row-block implementation of [`IndexIterator`].
pub struct RowIndexIter {
    cursor: RowCursor,
    cmp: Arc<dyn Comparator>,
}

impl IndexIterator for RowIndexIter {
    fn new(block: BufferHandle, cmp: Arc<dyn Comparator>) -> Result<RowIndexIter> {
        Ok(RowIndexIter {
            cursor: RowCursor::new(block),
            cmp,
        })
    }

    fn seek_ge(&mut self, key: &[u8]) -> bool {
        self.cursor.seek_ge(self.cmp.as_ref(), key)
    }

    fn first(&mut self) -> bool {
        self.cursor.first()
    }

    fn last(&mut self) -> bool {
        self.cursor.last()
    }

    fn next(&mut self) -> bool {
        self.cursor.next()
    }

    fn prev(&mut self) -> bool {
        self.cursor.prev()
    }

    fn valid(&self) -> bool {
        self.cursor.valid
    }

    fn separator(&self) -> &[u8] {
        debug_assert!(self.cursor.valid);
        self.cursor.raw_key()
    }

    fn block_handle_with_properties(&self) -> Result<HandleWithProperties> {
        debug_assert!(self.cursor.valid);
        HandleWithProperties::decode(self.cursor.raw_value())
            .map_err(|e| SstError::Corruption(format!("corrupt index entry: {e}")))
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{make_trailer, BytewiseComparator, KeyKind};
    use crate::block::{BlockHandle, BlockMetadata, LoadedBlock};

    fn block_of(entries: &[(&[u8], u64, u8, &[u8])]) -> BufferHandle {
        let mut b = RowBlockBuilder::new();
        for (k, t, f, v) in entries {
            b.add(k, *t, *f, v).unwrap();
        }
        BufferHandle::new(Arc::new(LoadedBlock::new(
            b.finish(),
            BlockMetadata::None,
            None,
        )))
    }

    fn data_iter(entries: &[(&[u8], u64, u8, &[u8])], transforms: IterTransforms) -> RowDataIter {
        RowDataIter::new(block_of(entries), Arc::new(BytewiseComparator), transforms).unwrap()
    }

    const T: u64 = (7 << 8) | 1; // seqnum 7, Set

    #[test]
    fn forward_and_backward_iteration() {
        let mut it = data_iter(
            &[(b"a", T, 0, b"1"), (b"b", T, 0, b"2"), (b"c", T, 0, b"3")],
            IterTransforms::none(),
        );
        assert!(it.first());
        assert_eq!(it.key().user_key, b"a");
        assert!(it.next());
        assert_eq!(it.key().user_key, b"b");
        assert!(it.next());
        assert_eq!(it.key().user_key, b"c");
        assert_eq!(it.value(), b"3");
        assert!(!it.next());

        assert!(it.last());
        assert_eq!(it.key().user_key, b"c");
        assert!(it.prev());
        assert_eq!(it.key().user_key, b"b");
        assert!(it.prev());
        assert_eq!(it.key().user_key, b"a");
        assert!(!it.prev());
    }

    #[test]
    fn seek_ge_finds_least_key_at_or_above() {
        let mut it = data_iter(
            &[(b"a", T, 0, b"1"), (b"c", T, 0, b"3"), (b"e", T, 0, b"5")],
            IterTransforms::none(),
        );
        assert!(it.seek_ge(b"b"));
        assert_eq!(it.key().user_key, b"c");
        assert!(it.seek_ge(b"c"));
        assert_eq!(it.key().user_key, b"c");
        assert!(!it.seek_ge(b"f"));
    }

    #[test]
    fn hide_obsolete_points_skips_flagged_entries() {
        let entries: &[(&[u8], u64, u8, &[u8])] = &[
            (b"k", make_trailer(9, KeyKind::Set), 0, b"new"),
            (b"k", make_trailer(5, KeyKind::Set), ROW_FLAG_OBSOLETE, b"old"),
            (b"z", make_trailer(2, KeyKind::Set), 0, b"zv"),
        ];
        let mut it = data_iter(
            entries,
            IterTransforms {
                hide_obsolete_points: true,
                ..Default::default()
            },
        );
        assert!(it.first());
        assert_eq!(it.value(), b"new");
        assert!(it.next());
        assert_eq!(it.key().user_key, b"z");
        assert!(!it.next());

        // Backward pass skips the obsolete entry too.
        assert!(it.last());
        assert_eq!(it.key().user_key, b"z");
        assert!(it.prev());
        assert_eq!(it.value(), b"new");
    }

    #[test]
    fn synthetic_prefix_and_seqnum_rewrite_reported_keys() {
        let mut it = data_iter(
            &[(b"a", make_trailer(3, KeyKind::Set), 0, b"1")],
            IterTransforms {
                synthetic_prefix: Some(b"p/".to_vec()),
                synthetic_seqnum: Some(100),
                ..Default::default()
            },
        );
        assert!(it.first());
        assert_eq!(it.key().user_key, b"p/a");
        assert_eq!(it.key().seqnum(), 100);
    }

    #[test]
    fn index_iter_decodes_handles() {
        let mut b = RowBlockBuilder::new();
        for (sep, off) in [(b"c".as_slice(), 0u64), (b"f".as_slice(), 100)] {
            let hp = HandleWithProperties {
                handle: BlockHandle::new(off, 64),
                props: vec![],
            };
            b.add(sep, 0, 0, &hp.encode().unwrap()).unwrap();
        }
        let handle = BufferHandle::new(Arc::new(LoadedBlock::new(
            b.finish(),
            BlockMetadata::None,
            None,
        )));
        let mut it = RowIndexIter::new(handle, Arc::new(BytewiseComparator)).unwrap();

        assert!(it.seek_ge(b"d"));
        assert_eq!(it.separator(), b"f");
        assert_eq!(
            it.block_handle_with_properties().unwrap().handle,
            BlockHandle::new(100, 64)
        );
        assert!(it.prev());
        assert_eq!(it.separator(), b"c");
        assert!(!it.seek_ge(b"g"));
    }
}

//! Iterator traits, transforms, and block-property filters.
//!
//! Index and data blocks come in row- and column-oriented encodings, and
//! indexes come in single- and two-level shapes. The composed point
//! iterators in [`crate::reader`] are generic over these two traits, so
//! all four `{single, two} × {row, columnar}` combinations monomorphize:
//! the encoding is chosen once at construction and the hot `next`/`seek`
//! paths carry no per-step dispatch on the block layout.
//!
//! Transforms adjust what an iterator reports without touching the file:
//! obsolete-point hiding, a synthetic key prefix, and sequence-number
//! masking.

use std::sync::Arc;

use crate::base::{Comparator, KeyRef, SeqNum};
use crate::block::{BufferHandle, HandleWithProperties};
use crate::error::Result;

// ------------------------------------------------------------------------------------------------
// Transforms
// ------------------------------------------------------------------------------------------------

/// Transforms applied by point iterators.
#[derive(Debug, Clone, Default)]
pub struct IterTransforms {
    /// Skip entries the writer marked obsolete (shadowed by a newer entry
    /// in the same file). Callers setting this must also arrange for the
    /// obsolete-key block-property filter; see
    /// [`Reader::try_add_block_property_filter_for_hide_obsolete_points`].
    ///
    /// [`Reader::try_add_block_property_filter_for_hide_obsolete_points`]:
    /// crate::reader::Reader::try_add_block_property_filter_for_hide_obsolete_points
    pub hide_obsolete_points: bool,

    /// Prepend these bytes to every reported user key. Seek keys are
    /// expected in the transformed keyspace.
    pub synthetic_prefix: Option<Vec<u8>>,

    /// Report every entry at this sequence number instead of its own.
    pub synthetic_seqnum: Option<SeqNum>,
}

impl IterTransforms {
    /// The identity transform set.
    pub fn none() -> IterTransforms {
        IterTransforms::default()
    }
}

/// Transforms applied by fragment iterators.
#[derive(Debug, Clone, Default)]
pub struct FragmentIterTransforms {
    /// Prepend these bytes to every reported span bound.
    pub synthetic_prefix: Option<Vec<u8>>,

    /// Report every span key at this sequence number instead of its own.
    pub synthetic_seqnum: Option<SeqNum>,
}

impl FragmentIterTransforms {
    /// The identity transform set.
    pub fn none() -> FragmentIterTransforms {
        FragmentIterTransforms::default()
    }
}

// ------------------------------------------------------------------------------------------------
// Block iterator traits
// ------------------------------------------------------------------------------------------------

/// Cursor over an index block (top-level or sub-index).
///
/// Entries map a **separator** — the last user key of the referenced block
/// (or of the referenced sub-index's span) — to an encoded
/// [`HandleWithProperties`]. `seek_ge(k)` positions at the first entry
/// whose separator is ≥ `k`, which is exactly the first block that could
/// contain `k`.
pub trait IndexIterator: Send + Sized {
    /// Opens a cursor over a loaded index block.
    fn new(block: BufferHandle, cmp: Arc<dyn Comparator>) -> Result<Self>;

    /// Positions at the first entry with separator ≥ `key`. Returns
    /// validity.
    fn seek_ge(&mut self, key: &[u8]) -> bool;

    /// Positions at the first entry.
    fn first(&mut self) -> bool;

    /// Positions at the last entry.
    fn last(&mut self) -> bool;

    /// Advances one entry.
    fn next(&mut self) -> bool;

    /// Retreats one entry.
    fn prev(&mut self) -> bool;

    /// Whether the cursor is positioned on an entry.
    fn valid(&self) -> bool;

    /// The current separator key. Caller must check `valid` first.
    fn separator(&self) -> &[u8];

    /// Decodes the current entry's block handle and property bytes.
    fn block_handle_with_properties(&self) -> Result<HandleWithProperties>;
}

/// Cursor over the internal key/value records of one data block.
///
/// Seek keys are raw in-block user keys: the composed iterators strip any
/// synthetic prefix before seeking. Reported keys have the transforms
/// applied (prefix prepended, sequence number masked), and entries marked
/// obsolete are skipped when the transform asks for it.
pub trait DataIterator: Send + Sized {
    /// Opens a cursor over a loaded data block.
    fn new(
        block: BufferHandle,
        cmp: Arc<dyn Comparator>,
        transforms: IterTransforms,
    ) -> Result<Self>;

    /// Positions at the first entry with user key ≥ `key`. Returns
    /// validity.
    fn seek_ge(&mut self, key: &[u8]) -> bool;

    /// Positions at the first entry.
    fn first(&mut self) -> bool;

    /// Positions at the last entry.
    fn last(&mut self) -> bool;

    /// Advances one entry.
    fn next(&mut self) -> bool;

    /// Retreats one entry.
    fn prev(&mut self) -> bool;

    /// Whether the cursor is positioned on an entry.
    fn valid(&self) -> bool;

    /// The current internal key, transforms applied. Caller must check
    /// `valid` first.
    fn key(&self) -> KeyRef<'_>;

    /// The current raw value bytes (value-prefix byte included for formats
    /// that store one). Caller must check `valid` first.
    fn value(&self) -> &[u8];
}

// ------------------------------------------------------------------------------------------------
// Block-property filters
// ------------------------------------------------------------------------------------------------

/// Evaluates the opaque per-block property bytes recorded in index entries.
/// Returning `false` from `intersects` vetoes the block: it is skipped
/// without being fetched.
pub trait BlockPropertyFilter: Send + Sync {
    /// Filter name, for diagnostics.
    fn name(&self) -> &'static str;

    /// Whether a block with these property bytes may contain relevant
    /// entries.
    fn intersects(&self, props: &[u8]) -> Result<bool>;
}

/// Property byte written for blocks whose points are all obsolete.
pub(crate) const PROP_ALL_POINTS_OBSOLETE: u8 = 1;

/// Skips blocks whose points are all obsolete. Paired with the
/// hide-obsolete-points transform.
#[derive(Debug, Default, Copy, Clone)]
pub struct ObsoleteKeyBlockPropertyFilter;

impl BlockPropertyFilter for ObsoleteKeyBlockPropertyFilter {
    fn name(&self) -> &'static str {
        "petra.obsolete-key"
    }

    fn intersects(&self, props: &[u8]) -> Result<bool> {
        Ok(props != [PROP_ALL_POINTS_OBSOLETE])
    }
}

/// The set of block-property filters attached to one iterator. A block is
/// fetched only if every filter intersects its property bytes.
#[derive(Clone, Default)]
pub struct BlockPropertiesFilterer {
    filters: Vec<Arc<dyn BlockPropertyFilter>>,
}

impl BlockPropertiesFilterer {
    /// A filterer over the given filters.
    pub fn new(filters: Vec<Arc<dyn BlockPropertyFilter>>) -> BlockPropertiesFilterer {
        BlockPropertiesFilterer { filters }
    }

    /// Whether any filters are attached.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Appends a filter.
    pub fn push(&mut self, filter: Arc<dyn BlockPropertyFilter>) {
        self.filters.push(filter);
    }

    /// Whether a block with these property bytes should be fetched.
    pub fn intersects(&self, props: &[u8]) -> Result<bool> {
        for f in &self.filters {
            if !f.intersects(props)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obsolete_filter_vetoes_fully_obsolete_blocks() {
        let f = ObsoleteKeyBlockPropertyFilter;
        assert!(!f.intersects(&[PROP_ALL_POINTS_OBSOLETE]).unwrap());
        assert!(f.intersects(&[]).unwrap());
        assert!(f.intersects(&[0]).unwrap());
    }

    #[test]
    fn filterer_requires_every_filter_to_intersect() {
        let mut filterer = BlockPropertiesFilterer::default();
        assert!(filterer.intersects(&[PROP_ALL_POINTS_OBSOLETE]).unwrap());

        filterer.push(Arc::new(ObsoleteKeyBlockPropertyFilter));
        assert!(!filterer.intersects(&[PROP_ALL_POINTS_OBSOLETE]).unwrap());
        assert!(filterer.intersects(&[]).unwrap());
    }
}

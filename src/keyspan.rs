//! Keyspan fragments: range deletions and range keys.
//!
//! A **span** covers the half-open key range `[start, end)` and carries
//! one or more keyspan keys — range-del tombstones or range-key records,
//! each with its own trailer. Tables store spans pre-fragmented: sorted by
//! start key and non-overlapping, so membership is constant over each
//! fragment.
//!
//! Row-format keyspan blocks are a single fixed-int encoded list of spans.
//! Columnar keyspan blocks put start keys in the key column (enabling
//! binary search) and the encoded remainder of each span in the value
//! column.
//!
//! Missing blocks (zero-length handle) yield no iterator rather than an
//! error. In debug builds, iterators are wrapped in an ordering assertion.

use std::sync::Arc;

use crate::base::{trailer_with_seqnum, wire_config, Comparator};
use crate::block::{BufferHandle, BlockMetadata};
use crate::colblk::ColumnarKeyspanMeta;
use crate::error::{Result, SstError};
use crate::iterator::FragmentIterTransforms;

// ------------------------------------------------------------------------------------------------
// Spans
// ------------------------------------------------------------------------------------------------

/// One record applying over a span: a range-del tombstone or a range-key
/// set/unset/delete.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct SpanKey {
    /// Packed `(seqnum << 8) | kind`; the kind is one of the range kinds.
    pub trailer: u64,

    /// Range-key suffix bytes; empty for tombstones.
    pub suffix: Vec<u8>,

    /// Range-key value bytes; empty for tombstones.
    pub value: Vec<u8>,
}

/// A fragment: maximal subrange over which a fixed set of keyspan keys
/// applies.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Span {
    /// Inclusive start bound.
    pub start: Vec<u8>,

    /// Exclusive end bound.
    pub end: Vec<u8>,

    /// Keys applying over `[start, end)`, newest first.
    pub keys: Vec<SpanKey>,
}

/// Value-column payload of a columnar keyspan row: everything but the
/// start key.
#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub(crate) struct SpanPayload {
    pub(crate) end: Vec<u8>,
    pub(crate) keys: Vec<SpanKey>,
}

fn apply_transforms(span: &mut Span, transforms: &FragmentIterTransforms) {
    if let Some(prefix) = &transforms.synthetic_prefix {
        let mut start = Vec::with_capacity(prefix.len() + span.start.len());
        start.extend_from_slice(prefix);
        start.extend_from_slice(&span.start);
        span.start = start;
        let mut end = Vec::with_capacity(prefix.len() + span.end.len());
        end.extend_from_slice(prefix);
        end.extend_from_slice(&span.end);
        span.end = end;
    }
    if let Some(seqnum) = transforms.synthetic_seqnum {
        for key in &mut span.keys {
            key.trailer = trailer_with_seqnum(key.trailer, seqnum);
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Fragment iterator
// ------------------------------------------------------------------------------------------------

/// Cursor over the sorted, non-overlapping fragments of one keyspan block.
pub trait FragmentIterator: Send {
    /// Positions at the first span.
    fn first(&mut self) -> Result<Option<&Span>>;

    /// Advances one span.
    fn next(&mut self) -> Result<Option<&Span>>;

    /// Positions at the first span whose end bound is greater than `key`
    /// (the first span covering `key` or any later key).
    fn seek_ge(&mut self, key: &[u8]) -> Result<Option<&Span>>;
}

// ------------------------------------------------------------------------------------------------
// Row-format iterator
// ------------------------------------------------------------------------------------------------

/// Fragment iterator over a row-format keyspan block: the whole block is
/// decoded up front.
pub struct RowFragmentIter {
    spans: Vec<Span>,
    cmp: Arc<dyn Comparator>,
    transforms: FragmentIterTransforms,
    /// Index of the span to yield next.
    pos: usize,
    current: Option<Span>,
}

impl RowFragmentIter {
    /// Decodes the block and builds the iterator.
    pub fn new(
        block: &BufferHandle,
        cmp: Arc<dyn Comparator>,
        transforms: FragmentIterTransforms,
    ) -> Result<RowFragmentIter> {
        let (spans, used) =
            bincode::decode_from_slice::<Vec<Span>, _>(block.data(), wire_config())?;
        if used != block.data().len() {
            return Err(SstError::Corruption(
                "trailing bytes after keyspan block".into(),
            ));
        }
        Ok(RowFragmentIter {
            spans,
            cmp,
            transforms,
            pos: 0,
            current: None,
        })
    }

    fn yield_at(&mut self, idx: usize) -> Option<&Span> {
        if idx >= self.spans.len() {
            self.current = None;
            return None;
        }
        self.pos = idx + 1;
        let mut span = self.spans[idx].clone();
        apply_transforms(&mut span, &self.transforms);
        self.current = Some(span);
        self.current.as_ref()
    }
}

impl FragmentIterator for RowFragmentIter {
    fn first(&mut self) -> Result<Option<&Span>> {
        Ok(self.yield_at(0))
    }

    fn next(&mut self) -> Result<Option<&Span>> {
        let idx = self.pos;
        Ok(self.yield_at(idx))
    }

    fn seek_ge(&mut self, key: &[u8]) -> Result<Option<&Span>> {
        // First span with end > key. Spans are sorted and non-overlapping.
        let idx = self
            .spans
            .partition_point(|s| self.cmp.compare(&s.end, key) != std::cmp::Ordering::Greater);
        Ok(self.yield_at(idx))
    }
}

// ------------------------------------------------------------------------------------------------
// Columnar iterator
// ------------------------------------------------------------------------------------------------

/// Fragment iterator over a columnar keyspan block: rows decode on demand.
pub struct ColFragmentIter {
    block: BufferHandle,
    meta: ColumnarKeyspanMeta,
    cmp: Arc<dyn Comparator>,
    transforms: FragmentIterTransforms,
    pos: usize,
    current: Option<Span>,
}

impl ColFragmentIter {
    /// Builds the iterator over a loaded columnar keyspan block.
    pub fn new(
        block: &BufferHandle,
        cmp: Arc<dyn Comparator>,
        transforms: FragmentIterTransforms,
    ) -> Result<ColFragmentIter> {
        let meta = match block.metadata() {
            BlockMetadata::ColumnarKeyspan(m) => *m,
            _ => {
                return Err(SstError::Internal(
                    "keyspan block loaded without columnar metadata".into(),
                ))
            }
        };
        Ok(ColFragmentIter {
            block: block.clone(),
            meta,
            cmp,
            transforms,
            pos: 0,
            current: None,
        })
    }

    fn decode_row(&self, row: usize) -> Result<Span> {
        let data = self.block.data();
        let start = data[self.meta.key_range(data, row)].to_vec();
        let payload_bytes = &data[self.meta.value_range(data, row)];
        let (payload, used) =
            bincode::decode_from_slice::<SpanPayload, _>(payload_bytes, wire_config())?;
        if used != payload_bytes.len() {
            return Err(SstError::Corruption(
                "trailing bytes after keyspan row".into(),
            ));
        }
        Ok(Span {
            start,
            end: payload.end,
            keys: payload.keys,
        })
    }

    fn yield_at(&mut self, idx: usize) -> Result<Option<&Span>> {
        if idx >= self.meta.rows {
            self.current = None;
            return Ok(None);
        }
        self.pos = idx + 1;
        let mut span = self.decode_row(idx)?;
        apply_transforms(&mut span, &self.transforms);
        self.current = Some(span);
        Ok(self.current.as_ref())
    }
}

impl FragmentIterator for ColFragmentIter {
    fn first(&mut self) -> Result<Option<&Span>> {
        self.yield_at(0)
    }

    fn next(&mut self) -> Result<Option<&Span>> {
        let idx = self.pos;
        self.yield_at(idx)
    }

    fn seek_ge(&mut self, key: &[u8]) -> Result<Option<&Span>> {
        // Binary search over end bounds: first row with end > key. End
        // bounds are sorted because spans are sorted and non-overlapping.
        let data = self.block.data();
        let mut lo = 0usize;
        let mut hi = self.meta.rows;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let payload_bytes = &data[self.meta.value_range(data, mid)];
            let (payload, _) =
                bincode::decode_from_slice::<SpanPayload, _>(payload_bytes, wire_config())?;
            if self.cmp.compare(&payload.end, key) != std::cmp::Ordering::Greater {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        self.yield_at(lo)
    }
}

// ------------------------------------------------------------------------------------------------
// Ordering assertions
// ------------------------------------------------------------------------------------------------

/// Wraps `iter` in an ordering-validation shim in debug builds; returns it
/// unchanged in release builds.
pub fn maybe_assert(
    iter: Box<dyn FragmentIterator>,
    cmp: Arc<dyn Comparator>,
) -> Box<dyn FragmentIterator> {
    if cfg!(debug_assertions) {
        Box::new(AssertingFragmentIter {
            inner: iter,
            cmp,
            prev_end: None,
        })
    } else {
        iter
    }
}

struct AssertingFragmentIter {
    inner: Box<dyn FragmentIterator>,
    cmp: Arc<dyn Comparator>,
    prev_end: Option<Vec<u8>>,
}

impl FragmentIterator for AssertingFragmentIter {
    fn first(&mut self) -> Result<Option<&Span>> {
        self.prev_end = None;
        let span = self.inner.first()?;
        Ok(Self::check_static(&mut self.prev_end, &self.cmp, span, false))
    }

    fn next(&mut self) -> Result<Option<&Span>> {
        let span = self.inner.next()?;
        Ok(Self::check_static(&mut self.prev_end, &self.cmp, span, true))
    }

    fn seek_ge(&mut self, key: &[u8]) -> Result<Option<&Span>> {
        self.prev_end = None;
        let span = self.inner.seek_ge(key)?;
        Ok(Self::check_static(&mut self.prev_end, &self.cmp, span, false))
    }
}

impl AssertingFragmentIter {
    fn check_static<'a>(
        prev_end: &mut Option<Vec<u8>>,
        cmp: &Arc<dyn Comparator>,
        span: Option<&'a Span>,
        sequential: bool,
    ) -> Option<&'a Span> {
        if let Some(span) = span {
            debug_assert!(
                cmp.compare(&span.start, &span.end) == std::cmp::Ordering::Less,
                "span start must precede end"
            );
            if sequential {
                if let Some(prev) = prev_end.as_ref() {
                    debug_assert!(
                        cmp.compare(prev, &span.start) != std::cmp::Ordering::Greater,
                        "spans must be sorted and non-overlapping"
                    );
                }
            }
            *prev_end = Some(span.end.clone());
        }
        span
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{make_trailer, BytewiseComparator, KeyKind};
    use crate::block::LoadedBlock;
    use crate::colblk::{init_keyspan_block_metadata, TwoColumnBlockBuilder};

    fn tombstone(seqnum: u64) -> SpanKey {
        SpanKey {
            trailer: make_trailer(seqnum, KeyKind::RangeDelete),
            suffix: Vec::new(),
            value: Vec::new(),
        }
    }

    fn spans() -> Vec<Span> {
        vec![
            Span {
                start: b"a".to_vec(),
                end: b"d".to_vec(),
                keys: vec![tombstone(10)],
            },
            Span {
                start: b"f".to_vec(),
                end: b"k".to_vec(),
                keys: vec![tombstone(12), tombstone(4)],
            },
        ]
    }

    fn row_block(spans: &[Span]) -> BufferHandle {
        let bytes = bincode::encode_to_vec(spans, wire_config()).unwrap();
        BufferHandle::new(Arc::new(LoadedBlock::new(bytes, BlockMetadata::None, None)))
    }

    fn col_block(spans: &[Span]) -> BufferHandle {
        let mut b = TwoColumnBlockBuilder::new();
        for s in spans {
            let payload = SpanPayload {
                end: s.end.clone(),
                keys: s.keys.clone(),
            };
            b.add(&s.start, &bincode::encode_to_vec(&payload, wire_config()).unwrap());
        }
        let bytes = b.finish();
        let meta = init_keyspan_block_metadata(&bytes).unwrap();
        BufferHandle::new(Arc::new(LoadedBlock::new(
            bytes,
            BlockMetadata::ColumnarKeyspan(meta),
            None,
        )))
    }

    fn exercise(mut it: Box<dyn FragmentIterator>) {
        let first = it.first().unwrap().unwrap();
        assert_eq!(first.start, b"a");
        assert_eq!(first.end, b"d");
        assert_eq!(first.keys.len(), 1);

        let second = it.next().unwrap().unwrap();
        assert_eq!(second.start, b"f");
        assert_eq!(second.keys.len(), 2);
        assert!(it.next().unwrap().is_none());

        // "c" is inside the first span.
        let covering = it.seek_ge(b"c").unwrap().unwrap();
        assert_eq!(covering.start, b"a");
        // "d" is the first span's exclusive end: the second span is next.
        let after = it.seek_ge(b"d").unwrap().unwrap();
        assert_eq!(after.start, b"f");
        assert!(it.seek_ge(b"z").unwrap().is_none());
    }

    #[test]
    fn row_fragment_iterator() {
        let block = row_block(&spans());
        let it = RowFragmentIter::new(
            &block,
            Arc::new(BytewiseComparator),
            FragmentIterTransforms::none(),
        )
        .unwrap();
        exercise(maybe_assert(Box::new(it), Arc::new(BytewiseComparator)));
    }

    #[test]
    fn columnar_fragment_iterator() {
        let block = col_block(&spans());
        let it = ColFragmentIter::new(
            &block,
            Arc::new(BytewiseComparator),
            FragmentIterTransforms::none(),
        )
        .unwrap();
        exercise(maybe_assert(Box::new(it), Arc::new(BytewiseComparator)));
    }

    #[test]
    fn transforms_rewrite_bounds_and_seqnums() {
        let block = row_block(&spans());
        let mut it = RowFragmentIter::new(
            &block,
            Arc::new(BytewiseComparator),
            FragmentIterTransforms {
                synthetic_prefix: Some(b"p/".to_vec()),
                synthetic_seqnum: Some(99),
            },
        )
        .unwrap();
        let span = it.first().unwrap().unwrap();
        assert_eq!(span.start, b"p/a");
        assert_eq!(span.end, b"p/d");
        assert_eq!(span.keys[0].trailer >> 8, 99);
    }

    #[test]
    fn corrupt_row_block_is_detected() {
        let mut bytes = bincode::encode_to_vec(&spans(), wire_config()).unwrap();
        bytes.push(0xff);
        let block =
            BufferHandle::new(Arc::new(LoadedBlock::new(bytes, BlockMetadata::None, None)));
        assert!(RowFragmentIter::new(
            &block,
            Arc::new(BytewiseComparator),
            FragmentIterTransforms::none(),
        )
        .is_err());
    }
}

//! Composed point iterators over a table.
//!
//! [`SinglePointIter`] drives a flat index; [`TwoLevelPointIter`] drives a
//! partitioned one. Both are generic over the index- and data-iterator
//! traits, so the four `{single, two-level} × {row, columnar}` variants
//! are distinct monomorphized types chosen once at construction — the
//! per-step paths never dispatch on the block encoding. The only virtual
//! hop is the [`SstIterator`] object the reader hands back.
//!
//! An iterator holds a strong reference to its reader. Closing the reader
//! while iterators live is permitted: every subsequent operation on them
//! fails with the reader-closed sentinel. Errors that render the reader
//! unusable are latched into it as they surface here.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::warn;

use crate::base::InternalKey;
use crate::block::{BufferHandle, ReadEnv, TRAILER_LEN};
use crate::error::{Result, SstError};
use crate::filter::FilterBlockSizeLimit;
use crate::iterator::{BlockPropertiesFilterer, DataIterator, IndexIterator, IterTransforms};
use crate::readable::ReadContext;
use crate::valblk::{decode_value_field, LazyValue, ReaderProvider, ValueField};

use super::Reader;

/// An internal key paired with its (possibly unfetched) value.
pub type IterItem = Option<(InternalKey, LazyValue)>;

/// Point iterator over a table, in comparator order.
///
/// Positioning operations return the entry they land on, or `None` when
/// the iterator is exhausted in that direction. `next` after exhaustion
/// stays exhausted until the iterator is repositioned.
pub trait SstIterator: Send {
    /// Positions at the least entry with user key ≥ `key` within bounds.
    fn seek_ge(&mut self, key: &[u8]) -> Result<IterItem>;

    /// Positions at the first in-bounds entry.
    fn first(&mut self) -> Result<IterItem>;

    /// Advances one entry.
    fn next(&mut self) -> Result<IterItem>;

    /// Positions at the last in-bounds entry.
    fn last(&mut self) -> Result<IterItem>;

    /// Retreats one entry.
    fn prev(&mut self) -> Result<IterItem>;

    /// Bytes of data blocks loaded so far. Only tracked by compaction
    /// iterators; zero otherwise.
    fn bytes_iterated(&self) -> u64;
}

/// Construction-time configuration shared by both iterator shapes.
pub(crate) struct PointIterConfig {
    pub(crate) rctx: ReadContext,
    pub(crate) transforms: IterTransforms,
    pub(crate) lower: Option<Vec<u8>>,
    pub(crate) upper: Option<Vec<u8>>,
    pub(crate) filterer: Option<BlockPropertiesFilterer>,
    pub(crate) filter_block_size_limit: FilterBlockSizeLimit,
    pub(crate) env: ReadEnv,
    pub(crate) provider: Arc<dyn ReaderProvider>,
    pub(crate) for_compaction: bool,
}

// ------------------------------------------------------------------------------------------------
// Shared helpers
// ------------------------------------------------------------------------------------------------

/// A seek key translated into the raw in-block keyspace.
enum Stripped<'a> {
    Within(&'a [u8]),
    PastEnd,
}

/// Like [`Stripped`] but for upper-bound (seek-before) translation.
enum StrippedLt<'a> {
    BeforeAll,
    Within(&'a [u8]),
    AfterAll,
}

fn strip_for_ge<'a>(transforms: &IterTransforms, key: &'a [u8]) -> Stripped<'a> {
    match &transforms.synthetic_prefix {
        None => Stripped::Within(key),
        Some(p) => {
            if let Some(rest) = key.strip_prefix(p.as_slice()) {
                Stripped::Within(rest)
            } else if key < p.as_slice() {
                // Every prefixed key sorts at or after the prefix itself.
                Stripped::Within(&[])
            } else {
                Stripped::PastEnd
            }
        }
    }
}

fn strip_for_lt<'a>(transforms: &IterTransforms, key: &'a [u8]) -> StrippedLt<'a> {
    match &transforms.synthetic_prefix {
        None => StrippedLt::Within(key),
        Some(p) => {
            if let Some(rest) = key.strip_prefix(p.as_slice()) {
                StrippedLt::Within(rest)
            } else if key <= p.as_slice() {
                StrippedLt::BeforeAll
            } else {
                StrippedLt::AfterAll
            }
        }
    }
}

/// Materializes the current entry: owned internal key plus lazy value.
fn materialize<D: DataIterator>(
    reader: &Reader,
    provider: &Arc<dyn ReaderProvider>,
    data: &Option<D>,
) -> Result<IterItem> {
    let Some(d) = data else { return Ok(None) };
    if !d.valid() {
        return Ok(None);
    }
    let key = d.key().to_owned();
    let raw = d.value();
    let value = if reader.format().supports_value_blocks() {
        match decode_value_field(raw)? {
            ValueField::Inline(bytes) => LazyValue::inline(bytes.to_vec()),
            ValueField::Handle(vh) => LazyValue::stored(vh, provider.clone()),
        }
    } else {
        LazyValue::inline(raw.to_vec())
    };
    Ok(Some((key, value)))
}

fn beyond_upper<D: DataIterator>(reader: &Reader, upper: &Option<Vec<u8>>, d: &D) -> bool {
    match upper {
        Some(u) => reader.comparator().compare(d.key().user_key, u) != Ordering::Less,
        None => false,
    }
}

fn below_lower<D: DataIterator>(reader: &Reader, lower: &Option<Vec<u8>>, d: &D) -> bool {
    match lower {
        Some(l) => reader.comparator().compare(d.key().user_key, l) == Ordering::Less,
        None => false,
    }
}

/// Probes the table filter for `key`, loading the filter block on first
/// use. Filter read failures disable the filter rather than failing the
/// seek; cancellation propagates.
fn filter_excludes(
    reader: &Reader,
    rctx: &ReadContext,
    env: &ReadEnv,
    use_filter: &mut bool,
    filter_block: &mut Option<BufferHandle>,
    key: &[u8],
) -> Result<bool> {
    if !*use_filter {
        return Ok(false);
    }
    let Some(table_filter) = reader.table_filter() else {
        return Ok(false);
    };
    if filter_block.is_none() {
        match reader.read_filter_block(rctx, env, reader.filter_bh()) {
            Ok(h) => *filter_block = Some(h),
            Err(SstError::Cancelled) => return Err(SstError::Cancelled),
            Err(e) => {
                warn!(error = %e, "filter block unreadable; disabling filter");
                *use_filter = false;
                return Ok(false);
            }
        }
    }
    let block = filter_block.as_ref().expect("loaded above");
    Ok(!table_filter.may_contain(block.data(), key))
}

fn resolve_use_filter(reader: &Reader, cfg: &PointIterConfig) -> bool {
    reader.table_filter().is_some()
        && reader.filter_bh().length > 0
        && cfg.filter_block_size_limit.permits(reader.filter_bh().length)
}

// ------------------------------------------------------------------------------------------------
// Single-level iterator
// ------------------------------------------------------------------------------------------------

/// Point iterator over a table with a flat index.
pub struct SinglePointIter<I: IndexIterator, D: DataIterator> {
    reader: Arc<Reader>,
    cfg: PointIterConfig,
    index: I,
    data: Option<D>,
    use_filter: bool,
    filter_block: Option<BufferHandle>,
    bytes_iterated: u64,
}

impl<I: IndexIterator, D: DataIterator> SinglePointIter<I, D> {
    pub(crate) fn new(reader: Arc<Reader>, cfg: PointIterConfig) -> Result<Self> {
        let index_h = reader.read_index_block(&cfg.rctx, &cfg.env, reader.index_bh())?;
        let index = I::new(index_h, reader.comparator().clone())?;
        let use_filter = resolve_use_filter(&reader, &cfg);
        Ok(SinglePointIter {
            reader,
            cfg,
            index,
            data: None,
            use_filter,
            filter_block: None,
            bytes_iterated: 0,
        })
    }

    /// Loads the data block at the current index entry. `Ok(false)` means
    /// a block-property filter vetoed it.
    fn load_data_block(&mut self) -> Result<bool> {
        let hp = self.index.block_handle_with_properties()?;
        if let Some(filterer) = &self.cfg.filterer {
            if !filterer.intersects(&hp.props)? {
                self.data = None;
                return Ok(false);
            }
        }
        let h = self
            .reader
            .read_data_block(&self.cfg.rctx, &self.cfg.env, hp.handle)?;
        if self.cfg.for_compaction {
            self.bytes_iterated += hp.handle.length + TRAILER_LEN;
        }
        self.data = Some(D::new(
            h,
            self.reader.comparator().clone(),
            self.cfg.transforms.clone(),
        )?);
        Ok(true)
    }

    fn finish_forward(&mut self) -> Result<IterItem> {
        let beyond = match &self.data {
            Some(d) if d.valid() => beyond_upper(&self.reader, &self.cfg.upper, d),
            _ => false,
        };
        if beyond {
            self.data = None;
            return Ok(None);
        }
        materialize(&self.reader, &self.cfg.provider, &self.data)
    }

    fn finish_backward(&mut self) -> Result<IterItem> {
        let below = match &self.data {
            Some(d) if d.valid() => below_lower(&self.reader, &self.cfg.lower, d),
            _ => false,
        };
        if below {
            self.data = None;
            return Ok(None);
        }
        materialize(&self.reader, &self.cfg.provider, &self.data)
    }

    fn exhaust(&mut self) -> Result<IterItem> {
        self.data = None;
        Ok(None)
    }

    fn seek_ge_impl(&mut self, key: &[u8]) -> Result<IterItem> {
        self.reader.check_open()?;
        let lower = self.cfg.lower.clone();
        let key = match &lower {
            Some(l) if self.reader.comparator().compare(key, l) == Ordering::Less => l.as_slice(),
            _ => key,
        };
        let eff: Vec<u8> = match strip_for_ge(&self.cfg.transforms, key) {
            Stripped::Within(k) => k.to_vec(),
            Stripped::PastEnd => return self.exhaust(),
        };
        if filter_excludes(
            &self.reader,
            &self.cfg.rctx,
            &self.cfg.env,
            &mut self.use_filter,
            &mut self.filter_block,
            &eff,
        )? {
            return self.exhaust();
        }
        if !self.index.seek_ge(&eff) {
            return self.exhaust();
        }
        loop {
            if self.load_data_block()? && self.data.as_mut().expect("loaded").seek_ge(&eff) {
                break;
            }
            if !self.index.next() {
                return self.exhaust();
            }
        }
        self.finish_forward()
    }

    fn first_impl(&mut self) -> Result<IterItem> {
        self.reader.check_open()?;
        if let Some(lower) = self.cfg.lower.clone() {
            return self.seek_ge_impl(&lower);
        }
        if !self.index.first() {
            return self.exhaust();
        }
        loop {
            if self.load_data_block()? && self.data.as_mut().expect("loaded").first() {
                break;
            }
            if !self.index.next() {
                return self.exhaust();
            }
        }
        self.finish_forward()
    }

    fn next_impl(&mut self) -> Result<IterItem> {
        self.reader.check_open()?;
        let Some(d) = self.data.as_mut() else {
            return Ok(None);
        };
        if d.next() {
            return self.finish_forward();
        }
        loop {
            if !self.index.next() {
                return self.exhaust();
            }
            if self.load_data_block()? && self.data.as_mut().expect("loaded").first() {
                break;
            }
        }
        self.finish_forward()
    }

    fn last_impl(&mut self) -> Result<IterItem> {
        self.reader.check_open()?;
        if let Some(upper) = self.cfg.upper.clone() {
            return self.seek_lt_impl(&upper);
        }
        if !self.index.last() {
            return self.exhaust();
        }
        loop {
            if self.load_data_block()? && self.data.as_mut().expect("loaded").last() {
                break;
            }
            if !self.index.prev() {
                return self.exhaust();
            }
        }
        self.finish_backward()
    }

    fn prev_impl(&mut self) -> Result<IterItem> {
        self.reader.check_open()?;
        let Some(d) = self.data.as_mut() else {
            return Ok(None);
        };
        if d.prev() {
            return self.finish_backward();
        }
        loop {
            if !self.index.prev() {
                return self.exhaust();
            }
            if self.load_data_block()? && self.data.as_mut().expect("loaded").last() {
                break;
            }
        }
        self.finish_backward()
    }

    /// Positions at the greatest entry with user key < `key`.
    fn seek_lt_impl(&mut self, key: &[u8]) -> Result<IterItem> {
        let eff: Option<Vec<u8>> = match strip_for_lt(&self.cfg.transforms, key) {
            StrippedLt::BeforeAll => return self.exhaust(),
            StrippedLt::Within(k) => Some(k.to_vec()),
            StrippedLt::AfterAll => None,
        };
        let positioned_index = match &eff {
            None => self.index.last(),
            Some(k) => self.index.seek_ge(k) || self.index.last(),
        };
        if !positioned_index {
            return self.exhaust();
        }
        loop {
            if self.load_data_block()? {
                let d = self.data.as_mut().expect("loaded");
                let positioned = match &eff {
                    Some(k) => {
                        if d.seek_ge(k) {
                            d.prev()
                        } else {
                            d.last()
                        }
                    }
                    None => d.last(),
                };
                if positioned {
                    break;
                }
            }
            if !self.index.prev() {
                return self.exhaust();
            }
        }
        self.finish_backward()
    }

    fn note<T>(&self, res: &Result<T>) {
        if let Err(e) = res {
            self.reader.latch(e);
        }
    }
}

impl<I: IndexIterator, D: DataIterator> SstIterator for SinglePointIter<I, D> {
    fn seek_ge(&mut self, key: &[u8]) -> Result<IterItem> {
        let res = self.seek_ge_impl(key);
        self.note(&res);
        res
    }

    fn first(&mut self) -> Result<IterItem> {
        let res = self.first_impl();
        self.note(&res);
        res
    }

    fn next(&mut self) -> Result<IterItem> {
        let res = self.next_impl();
        self.note(&res);
        res
    }

    fn last(&mut self) -> Result<IterItem> {
        let res = self.last_impl();
        self.note(&res);
        res
    }

    fn prev(&mut self) -> Result<IterItem> {
        let res = self.prev_impl();
        self.note(&res);
        res
    }

    fn bytes_iterated(&self) -> u64 {
        self.bytes_iterated
    }
}

// ------------------------------------------------------------------------------------------------
// Two-level iterator
// ------------------------------------------------------------------------------------------------

/// Point iterator over a table with a partitioned index: the top level
/// selects a sub-index block, the sub-index selects data blocks.
pub struct TwoLevelPointIter<I: IndexIterator, D: DataIterator> {
    reader: Arc<Reader>,
    cfg: PointIterConfig,
    top: I,
    second: Option<I>,
    data: Option<D>,
    use_filter: bool,
    filter_block: Option<BufferHandle>,
    bytes_iterated: u64,
}

impl<I: IndexIterator, D: DataIterator> TwoLevelPointIter<I, D> {
    pub(crate) fn new(reader: Arc<Reader>, cfg: PointIterConfig) -> Result<Self> {
        let index_h = reader.read_index_block(&cfg.rctx, &cfg.env, reader.index_bh())?;
        let top = I::new(index_h, reader.comparator().clone())?;
        let use_filter = resolve_use_filter(&reader, &cfg);
        Ok(TwoLevelPointIter {
            reader,
            cfg,
            top,
            second: None,
            data: None,
            use_filter,
            filter_block: None,
            bytes_iterated: 0,
        })
    }

    /// Loads the sub-index block at the current top-level entry.
    /// `Ok(false)` means a block-property filter vetoed the whole
    /// partition.
    fn load_second(&mut self) -> Result<bool> {
        let hp = self.top.block_handle_with_properties()?;
        if let Some(filterer) = &self.cfg.filterer {
            if !filterer.intersects(&hp.props)? {
                self.second = None;
                self.data = None;
                return Ok(false);
            }
        }
        let h = self
            .reader
            .read_index_block(&self.cfg.rctx, &self.cfg.env, hp.handle)?;
        self.second = Some(I::new(h, self.reader.comparator().clone())?);
        Ok(true)
    }

    /// Loads the data block at the current sub-index entry. `Ok(false)`
    /// means a block-property filter vetoed it.
    fn load_data_block(&mut self) -> Result<bool> {
        let s = self.second.as_ref().expect("sub-index positioned");
        let hp = s.block_handle_with_properties()?;
        if let Some(filterer) = &self.cfg.filterer {
            if !filterer.intersects(&hp.props)? {
                self.data = None;
                return Ok(false);
            }
        }
        let h = self
            .reader
            .read_data_block(&self.cfg.rctx, &self.cfg.env, hp.handle)?;
        if self.cfg.for_compaction {
            self.bytes_iterated += hp.handle.length + TRAILER_LEN;
        }
        self.data = Some(D::new(
            h,
            self.reader.comparator().clone(),
            self.cfg.transforms.clone(),
        )?);
        Ok(true)
    }

    /// Advances to the next sub-index entry, crossing partitions as
    /// needed.
    fn advance_second_forward(&mut self) -> Result<bool> {
        if let Some(s) = self.second.as_mut() {
            if s.next() {
                return Ok(true);
            }
        }
        loop {
            if !self.top.next() {
                self.second = None;
                return Ok(false);
            }
            if self.load_second()? && self.second.as_mut().expect("loaded").first() {
                return Ok(true);
            }
        }
    }

    /// Retreats to the previous sub-index entry, crossing partitions as
    /// needed.
    fn advance_second_backward(&mut self) -> Result<bool> {
        if let Some(s) = self.second.as_mut() {
            if s.prev() {
                return Ok(true);
            }
        }
        loop {
            if !self.top.prev() {
                self.second = None;
                return Ok(false);
            }
            if self.load_second()? && self.second.as_mut().expect("loaded").last() {
                return Ok(true);
            }
        }
    }

    fn exhaust(&mut self) -> Result<IterItem> {
        self.second = None;
        self.data = None;
        Ok(None)
    }

    fn finish_forward(&mut self) -> Result<IterItem> {
        let beyond = match &self.data {
            Some(d) if d.valid() => beyond_upper(&self.reader, &self.cfg.upper, d),
            _ => false,
        };
        if beyond {
            self.data = None;
            return Ok(None);
        }
        materialize(&self.reader, &self.cfg.provider, &self.data)
    }

    fn finish_backward(&mut self) -> Result<IterItem> {
        let below = match &self.data {
            Some(d) if d.valid() => below_lower(&self.reader, &self.cfg.lower, d),
            _ => false,
        };
        if below {
            self.data = None;
            return Ok(None);
        }
        materialize(&self.reader, &self.cfg.provider, &self.data)
    }

    fn seek_ge_impl(&mut self, key: &[u8]) -> Result<IterItem> {
        self.reader.check_open()?;
        let lower = self.cfg.lower.clone();
        let key = match &lower {
            Some(l) if self.reader.comparator().compare(key, l) == Ordering::Less => l.as_slice(),
            _ => key,
        };
        let eff: Vec<u8> = match strip_for_ge(&self.cfg.transforms, key) {
            Stripped::Within(k) => k.to_vec(),
            Stripped::PastEnd => return self.exhaust(),
        };
        if filter_excludes(
            &self.reader,
            &self.cfg.rctx,
            &self.cfg.env,
            &mut self.use_filter,
            &mut self.filter_block,
            &eff,
        )? {
            return self.exhaust();
        }
        if !self.top.seek_ge(&eff) {
            return self.exhaust();
        }
        // Position the sub-index within the found partition; a vetoed or
        // empty partition falls forward to the first entry of the next.
        let mut positioned =
            self.load_second()? && self.second.as_mut().expect("loaded").seek_ge(&eff);
        while !positioned {
            if !self.top.next() {
                return self.exhaust();
            }
            positioned = self.load_second()? && self.second.as_mut().expect("loaded").first();
        }
        loop {
            if self.load_data_block()? && self.data.as_mut().expect("loaded").seek_ge(&eff) {
                break;
            }
            if !self.advance_second_forward()? {
                self.data = None;
                return Ok(None);
            }
        }
        self.finish_forward()
    }

    fn first_impl(&mut self) -> Result<IterItem> {
        self.reader.check_open()?;
        if let Some(lower) = self.cfg.lower.clone() {
            return self.seek_ge_impl(&lower);
        }
        if !self.top.first() {
            return self.exhaust();
        }
        let mut positioned = self.load_second()? && self.second.as_mut().expect("loaded").first();
        while !positioned {
            if !self.top.next() {
                return self.exhaust();
            }
            positioned = self.load_second()? && self.second.as_mut().expect("loaded").first();
        }
        loop {
            if self.load_data_block()? && self.data.as_mut().expect("loaded").first() {
                break;
            }
            if !self.advance_second_forward()? {
                self.data = None;
                return Ok(None);
            }
        }
        self.finish_forward()
    }

    fn next_impl(&mut self) -> Result<IterItem> {
        self.reader.check_open()?;
        let Some(d) = self.data.as_mut() else {
            return Ok(None);
        };
        if d.next() {
            return self.finish_forward();
        }
        loop {
            if !self.advance_second_forward()? {
                self.data = None;
                return Ok(None);
            }
            if self.load_data_block()? && self.data.as_mut().expect("loaded").first() {
                break;
            }
        }
        self.finish_forward()
    }

    fn last_impl(&mut self) -> Result<IterItem> {
        self.reader.check_open()?;
        if let Some(upper) = self.cfg.upper.clone() {
            return self.seek_lt_impl(&upper);
        }
        if !self.top.last() {
            return self.exhaust();
        }
        let mut positioned = self.load_second()? && self.second.as_mut().expect("loaded").last();
        while !positioned {
            if !self.top.prev() {
                return self.exhaust();
            }
            positioned = self.load_second()? && self.second.as_mut().expect("loaded").last();
        }
        loop {
            if self.load_data_block()? && self.data.as_mut().expect("loaded").last() {
                break;
            }
            if !self.advance_second_backward()? {
                self.data = None;
                return Ok(None);
            }
        }
        self.finish_backward()
    }

    fn prev_impl(&mut self) -> Result<IterItem> {
        self.reader.check_open()?;
        let Some(d) = self.data.as_mut() else {
            return Ok(None);
        };
        if d.prev() {
            return self.finish_backward();
        }
        loop {
            if !self.advance_second_backward()? {
                self.data = None;
                return Ok(None);
            }
            if self.load_data_block()? && self.data.as_mut().expect("loaded").last() {
                break;
            }
        }
        self.finish_backward()
    }

    fn seek_lt_impl(&mut self, key: &[u8]) -> Result<IterItem> {
        let eff: Option<Vec<u8>> = match strip_for_lt(&self.cfg.transforms, key) {
            StrippedLt::BeforeAll => return self.exhaust(),
            StrippedLt::Within(k) => Some(k.to_vec()),
            StrippedLt::AfterAll => None,
        };
        let top_positioned = match &eff {
            None => self.top.last(),
            Some(k) => self.top.seek_ge(k) || self.top.last(),
        };
        if !top_positioned {
            return self.exhaust();
        }
        let mut positioned = self.load_second()?
            && match &eff {
                Some(k) => {
                    let s = self.second.as_mut().expect("loaded");
                    s.seek_ge(k) || s.last()
                }
                None => self.second.as_mut().expect("loaded").last(),
            };
        while !positioned {
            if !self.top.prev() {
                return self.exhaust();
            }
            positioned = self.load_second()? && self.second.as_mut().expect("loaded").last();
        }
        loop {
            if self.load_data_block()? {
                let d = self.data.as_mut().expect("loaded");
                let ok = match &eff {
                    Some(k) => {
                        if d.seek_ge(k) {
                            d.prev()
                        } else {
                            d.last()
                        }
                    }
                    None => d.last(),
                };
                if ok {
                    break;
                }
            }
            if !self.advance_second_backward()? {
                self.data = None;
                return Ok(None);
            }
        }
        self.finish_backward()
    }

    fn note<T>(&self, res: &Result<T>) {
        if let Err(e) = res {
            self.reader.latch(e);
        }
    }
}

impl<I: IndexIterator, D: DataIterator> SstIterator for TwoLevelPointIter<I, D> {
    fn seek_ge(&mut self, key: &[u8]) -> Result<IterItem> {
        let res = self.seek_ge_impl(key);
        self.note(&res);
        res
    }

    fn first(&mut self) -> Result<IterItem> {
        let res = self.first_impl();
        self.note(&res);
        res
    }

    fn next(&mut self) -> Result<IterItem> {
        let res = self.next_impl();
        self.note(&res);
        res
    }

    fn last(&mut self) -> Result<IterItem> {
        let res = self.last_impl();
        self.note(&res);
        res
    }

    fn prev(&mut self) -> Result<IterItem> {
        let res = self.prev_impl();
        self.note(&res);
        res
    }

    fn bytes_iterated(&self) -> u64 {
        self.bytes_iterated
    }
}

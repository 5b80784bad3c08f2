//! The table reader facade.
//!
//! [`Reader`] composes the readable, the block reader, and the decoded
//! top-of-file metadata, and produces every iterator over the file.
//!
//! # Opening a table
//!
//! 1. Read the footer from the file tail: magic, format, checksum kind,
//!    metaindex and index handles.
//! 2. Initialize the block reader with the footer's checksum kind.
//! 3. Read the metaindex through a thread-local 3-slot buffer pool (the
//!    block, plus the compressed and decompressed properties buffers, are
//!    held simultaneously) so these single-use buffers never touch the
//!    shared cache. The block's size on disk must equal the length the
//!    footer declared.
//! 4. Decode the metaindex into name → handle entries plus the
//!    value-block index handle.
//! 5. Read and decode the properties block, dropping denied user
//!    properties.
//! 6. Record auxiliary handles. A legacy `rangedel` (v1) entry is
//!    corruption.
//! 7. Bind the comparator and merger by name, falling back to the
//!    per-option registries.
//! 8. Bind the key schema (columnar formats only); an unknown schema
//!    fails with the known names enumerated.
//!
//! Construction errors drop (and therefore close) the readable and return
//! no reader.
//!
//! # Lifecycle
//!
//! `Open → Closed | Failed`. Closing is allowed while iterators are live:
//! their next operation fails with the reader-closed sentinel. Operational
//! errors that render the reader unusable latch it into `Failed`, and the
//! recorded error replays on every subsequent call. Both terminal states
//! are permanent.

pub mod iter;

#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::sync::{Arc, RwLock, Weak};

use tracing::{debug, error};

use crate::base::{wire_config, Comparator, ComparatorRegistry, Merger, MergerRegistry, SeqNum};
use crate::block::cache::BlockCache;
use crate::block::{
    no_metadata, BlockHandle, BlockMetadata, BlockReader, BufferHandle, HandleWithProperties,
    ReadEnv, META_BUFFER_POOL, TRAILER_LEN,
};
use crate::colblk::{self, ColIndexIter, KeySchema, KeySchemaRegistry};
use crate::error::{Result, SstError};
use crate::filter::{
    BloomFilterPolicy, FilterBlockSizeLimit, FilterPolicy, TableFilterReader, FULL_FILTER_PREFIX,
};
use crate::footer::{read_footer, TableFormat};
use crate::iterator::{
    BlockPropertiesFilterer, BlockPropertyFilter, FragmentIterTransforms, IndexIterator,
    IterTransforms, ObsoleteKeyBlockPropertyFilter,
};
use crate::keyspan::{maybe_assert, ColFragmentIter, FragmentIterator, RowFragmentIter};
use crate::properties::{CommonProperties, IndexType, Properties};
use crate::readable::{ReadBeforeSize, ReadContext, ReadHandle, Readable};
use crate::rowblk::RowIndexIter;
use crate::valblk::{
    decode_index, ReaderProvider, TrivialReaderProvider, ValueBlockIndexHandle, ValueHandle,
};

use iter::{PointIterConfig, SinglePointIter, SstIterator, TwoLevelPointIter};

/// Reserved metaindex name of the properties block.
pub(crate) const META_PROPERTIES: &str = "properties";

/// Reserved metaindex name of the range-del block (current version).
pub(crate) const META_RANGE_DEL_V2: &str = "rangedel.v2";

/// Reserved metaindex name of the legacy range-del block. Forbidden.
pub(crate) const META_RANGE_DEL_V1: &str = "rangedel";

/// Reserved metaindex name of the range-key block.
pub(crate) const META_RANGE_KEY: &str = "rangekey";

/// Reserved metaindex name of the value-block index.
pub(crate) const META_VALUE_INDEX: &str = "valueindex";

// ------------------------------------------------------------------------------------------------
// Options
// ------------------------------------------------------------------------------------------------

/// Configuration for opening a table.
pub struct ReaderOptions {
    /// Comparator expected by default. Files naming a different comparator
    /// fall back to `comparators`.
    pub comparator: Arc<dyn Comparator>,

    /// Lookup table for non-default comparators.
    pub comparators: ComparatorRegistry,

    /// Merger expected by default.
    pub merger: Option<Arc<dyn Merger>>,

    /// Lookup table for non-default mergers.
    pub mergers: MergerRegistry,

    /// Key schemas known to this configuration (columnar formats).
    pub key_schemas: KeySchemaRegistry,

    /// Filter policies to match against `fullfilter.*` metaindex entries.
    pub filter_policies: Vec<Arc<dyn FilterPolicy>>,

    /// User-property keys dropped while decoding the properties block.
    pub denied_user_properties: HashSet<String>,

    /// Shared block cache, if any.
    pub cache: Option<Arc<BlockCache>>,

    /// File number, used in cache keys and error messages.
    pub file_num: u64,
}

impl Default for ReaderOptions {
    fn default() -> ReaderOptions {
        ReaderOptions {
            comparator: Arc::new(crate::base::BytewiseComparator),
            comparators: ComparatorRegistry::default(),
            merger: None,
            mergers: MergerRegistry::default(),
            key_schemas: KeySchemaRegistry::default(),
            filter_policies: vec![Arc::new(BloomFilterPolicy::default())],
            denied_user_properties: HashSet::new(),
            cache: None,
            file_num: 0,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Metaindex codec
// ------------------------------------------------------------------------------------------------

/// One metaindex record: reserved name → opaque payload. The payload is an
/// encoded [`BlockHandle`] for every entry except `valueindex`, whose
/// payload is an encoded [`ValueBlockIndexHandle`].
#[derive(Debug, bincode::Encode, bincode::Decode)]
pub(crate) struct MetaindexEntry {
    pub(crate) name: String,
    pub(crate) payload: Vec<u8>,
}

pub(crate) fn encode_metaindex(entries: &[MetaindexEntry]) -> Result<Vec<u8>> {
    Ok(bincode::encode_to_vec(entries, wire_config())?)
}

fn decode_handle_payload(name: &str, payload: &[u8]) -> Result<BlockHandle> {
    let (bh, used) = bincode::decode_from_slice::<BlockHandle, _>(payload, wire_config())?;
    if used != payload.len() {
        return Err(SstError::Corruption(format!(
            "metaindex entry {name:?} has a malformed handle"
        )));
    }
    Ok(bh)
}

fn decode_metaindex(data: &[u8]) -> Result<(Vec<(String, BlockHandle)>, ValueBlockIndexHandle)> {
    let (entries, used) =
        bincode::decode_from_slice::<Vec<MetaindexEntry>, _>(data, wire_config())?;
    if used != data.len() {
        return Err(SstError::Corruption(
            "trailing bytes after metaindex block".into(),
        ));
    }
    let mut named = Vec::with_capacity(entries.len());
    let mut value_index = ValueBlockIndexHandle::default();
    for entry in entries {
        if entry.name == META_VALUE_INDEX {
            let (vbih, used) = bincode::decode_from_slice::<ValueBlockIndexHandle, _>(
                &entry.payload,
                wire_config(),
            )?;
            if used != entry.payload.len() {
                return Err(SstError::Corruption(
                    "malformed value-block index handle".into(),
                ));
            }
            value_index = vbih;
        } else {
            let bh = decode_handle_payload(&entry.name, &entry.payload)?;
            named.push((entry.name, bh));
        }
    }
    Ok((named, value_index))
}

// ------------------------------------------------------------------------------------------------
// Reader
// ------------------------------------------------------------------------------------------------

enum ReaderState {
    Open,
    Closed,
    Failed(String),
}

/// An open table. Shared by any number of iterators across threads; the
/// iterators themselves are single-threaded.
pub struct Reader {
    /// Self-reference handed to iterators and lazy-value providers, so
    /// they keep the reader alive. Established by [`Reader::new`].
    me: Weak<Reader>,

    block_reader: BlockReader,

    comparator: Arc<dyn Comparator>,
    merger: Option<Arc<dyn Merger>>,
    key_schema: Option<Arc<KeySchema>>,
    table_filter: Option<TableFilterReader>,

    state: RwLock<ReaderState>,

    format: TableFormat,
    index_bh: BlockHandle,
    filter_bh: BlockHandle,
    range_del_bh: BlockHandle,
    range_key_bh: BlockHandle,
    properties_bh: BlockHandle,
    metaindex_bh: BlockHandle,
    footer_bh: BlockHandle,
    value_index: ValueBlockIndexHandle,

    properties: Properties,
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("file_num", &self.block_reader.file_num())
            .field("format", &self.format)
            .field("comparator", &self.comparator.name())
            .finish_non_exhaustive()
    }
}

impl Reader {
    /// Opens a table over `readable`.
    ///
    /// On error the readable is dropped — and therefore closed — and no
    /// reader is produced.
    pub fn new(
        rctx: &ReadContext,
        readable: Box<dyn Readable>,
        options: ReaderOptions,
    ) -> Result<Arc<Reader>> {
        let readable: Arc<dyn Readable> = Arc::from(readable);
        let rh = ReadHandle::new(readable.clone(), ReadBeforeSize::NewReader);

        let footer = read_footer(rctx, &rh, readable.size())?;
        let block_reader = BlockReader::new(
            readable,
            footer.checksum,
            options.file_num,
            options.cache.clone(),
        );

        let mut r = Reader {
            me: Weak::new(),
            block_reader,
            comparator: options.comparator.clone(),
            merger: None,
            key_schema: None,
            table_filter: None,
            state: RwLock::new(ReaderState::Open),
            format: footer.format,
            index_bh: footer.index,
            filter_bh: BlockHandle::default(),
            range_del_bh: BlockHandle::default(),
            range_key_bh: BlockHandle::default(),
            properties_bh: BlockHandle::default(),
            metaindex_bh: footer.metaindex,
            footer_bh: footer.footer_handle,
            value_index: ValueBlockIndexHandle::default(),
            properties: Properties::default(),
        };

        r.read_metaindex(rctx, &rh, &options)?;

        // Bind the comparator.
        let cmp_name = r.properties.comparator_name.clone();
        if cmp_name.is_empty() || cmp_name == options.comparator.name() {
            r.comparator = options.comparator.clone();
        } else if let Some(cmp) = options.comparators.get(&cmp_name) {
            r.comparator = cmp;
        } else {
            error!(file_num = options.file_num, name = %cmp_name, "unknown comparator");
            return Err(SstError::UnknownComparator {
                file_num: options.file_num,
                name: cmp_name,
            });
        }

        // Bind the merger.
        let merger_name = r.properties.merger_name.clone();
        if !merger_name.is_empty() {
            if let Some(m) = &options.merger {
                if m.name() == merger_name {
                    r.merger = Some(m.clone());
                }
            }
            if r.merger.is_none() {
                match options.mergers.get(&merger_name) {
                    Some(m) => r.merger = Some(m),
                    None => {
                        return Err(SstError::UnknownMerger {
                            file_num: options.file_num,
                            name: merger_name,
                        })
                    }
                }
            }
        }

        // Bind the key schema (columnar formats only).
        if r.format.block_columnar() {
            let schema_name = r.properties.key_schema_name.clone();
            match options.key_schemas.get(&schema_name) {
                Some(ks) => r.key_schema = Some(ks),
                None => {
                    return Err(SstError::UnknownKeySchema {
                        file_num: options.file_num,
                        name: schema_name,
                        known: options.key_schemas.names(),
                    })
                }
            }
        }

        debug!(
            file_num = options.file_num,
            format = ?r.format,
            data_blocks = r.properties.common.num_data_blocks,
            index_partitions = r.properties.common.index_partitions,
            "opened table"
        );
        Ok(Arc::new_cyclic(move |me| {
            r.me = me.clone();
            r
        }))
    }

    /// A strong reference to this reader. Valid whenever a method runs:
    /// the reader is only ever handed out inside its `Arc`.
    fn self_arc(&self) -> Arc<Reader> {
        self.me.upgrade().expect("reader accessed outside its Arc")
    }

    /// Reads and decodes the metaindex and properties blocks, recording
    /// every auxiliary handle.
    fn read_metaindex(
        &mut self,
        rctx: &ReadContext,
        rh: &ReadHandle,
        options: &ReaderOptions,
    ) -> Result<()> {
        META_BUFFER_POOL.with(|pool| -> Result<()> {
            let env = ReadEnv::pooled(pool.clone());

            let b = self
                .block_reader
                .read(rctx, &env, Some(rh), self.metaindex_bh, &no_metadata)?;
            if b.data().len() as u64 != self.metaindex_bh.length {
                return Err(SstError::Corruption(format!(
                    "unexpected metaindex block size: {} vs {}",
                    b.data().len(),
                    self.metaindex_bh.length
                )));
            }
            let (entries, value_index) = decode_metaindex(b.data())?;
            drop(b);
            self.value_index = value_index;

            for (name, bh) in entries {
                match name.as_str() {
                    META_PROPERTIES => {
                        let pb = self
                            .block_reader
                            .read(rctx, &env, Some(rh), bh, &no_metadata)?;
                        self.properties =
                            Properties::load(pb.data(), &options.denied_user_properties)?;
                        self.properties_bh = bh;
                    }
                    META_RANGE_DEL_V2 => self.range_del_bh = bh,
                    META_RANGE_DEL_V1 => {
                        return Err(SstError::Corruption(format!(
                            "unexpected range-del block type: {META_RANGE_DEL_V1}"
                        )));
                    }
                    META_RANGE_KEY => self.range_key_bh = bh,
                    other => {
                        if let Some(policy_name) = other.strip_prefix(FULL_FILTER_PREFIX) {
                            if self.table_filter.is_none() {
                                if let Some(policy) = options
                                    .filter_policies
                                    .iter()
                                    .find(|p| p.name() == policy_name)
                                {
                                    self.filter_bh = bh;
                                    self.table_filter =
                                        Some(TableFilterReader::new(policy.clone()));
                                }
                            }
                        }
                        // Unknown names are ignored for forward compatibility.
                    }
                }
            }
            Ok(())
        })
    }

    // --------------------------------------------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------------------------------------------

    /// Fails unless the reader is still open.
    pub(crate) fn check_open(&self) -> Result<()> {
        match &*self.state.read().expect("reader state poisoned") {
            ReaderState::Open => Ok(()),
            ReaderState::Closed => Err(SstError::ReaderClosed),
            ReaderState::Failed(msg) => Err(SstError::Failed(msg.clone())),
        }
    }

    /// Latches an error that renders the reader unusable. Single writer
    /// wins; transient errors are ignored.
    pub(crate) fn latch(&self, e: &SstError) {
        if !e.latchable() {
            return;
        }
        let mut state = self.state.write().expect("reader state poisoned");
        if matches!(*state, ReaderState::Open) {
            *state = ReaderState::Failed(e.to_string());
        }
    }

    /// Closes the reader. Live iterators observe the reader-closed
    /// sentinel on their next operation. Closing twice is an error.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.write().expect("reader state poisoned");
        match &*state {
            ReaderState::Open => {
                *state = ReaderState::Closed;
                Ok(())
            }
            ReaderState::Closed => Err(SstError::ReaderClosed),
            ReaderState::Failed(msg) => Err(SstError::Failed(msg.clone())),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Accessors
    // --------------------------------------------------------------------------------------------

    /// The table format recorded in the footer.
    pub fn table_format(&self) -> Result<TableFormat> {
        self.check_open()?;
        Ok(self.format)
    }

    /// The decoded properties block.
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// The statistics shared by every format.
    pub fn common_properties(&self) -> &CommonProperties {
        &self.properties.common
    }

    /// The comparator bound at open time.
    pub fn comparator(&self) -> &Arc<dyn Comparator> {
        &self.comparator
    }

    /// The merger bound at open time, if the file names one.
    pub fn merger(&self) -> Option<&Arc<dyn Merger>> {
        self.merger.as_ref()
    }

    /// The file number this reader was opened with.
    pub fn file_num(&self) -> u64 {
        self.block_reader.file_num()
    }

    pub(crate) fn format(&self) -> TableFormat {
        self.format
    }

    pub(crate) fn index_bh(&self) -> BlockHandle {
        self.index_bh
    }

    pub(crate) fn filter_bh(&self) -> BlockHandle {
        self.filter_bh
    }

    pub(crate) fn table_filter(&self) -> Option<&TableFilterReader> {
        self.table_filter.as_ref()
    }

    // --------------------------------------------------------------------------------------------
    // Block reads
    // --------------------------------------------------------------------------------------------

    fn init_index_block_metadata(&self, data: &[u8]) -> Result<BlockMetadata> {
        if self.format.block_columnar() {
            Ok(BlockMetadata::ColumnarIndex(
                colblk::init_index_block_metadata(data)?,
            ))
        } else {
            Ok(BlockMetadata::None)
        }
    }

    fn init_data_block_metadata(&self, data: &[u8]) -> Result<BlockMetadata> {
        if self.format.block_columnar() {
            let schema = self.key_schema.as_ref().ok_or_else(|| {
                SstError::Internal("columnar reader has no key schema bound".into())
            })?;
            Ok(BlockMetadata::ColumnarData(
                colblk::init_data_block_metadata(schema, data)?,
            ))
        } else {
            Ok(BlockMetadata::None)
        }
    }

    fn init_keyspan_block_metadata(&self, data: &[u8]) -> Result<BlockMetadata> {
        if self.format.block_columnar() {
            Ok(BlockMetadata::ColumnarKeyspan(
                colblk::init_keyspan_block_metadata(data)?,
            ))
        } else {
            Ok(BlockMetadata::None)
        }
    }

    /// Reads a top-level or sub-index block.
    pub(crate) fn read_index_block(
        &self,
        rctx: &ReadContext,
        env: &ReadEnv,
        bh: BlockHandle,
    ) -> Result<BufferHandle> {
        self.block_reader
            .read(rctx, env, None, bh, &|data| self.init_index_block_metadata(data))
    }

    /// Reads a data block.
    pub(crate) fn read_data_block(
        &self,
        rctx: &ReadContext,
        env: &ReadEnv,
        bh: BlockHandle,
    ) -> Result<BufferHandle> {
        self.block_reader
            .read(rctx, env, None, bh, &|data| self.init_data_block_metadata(data))
    }

    /// Reads a range-del or range-key block.
    pub(crate) fn read_keyspan_block(
        &self,
        rctx: &ReadContext,
        env: &ReadEnv,
        bh: BlockHandle,
    ) -> Result<BufferHandle> {
        self.block_reader
            .read(rctx, env, None, bh, &|data| self.init_keyspan_block_metadata(data))
    }

    /// Reads the filter block.
    pub(crate) fn read_filter_block(
        &self,
        rctx: &ReadContext,
        env: &ReadEnv,
        bh: BlockHandle,
    ) -> Result<BufferHandle> {
        self.block_reader.read(rctx, env, None, bh, &no_metadata)
    }

    /// Reads a value block or the value-block index.
    pub(crate) fn read_value_block(
        &self,
        rctx: &ReadContext,
        env: &ReadEnv,
        bh: BlockHandle,
    ) -> Result<BufferHandle> {
        self.block_reader.read(rctx, env, None, bh, &no_metadata)
    }

    /// Fetches the bytes a [`ValueHandle`] points at. Used by lazy values
    /// re-entering the reader through their provider.
    pub fn read_value(&self, rctx: &ReadContext, vh: ValueHandle) -> Result<Vec<u8>> {
        self.check_open()?;
        if self.value_index.handle.length == 0 {
            return Err(SstError::Corruption(
                "value handle in a file without value blocks".into(),
            ));
        }
        let index_h =
            self.read_value_block(rctx, &ReadEnv::none(), self.value_index.handle)?;
        let blocks = decode_index(index_h.data(), &self.value_index)?;
        let Some(&bh) = blocks.get(vh.block_num as usize) else {
            return Err(SstError::Corruption(format!(
                "value handle references block {} of {}",
                vh.block_num,
                blocks.len()
            )));
        };
        let block = self.read_value_block(rctx, &ReadEnv::none(), bh)?;
        let start = vh.offset_in_block as usize;
        let end = start + vh.value_len as usize;
        if end > block.data().len() {
            return Err(SstError::Corruption(
                "value handle overruns its value block".into(),
            ));
        }
        Ok(block.data()[start..end].to_vec())
    }

    // --------------------------------------------------------------------------------------------
    // Point iterators
    // --------------------------------------------------------------------------------------------

    /// Returns an iterator over the point keys in the table.
    ///
    /// All four `{single, two-level} × {row, columnar}` variants are
    /// selected here, once, from the recorded index type and the table
    /// format. When a filter block is attached and permitted, `seek_ge`
    /// probes it with the seek key and a negative probe short-circuits to
    /// an empty result — callers wanting pure lower-bound seeks pass
    /// [`FilterBlockSizeLimit::Never`].
    ///
    /// If `transforms.hide_obsolete_points` is set, the caller must have
    /// arranged for the obsolete-key block-property filter; see
    /// [`Reader::try_add_block_property_filter_for_hide_obsolete_points`].
    #[allow(clippy::too_many_arguments)]
    pub fn new_point_iter(
        &self,
        rctx: ReadContext,
        transforms: IterTransforms,
        lower: Option<Vec<u8>>,
        upper: Option<Vec<u8>>,
        filterer: Option<BlockPropertiesFilterer>,
        filter_block_size_limit: FilterBlockSizeLimit,
        env: ReadEnv,
        provider: Arc<dyn ReaderProvider>,
    ) -> Result<Box<dyn SstIterator>> {
        self.check_open()?;
        let cfg = PointIterConfig {
            rctx,
            transforms,
            lower,
            upper,
            filterer,
            filter_block_size_limit,
            env,
            provider,
            for_compaction: false,
        };
        self.build_point_iter(cfg)
    }

    fn build_point_iter(&self, cfg: PointIterConfig) -> Result<Box<dyn SstIterator>> {
        use crate::colblk::ColDataIter;
        use crate::rowblk::RowDataIter;

        let me = self.self_arc();
        let two_level = matches!(self.properties.index_type(), IndexType::TwoLevel);
        match (two_level, self.format.block_columnar()) {
            (false, false) => Ok(Box::new(SinglePointIter::<RowIndexIter, RowDataIter>::new(
                me, cfg,
            )?)),
            (false, true) => Ok(Box::new(SinglePointIter::<ColIndexIter, ColDataIter>::new(
                me, cfg,
            )?)),
            (true, false) => Ok(Box::new(TwoLevelPointIter::<RowIndexIter, RowDataIter>::new(
                me, cfg,
            )?)),
            (true, true) => Ok(Box::new(TwoLevelPointIter::<ColIndexIter, ColDataIter>::new(
                me, cfg,
            )?)),
        }
    }

    /// Simplified iterator constructor for tests and tooling: no
    /// cancellation, no block-property filters, the trivial reader
    /// provider. The reader must outlive any lazy values returned.
    pub fn new_iter(
        &self,
        transforms: IterTransforms,
        lower: Option<Vec<u8>>,
        upper: Option<Vec<u8>>,
    ) -> Result<Box<dyn SstIterator>> {
        self.new_point_iter(
            ReadContext::new(),
            transforms,
            lower,
            upper,
            None,
            FilterBlockSizeLimit::Always,
            ReadEnv::none(),
            Arc::new(TrivialReaderProvider::new(self.self_arc())),
        )
    }

    /// Returns an iterator configured for compaction: never consults the
    /// filter block, has no bounds, and tracks the bytes of every data
    /// block it loads for pacing.
    pub fn new_compaction_iter(
        &self,
        transforms: IterTransforms,
        env: ReadEnv,
        provider: Arc<dyn ReaderProvider>,
    ) -> Result<Box<dyn SstIterator>> {
        self.check_open()?;
        let cfg = PointIterConfig {
            rctx: ReadContext::new(),
            transforms,
            lower: None,
            upper: None,
            filterer: None,
            filter_block_size_limit: FilterBlockSizeLimit::Never,
            env,
            provider,
            for_compaction: true,
        };
        self.build_point_iter(cfg)
    }

    /// Decides obsolete-point hiding for a snapshot and appends the
    /// obsolete-key block-property filter when hiding applies.
    ///
    /// Hiding is safe when the format records obsolete markers and the
    /// snapshot is newer than everything in the file, making every
    /// non-obsolete point visible and every obsolete point dead.
    pub fn try_add_block_property_filter_for_hide_obsolete_points(
        &self,
        snapshot: SeqNum,
        mut filters: Vec<Arc<dyn BlockPropertyFilter>>,
    ) -> (bool, Vec<Arc<dyn BlockPropertyFilter>>) {
        let hide = self.format.supports_obsolete_hiding()
            && snapshot > self.properties.common.largest_seqnum;
        if hide {
            filters.push(Arc::new(ObsoleteKeyBlockPropertyFilter));
        }
        (hide, filters)
    }

    // --------------------------------------------------------------------------------------------
    // Keyspan iterators
    // --------------------------------------------------------------------------------------------

    fn new_keyspan_iter(
        &self,
        rctx: &ReadContext,
        transforms: FragmentIterTransforms,
        env: &ReadEnv,
        bh: BlockHandle,
    ) -> Result<Option<Box<dyn FragmentIterator>>> {
        if bh.length == 0 {
            return Ok(None);
        }
        let h = self.read_keyspan_block(rctx, env, bh)?;
        let iter: Box<dyn FragmentIterator> = if self.format.block_columnar() {
            Box::new(ColFragmentIter::new(&h, self.comparator.clone(), transforms)?)
        } else {
            Box::new(RowFragmentIter::new(&h, self.comparator.clone(), transforms)?)
        };
        Ok(Some(maybe_assert(iter, self.comparator.clone())))
    }

    /// Returns a fragment iterator over the table's range deletions, or
    /// `None` when the table has none.
    pub fn new_raw_range_del_iter(
        &self,
        rctx: &ReadContext,
        transforms: FragmentIterTransforms,
        env: &ReadEnv,
    ) -> Result<Option<Box<dyn FragmentIterator>>> {
        self.check_open()?;
        self.new_keyspan_iter(rctx, transforms, env, self.range_del_bh)
    }

    /// Returns a fragment iterator over the table's range keys, or `None`
    /// when the table has none.
    pub fn new_raw_range_key_iter(
        &self,
        rctx: &ReadContext,
        transforms: FragmentIterTransforms,
        env: &ReadEnv,
    ) -> Result<Option<Box<dyn FragmentIterator>>> {
        self.check_open()?;
        self.new_keyspan_iter(rctx, transforms, env, self.range_key_bh)
    }

    // --------------------------------------------------------------------------------------------
    // Layout
    // --------------------------------------------------------------------------------------------

    /// Returns the placement of every block in the file.
    pub fn layout(&self, rctx: &ReadContext) -> Result<Layout> {
        self.check_open()?;
        let res = if self.format.block_columnar() {
            self.layout_inner::<ColIndexIter>(rctx)
        } else {
            self.layout_inner::<RowIndexIter>(rctx)
        };
        if let Err(e) = &res {
            self.latch(e);
        }
        res
    }

    fn layout_inner<I: IndexIterator>(&self, rctx: &ReadContext) -> Result<Layout> {
        let mut layout = Layout {
            data: Vec::with_capacity(self.properties.common.num_data_blocks as usize),
            index: Vec::new(),
            top_index: None,
            range_del: self.range_del_bh,
            range_key: self.range_key_bh,
            filter: Vec::new(),
            properties: self.properties_bh,
            metaindex: self.metaindex_bh,
            footer: self.footer_bh,
            value_blocks: Vec::new(),
            value_index: self.value_index.handle,
            format: self.format,
        };
        if self.filter_bh.length > 0 {
            let policy_name = self
                .table_filter
                .as_ref()
                .map(|f| f.policy().name())
                .unwrap_or("unknown");
            layout.filter.push(NamedBlockHandle {
                name: format!("{FULL_FILTER_PREFIX}{policy_name}"),
                handle: self.filter_bh,
            });
        }

        let env = ReadEnv::none();
        let index_h = self.read_index_block(rctx, &env, self.index_bh)?;

        if self.properties.common.index_partitions == 0 {
            layout.index.push(self.index_bh);
            let mut it = I::new(index_h, self.comparator.clone())?;
            let mut valid = it.first();
            while valid {
                layout.data.push(it.block_handle_with_properties()?);
                valid = it.next();
            }
        } else {
            layout.top_index = Some(self.index_bh);
            let mut top = I::new(index_h, self.comparator.clone())?;
            let mut top_valid = top.first();
            while top_valid {
                let sub_bh = top.block_handle_with_properties()?;
                layout.index.push(sub_bh.handle);

                let sub_h = self.read_index_block(rctx, &env, sub_bh.handle)?;
                let mut it = I::new(sub_h, self.comparator.clone())?;
                let mut valid = it.first();
                while valid {
                    layout.data.push(it.block_handle_with_properties()?);
                    valid = it.next();
                }
                top_valid = top.next();
            }
        }

        if self.value_index.handle.length != 0 {
            let vbi_h = self.read_value_block(rctx, &env, self.value_index.handle)?;
            layout.value_blocks = decode_index(vbi_h.data(), &self.value_index)?;
        }

        Ok(layout)
    }

    // --------------------------------------------------------------------------------------------
    // Checksum validation
    // --------------------------------------------------------------------------------------------

    /// Reads every checksummed block in the file in offset order,
    /// verifying each trailer. The footer is excluded: it carries its own
    /// integrity check, applied when the reader opened.
    pub fn validate_block_checksums(&self, rctx: &ReadContext) -> Result<()> {
        let layout = self.layout(rctx)?;

        #[derive(Copy, Clone)]
        enum Kind {
            Data,
            Index,
            Filter,
            Keyspan,
            Raw,
        }

        let mut blocks: Vec<(BlockHandle, Kind)> =
            Vec::with_capacity(layout.data.len() + layout.index.len() + 6);
        for hp in &layout.data {
            blocks.push((hp.handle, Kind::Data));
        }
        for &bh in &layout.index {
            blocks.push((bh, Kind::Index));
        }
        if let Some(bh) = layout.top_index {
            blocks.push((bh, Kind::Index));
        }
        for nb in &layout.filter {
            blocks.push((nb.handle, Kind::Filter));
        }
        blocks.push((layout.range_del, Kind::Keyspan));
        blocks.push((layout.range_key, Kind::Keyspan));
        blocks.push((layout.properties, Kind::Raw));
        blocks.push((layout.metaindex, Kind::Raw));

        // Offset order turns the validation into one sequential file scan.
        blocks.sort_by_key(|(bh, _)| bh.offset);

        let env = ReadEnv::none();
        for (bh, kind) in blocks {
            if bh.length == 0 {
                continue;
            }
            let res = match kind {
                Kind::Data => self.read_data_block(rctx, &env, bh),
                Kind::Index => self.read_index_block(rctx, &env, bh),
                Kind::Filter => self.read_filter_block(rctx, &env, bh),
                Kind::Keyspan => self.read_keyspan_block(rctx, &env, bh),
                Kind::Raw => self.block_reader.read(rctx, &env, None, bh, &no_metadata),
            };
            if let Err(e) = res {
                self.latch(&e);
                return Err(e);
            }
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Disk-usage estimation
    // --------------------------------------------------------------------------------------------

    /// Estimates the bytes of data blocks overlapping `[start, end]`, plus
    /// a linearly interpolated share of the value-blocks size. Partially
    /// overlapping blocks count in full. Assumes at least partial overlap
    /// with the file's range.
    pub fn estimate_disk_usage(
        &self,
        rctx: &ReadContext,
        start: &[u8],
        end: &[u8],
    ) -> Result<u64> {
        self.check_open()?;
        let res = if self.format.block_columnar() {
            self.estimate_inner::<ColIndexIter>(rctx, start, end)
        } else {
            self.estimate_inner::<RowIndexIter>(rctx, start, end)
        };
        if let Err(e) = &res {
            self.latch(e);
        }
        res
    }

    fn interpolate_value_blocks(&self, data_span: u64) -> u64 {
        let total = self.properties.common.data_size;
        if total == 0 {
            return data_span;
        }
        data_span
            + ((data_span as f64 / total as f64)
                * self.properties.common.value_blocks_size as f64) as u64
    }

    fn estimate_inner<I: IndexIterator>(
        &self,
        rctx: &ReadContext,
        start: &[u8],
        end: &[u8],
    ) -> Result<u64> {
        let env = ReadEnv::none();
        let index_h = self.read_index_block(rctx, &env, self.index_bh)?;

        if self.properties.common.index_partitions == 0 {
            let mut it = I::new(index_h, self.comparator.clone())?;
            if !it.seek_ge(start) {
                // The range falls completely after this file.
                return Ok(0);
            }
            let start_bh = it.block_handle_with_properties()?;
            if !it.seek_ge(end) {
                // The range spans beyond this file.
                return Ok(self.interpolate_value_blocks(
                    self.properties.common.data_size - start_bh.handle.offset,
                ));
            }
            let end_bh = it.block_handle_with_properties()?;
            return Ok(self.interpolate_value_blocks(
                end_bh.handle.offset + end_bh.handle.length + TRAILER_LEN
                    - start_bh.handle.offset,
            ));
        }

        // Partitioned index: locate the sub-indexes containing start and
        // end. They may differ, or the end may lie past the file.
        let mut top = I::new(index_h, self.comparator.clone())?;
        if !top.seek_ge(start) {
            return Ok(0);
        }
        let start_idx_bh = top.block_handle_with_properties()?;
        let start_idx_h = self.read_index_block(rctx, &env, start_idx_bh.handle)?;
        let mut start_it = I::new(start_idx_h, self.comparator.clone())?;

        let mut end_it = if top.seek_ge(end) {
            let end_idx_bh = top.block_handle_with_properties()?;
            let end_idx_h = self.read_index_block(rctx, &env, end_idx_bh.handle)?;
            Some(I::new(end_idx_h, self.comparator.clone())?)
        } else {
            None
        };

        if !start_it.seek_ge(start) {
            return Ok(0);
        }
        let start_bh = start_it.block_handle_with_properties()?;

        let through_last = self.interpolate_value_blocks(
            self.properties.common.data_size - start_bh.handle.offset,
        );
        let Some(end_it) = end_it.as_mut() else {
            return Ok(through_last);
        };
        if !end_it.seek_ge(end) {
            return Ok(through_last);
        }
        let end_bh = end_it.block_handle_with_properties()?;
        Ok(self.interpolate_value_blocks(
            end_bh.handle.offset + end_bh.handle.length + TRAILER_LEN - start_bh.handle.offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Layout
// ------------------------------------------------------------------------------------------------

/// A block handle labeled with its metaindex name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedBlockHandle {
    /// Metaindex name, e.g. `fullfilter.petra.bloom`.
    pub name: String,

    /// The referenced block.
    pub handle: BlockHandle,
}

/// Snapshot of every block's placement within a table.
#[derive(Debug, Clone, Default)]
pub struct Layout {
    /// Data blocks in key order, with their property bytes.
    pub data: Vec<HandleWithProperties>,

    /// Index blocks: the single index block, or every sub-index in order.
    pub index: Vec<BlockHandle>,

    /// The top-level index block of a partitioned index.
    pub top_index: Option<BlockHandle>,

    /// Range-del block; zero when absent.
    pub range_del: BlockHandle,

    /// Range-key block; zero when absent.
    pub range_key: BlockHandle,

    /// Full filter blocks.
    pub filter: Vec<NamedBlockHandle>,

    /// Properties block.
    pub properties: BlockHandle,

    /// Metaindex block.
    pub metaindex: BlockHandle,

    /// The footer.
    pub footer: BlockHandle,

    /// Value blocks in block-number order.
    pub value_blocks: Vec<BlockHandle>,

    /// Value-block index; zero when absent.
    pub value_index: BlockHandle,

    /// Table format.
    pub format: TableFormat,
}

//! The table builder.
//!
//! [`SstWriter`] produces files the reader opens: data blocks (row or
//! columnar per the chosen format), optional value blocks, a full filter
//! block, range-del and range-key keyspan blocks, the properties block,
//! the metaindex, the index (flat or partitioned), and the footer.
//!
//! File layout, front to back:
//!
//! ```text
//! [DATA BLOCK + trailer] × N          (starting at offset 0)
//! [VALUE BLOCK + trailer] × M         (format V2, when values separate)
//! [VALUE INDEX + trailer]
//! [FILTER BLOCK + trailer]
//! [RANGE-DEL BLOCK + trailer]
//! [RANGE-KEY BLOCK + trailer]
//! [PROPERTIES + trailer]
//! [METAINDEX + trailer]
//! [SUB-INDEX + trailer] × P           (partitioned index only)
//! [INDEX + trailer]
//! [FOOTER]
//! ```
//!
//! Entries must be added in sorted order: user key ascending by the
//! comparator, trailer descending within one user key. An entry whose
//! user key equals its predecessor's is recorded as obsolete (shadowed).
//!
//! The file is written to `<path>.tmp` and renamed into place after a
//! final sync, so a crash cannot leave a partial table at `path`.

use std::fs::{rename, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::base::{trailer_seqnum, wire_config, Comparator, InternalKey, KeyKind};
use crate::block::{BlockHandle, ChecksumKind, CompressionKind, HandleWithProperties};
use crate::colblk::{ColDataBlockBuilder, KeySchema, TwoColumnBlockBuilder};
use crate::error::{Result, SstError};
use crate::filter::{FilterPolicy, FULL_FILTER_PREFIX};
use crate::footer::{Footer, TableFormat};
use crate::iterator::PROP_ALL_POINTS_OBSOLETE;
use crate::keyspan::{Span, SpanPayload};
use crate::properties::{CommonProperties, Properties};
use crate::reader::{
    encode_metaindex, MetaindexEntry, META_PROPERTIES, META_RANGE_DEL_V2, META_RANGE_KEY,
    META_VALUE_INDEX,
};
use crate::rowblk::{RowBlockBuilder, ROW_FLAG_OBSOLETE};
use crate::valblk::{
    encode_handle_value, encode_index, encode_inline_value, ValueBlockIndexHandle, ValueHandle,
};

/// Configuration for building a table.
pub struct WriterOptions {
    /// On-disk format to write.
    pub format: TableFormat,

    /// Checksum kind recorded in the footer and used by every trailer.
    pub checksum: ChecksumKind,

    /// Compression applied to data blocks.
    pub compression: CompressionKind,

    /// Target data-block size in bytes; a block is flushed once it grows
    /// past this.
    pub block_size: usize,

    /// When set, emit a partitioned index with this many data blocks per
    /// sub-index. `None` emits a flat index.
    pub index_partition_len: Option<usize>,

    /// Filter policy for the full filter block, if any.
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,

    /// Comparator the entries are sorted by; its name is recorded.
    pub comparator: Arc<dyn Comparator>,

    /// Merger name recorded in the properties; empty when the file holds
    /// no merge operands.
    pub merger_name: String,

    /// Key schema (columnar formats); its name is recorded.
    pub key_schema: Arc<KeySchema>,

    /// Values at least this long are stored in value blocks (format V2).
    pub value_block_min_len: Option<usize>,

    /// Free-form user properties.
    pub user_properties: Vec<(String, String)>,
}

impl Default for WriterOptions {
    fn default() -> WriterOptions {
        WriterOptions {
            format: TableFormat::V2,
            checksum: ChecksumKind::XxHash64,
            compression: CompressionKind::None,
            block_size: 4096,
            index_partition_len: None,
            filter_policy: None,
            comparator: Arc::new(crate::base::BytewiseComparator),
            merger_name: String::new(),
            key_schema: Arc::new(KeySchema::default_schema()),
            value_block_min_len: None,
            user_properties: Vec::new(),
        }
    }
}

impl WriterOptions {
    /// Options producing the row-oriented V1 format with CRC32 trailers.
    pub fn v1() -> WriterOptions {
        WriterOptions {
            format: TableFormat::V1,
            checksum: ChecksumKind::Crc32,
            ..WriterOptions::default()
        }
    }
}

enum DataBlockBuilder {
    Row(RowBlockBuilder),
    Col(ColDataBlockBuilder),
}

impl DataBlockBuilder {
    fn is_empty(&self) -> bool {
        match self {
            DataBlockBuilder::Row(b) => b.is_empty(),
            DataBlockBuilder::Col(b) => b.is_empty(),
        }
    }

    fn size_estimate(&self) -> usize {
        match self {
            DataBlockBuilder::Row(b) => b.size_estimate(),
            DataBlockBuilder::Col(b) => b.size_estimate(),
        }
    }
}

/// Streaming table builder. See the module docs for the file layout.
pub struct SstWriter {
    path: PathBuf,
    tmp_path: PathBuf,
    out: BufWriter<File>,
    offset: u64,
    opts: WriterOptions,

    block: DataBlockBuilder,
    block_all_obsolete: bool,
    block_last_key: Vec<u8>,

    last_user_key: Option<Vec<u8>>,
    last_trailer: u64,

    index_entries: Vec<(Vec<u8>, HandleWithProperties)>,
    filter_keys: Vec<Vec<u8>>,

    range_dels: Vec<Span>,
    range_keys: Vec<Span>,

    value_block_buf: Vec<u8>,
    completed_value_blocks: Vec<Vec<u8>>,

    num_entries: u64,
    num_deletions: u64,
    raw_key_size: u64,
    raw_value_size: u64,
    largest_seqnum: u64,

    finished: bool,
}

impl SstWriter {
    /// Creates a builder writing to `path` (via `<path>.tmp`).
    pub fn new(path: impl AsRef<Path>, opts: WriterOptions) -> Result<SstWriter> {
        let path = path.as_ref().to_path_buf();
        let tmp_path = path.with_extension("tmp");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let block = match opts.format {
            TableFormat::V1 => DataBlockBuilder::Row(RowBlockBuilder::new()),
            TableFormat::V2 => DataBlockBuilder::Col(ColDataBlockBuilder::new()),
        };
        Ok(SstWriter {
            path,
            tmp_path,
            out: BufWriter::new(file),
            offset: 0,
            opts,
            block,
            block_all_obsolete: true,
            block_last_key: Vec::new(),
            last_user_key: None,
            last_trailer: 0,
            index_entries: Vec::new(),
            filter_keys: Vec::new(),
            range_dels: Vec::new(),
            range_keys: Vec::new(),
            value_block_buf: Vec::new(),
            completed_value_blocks: Vec::new(),
            num_entries: 0,
            num_deletions: 0,
            raw_key_size: 0,
            raw_value_size: 0,
            largest_seqnum: 0,
            finished: false,
        })
    }

    /// Writes `bytes` as one block: payload, compression byte, checksum.
    /// Returns the handle of the block body.
    fn write_block(&mut self, bytes: &[u8], compression: CompressionKind) -> Result<BlockHandle> {
        let (payload, comp_byte) = match compression.compress(bytes)? {
            Some(compressed) => (compressed, compression as u8),
            None => (bytes.to_vec(), CompressionKind::None as u8),
        };
        let offset = self.offset;
        self.out.write_all(&payload)?;
        self.out.write_all(&[comp_byte])?;
        let mut sum_input = payload;
        sum_input.push(comp_byte);
        let checksum = self.opts.checksum.checksum(&sum_input);
        self.out.write_all(&checksum.to_le_bytes())?;
        self.offset = offset + sum_input.len() as u64 + 4;
        Ok(BlockHandle::new(offset, sum_input.len() as u64 - 1))
    }

    /// Adds a point entry. Keys must arrive sorted: user key ascending,
    /// trailer descending within one user key.
    pub fn add(&mut self, key: &InternalKey, value: &[u8]) -> Result<()> {
        if self.finished {
            return Err(SstError::Internal("writer already finished".into()));
        }
        let obsolete = match &self.last_user_key {
            Some(last) => {
                match self.opts.comparator.compare(&key.user_key, last) {
                    std::cmp::Ordering::Less => {
                        return Err(SstError::Internal(
                            "point entries must be added in sorted order".into(),
                        ));
                    }
                    std::cmp::Ordering::Equal => {
                        if key.trailer >= self.last_trailer {
                            return Err(SstError::Internal(
                                "versions of one key must be added newest first".into(),
                            ));
                        }
                        true
                    }
                    std::cmp::Ordering::Greater => false,
                }
            }
            None => false,
        };

        self.num_entries += 1;
        if matches!(key.kind()?, KeyKind::Delete) {
            self.num_deletions += 1;
        }
        self.raw_key_size += key.user_key.len() as u64;
        self.raw_value_size += value.len() as u64;
        self.largest_seqnum = self.largest_seqnum.max(key.seqnum());

        if !obsolete {
            self.filter_keys.push(key.user_key.clone());
        }

        let encoded_value = self.encode_value(value)?;
        match &mut self.block {
            DataBlockBuilder::Row(b) => {
                let flags = if obsolete { ROW_FLAG_OBSOLETE } else { 0 };
                b.add(&key.user_key, key.trailer, flags, &encoded_value)?;
            }
            DataBlockBuilder::Col(b) => {
                b.add(&key.user_key, key.trailer, obsolete, &encoded_value);
            }
        }
        self.block_all_obsolete &= obsolete;
        self.block_last_key = key.user_key.clone();
        self.last_user_key = Some(key.user_key.clone());
        self.last_trailer = key.trailer;

        if self.block.size_estimate() >= self.opts.block_size {
            self.flush_data_block()?;
        }
        Ok(())
    }

    /// Encodes a value per the format: raw for V1, prefixed (inline or
    /// value handle) for V2.
    fn encode_value(&mut self, value: &[u8]) -> Result<Vec<u8>> {
        if !self.opts.format.supports_value_blocks() {
            return Ok(value.to_vec());
        }
        let separate = self
            .opts
            .value_block_min_len
            .is_some_and(|min| value.len() >= min);
        if !separate {
            return Ok(encode_inline_value(value));
        }
        let vh = ValueHandle {
            value_len: value.len() as u32,
            block_num: self.completed_value_blocks.len() as u32,
            offset_in_block: self.value_block_buf.len() as u32,
        };
        self.value_block_buf.extend_from_slice(value);
        if self.value_block_buf.len() >= self.opts.block_size {
            self.completed_value_blocks
                .push(std::mem::take(&mut self.value_block_buf));
        }
        encode_handle_value(&vh)
    }

    fn flush_data_block(&mut self) -> Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        let bytes = match &mut self.block {
            DataBlockBuilder::Row(b) => b.finish(),
            DataBlockBuilder::Col(b) => b.finish(),
        };
        let handle = self.write_block(&bytes, self.opts.compression)?;
        let props = if self.block_all_obsolete && self.opts.format.supports_obsolete_hiding() {
            vec![PROP_ALL_POINTS_OBSOLETE]
        } else {
            Vec::new()
        };
        self.index_entries
            .push((self.block_last_key.clone(), HandleWithProperties { handle, props }));
        self.block_all_obsolete = true;
        Ok(())
    }

    fn check_spans_sorted(existing: &[Span], span: &Span) -> Result<()> {
        if span.start >= span.end {
            return Err(SstError::Internal("span start must precede end".into()));
        }
        if let Some(last) = existing.last() {
            if span.start < last.end {
                return Err(SstError::Internal(
                    "spans must be sorted and non-overlapping".into(),
                ));
            }
        }
        Ok(())
    }

    /// Adds a range-deletion fragment. Spans must arrive sorted and
    /// non-overlapping.
    pub fn add_range_del(&mut self, span: Span) -> Result<()> {
        Self::check_spans_sorted(&self.range_dels, &span)?;
        for key in &span.keys {
            self.largest_seqnum = self.largest_seqnum.max(trailer_seqnum(key.trailer));
        }
        self.range_dels.push(span);
        Ok(())
    }

    /// Adds a range-key fragment. Spans must arrive sorted and
    /// non-overlapping.
    pub fn add_range_key(&mut self, span: Span) -> Result<()> {
        Self::check_spans_sorted(&self.range_keys, &span)?;
        for key in &span.keys {
            self.largest_seqnum = self.largest_seqnum.max(trailer_seqnum(key.trailer));
        }
        self.range_keys.push(span);
        Ok(())
    }

    fn encode_keyspan_block(&self, spans: &[Span]) -> Result<Vec<u8>> {
        if self.opts.format.block_columnar() {
            let mut b = TwoColumnBlockBuilder::new();
            for s in spans {
                let payload = SpanPayload {
                    end: s.end.clone(),
                    keys: s.keys.clone(),
                };
                b.add(&s.start, &bincode::encode_to_vec(&payload, wire_config())?);
            }
            Ok(b.finish())
        } else {
            Ok(bincode::encode_to_vec(spans, wire_config())?)
        }
    }

    fn encode_index_block(&self, entries: &[(Vec<u8>, HandleWithProperties)]) -> Result<Vec<u8>> {
        if self.opts.format.block_columnar() {
            let mut b = TwoColumnBlockBuilder::new();
            for (sep, hp) in entries {
                b.add(sep, &hp.encode()?);
            }
            Ok(b.finish())
        } else {
            let mut b = RowBlockBuilder::new();
            for (sep, hp) in entries {
                b.add(sep, 0, 0, &hp.encode()?)?;
            }
            Ok(b.finish())
        }
    }

    /// Finishes the table: flushes everything, writes the metadata
    /// blocks, index, and footer, then renames the file into place.
    pub fn finish(mut self) -> Result<()> {
        self.finished = true;
        self.flush_data_block()?;

        let data_size = self.offset;
        let num_data_blocks = self.index_entries.len() as u64;

        // Value blocks and their index.
        if !self.value_block_buf.is_empty() {
            self.completed_value_blocks
                .push(std::mem::take(&mut self.value_block_buf));
        }
        let mut value_index = ValueBlockIndexHandle {
            handle: BlockHandle::default(),
            block_num_width: 4,
            block_offset_width: 4,
        };
        let mut value_block_handles = Vec::new();
        for bytes in std::mem::take(&mut self.completed_value_blocks) {
            value_block_handles.push(self.write_block(&bytes, CompressionKind::None)?);
        }
        let value_blocks_size = self.offset - data_size;
        if !value_block_handles.is_empty() {
            let index_bytes = encode_index(&value_block_handles, &value_index);
            value_index.handle = self.write_block(&index_bytes, CompressionKind::None)?;
        }

        // Filter block.
        let mut filter = None;
        if let Some(policy) = self.opts.filter_policy.clone() {
            let bytes = policy.build(&self.filter_keys)?;
            let handle = self.write_block(&bytes, CompressionKind::None)?;
            filter = Some((format!("{FULL_FILTER_PREFIX}{}", policy.name()), handle));
        }

        // Keyspan blocks.
        let num_range_deletions = self.range_dels.len() as u64;
        let num_range_keys = self.range_keys.len() as u64;
        let mut range_del_bh = None;
        if !self.range_dels.is_empty() {
            let spans = std::mem::take(&mut self.range_dels);
            let bytes = self.encode_keyspan_block(&spans)?;
            range_del_bh = Some(self.write_block(&bytes, CompressionKind::None)?);
        }
        let mut range_key_bh = None;
        if !self.range_keys.is_empty() {
            let spans = std::mem::take(&mut self.range_keys);
            let bytes = self.encode_keyspan_block(&spans)?;
            range_key_bh = Some(self.write_block(&bytes, CompressionKind::None)?);
        }

        // Properties block. The partition count must match the index
        // blocks written below.
        let partition_len = self.opts.index_partition_len.filter(|&n| n > 0);
        let index_partitions = match partition_len {
            Some(n) if num_data_blocks > 0 => num_data_blocks.div_ceil(n as u64),
            _ => 0,
        };
        let properties = Properties {
            comparator_name: self.opts.comparator.name().to_string(),
            merger_name: self.opts.merger_name.clone(),
            key_schema_name: if self.opts.format.block_columnar() {
                self.opts.key_schema.name().to_string()
            } else {
                String::new()
            },
            common: CommonProperties {
                num_entries: self.num_entries,
                num_deletions: self.num_deletions,
                num_range_deletions,
                num_range_keys,
                raw_key_size: self.raw_key_size,
                raw_value_size: self.raw_value_size,
                data_size,
                value_blocks_size,
                num_data_blocks,
                index_partitions,
                largest_seqnum: self.largest_seqnum,
            },
            user_properties: self.opts.user_properties.clone(),
        };
        let properties_bh = self.write_block(&properties.encode()?, CompressionKind::None)?;

        // Metaindex block. Uncompressed: the reader checks its on-disk
        // size against the footer's declared length.
        let mut meta_entries = vec![MetaindexEntry {
            name: META_PROPERTIES.to_string(),
            payload: bincode::encode_to_vec(properties_bh, wire_config())?,
        }];
        if let Some(bh) = range_del_bh {
            meta_entries.push(MetaindexEntry {
                name: META_RANGE_DEL_V2.to_string(),
                payload: bincode::encode_to_vec(bh, wire_config())?,
            });
        }
        if let Some(bh) = range_key_bh {
            meta_entries.push(MetaindexEntry {
                name: META_RANGE_KEY.to_string(),
                payload: bincode::encode_to_vec(bh, wire_config())?,
            });
        }
        if let Some((name, bh)) = &filter {
            meta_entries.push(MetaindexEntry {
                name: name.clone(),
                payload: bincode::encode_to_vec(*bh, wire_config())?,
            });
        }
        if value_index.handle.length > 0 {
            meta_entries.push(MetaindexEntry {
                name: META_VALUE_INDEX.to_string(),
                payload: bincode::encode_to_vec(value_index, wire_config())?,
            });
        }
        let metaindex_bh =
            self.write_block(&encode_metaindex(&meta_entries)?, CompressionKind::None)?;

        // Index block(s).
        let index_entries = std::mem::take(&mut self.index_entries);
        let index_bh = match partition_len {
            Some(n) if !index_entries.is_empty() => {
                let mut top_entries = Vec::new();
                for chunk in index_entries.chunks(n) {
                    let bytes = self.encode_index_block(chunk)?;
                    let handle = self.write_block(&bytes, CompressionKind::None)?;
                    let separator = chunk.last().expect("chunks are non-empty").0.clone();
                    let all_obsolete = chunk
                        .iter()
                        .all(|(_, hp)| hp.props == [PROP_ALL_POINTS_OBSOLETE]);
                    let props = if all_obsolete {
                        vec![PROP_ALL_POINTS_OBSOLETE]
                    } else {
                        Vec::new()
                    };
                    top_entries.push((separator, HandleWithProperties { handle, props }));
                }
                let bytes = self.encode_index_block(&top_entries)?;
                self.write_block(&bytes, CompressionKind::None)?
            }
            _ => {
                let bytes = self.encode_index_block(&index_entries)?;
                self.write_block(&bytes, CompressionKind::None)?
            }
        };

        // Footer.
        let footer = Footer::encode(
            self.opts.format,
            self.opts.checksum,
            metaindex_bh,
            index_bh,
        )?;
        self.out.write_all(&footer)?;
        self.offset += footer.len() as u64;

        self.out.flush()?;
        let file = self
            .out
            .into_inner()
            .map_err(|e| SstError::Internal(format!("flush failed: {e}")))?;
        file.sync_all()?;
        drop(file);
        rename(&self.tmp_path, &self.path)?;

        debug!(
            path = %self.path.display(),
            format = ?self.opts.format,
            data_blocks = num_data_blocks,
            index_partitions,
            file_size = self.offset,
            "finished table"
        );
        Ok(())
    }
}

//! Column-oriented block encoding, key schemas, and iterators.
//!
//! Columnar blocks store each logical field in its own region so per-row
//! access is plain offset arithmetic and in-block seeks can binary search
//! the key column:
//!
//! ```text
//! [ROWS u32][COLUMNS u32]
//! [KEY_OFFSETS    (rows+1) × u32]
//! [TRAILERS        rows    × u64]      (data blocks only)
//! [OBSOLETE        rows    × u8 ]      (data blocks only)
//! [VALUE_OFFSETS  (rows+1) × u32]
//! [KEY_BYTES]
//! [VALUE_BYTES]
//! ```
//!
//! Index and keyspan blocks use the two-column subset (keys + values). The
//! region start offsets are computed **once** per loaded buffer by the
//! metadata initializers below and shared by every iterator over the same
//! buffer; iterating never re-derives them.
//!
//! A [`KeySchema`] names the column layout a data block must declare. The
//! reader refuses columnar files whose schema name it cannot resolve.

use std::collections::HashMap;
use std::sync::Arc;

use crate::base::{trailer_with_seqnum, Comparator, KeyRef};
use crate::block::{BufferHandle, BlockMetadata, HandleWithProperties};
use crate::error::{Result, SstError};
use crate::iterator::{DataIterator, IndexIterator, IterTransforms};

/// Header length: row count + column count.
const COL_HEADER_SIZE: usize = 8;

/// Column count declared by data blocks: keys, trailers, obsolete flags,
/// values.
pub(crate) const DATA_BLOCK_COLUMNS: u32 = 4;

/// Column count declared by index and keyspan blocks: keys, values.
pub(crate) const TWO_COLUMNS: u32 = 2;

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(data[at..at + 4].try_into().expect("bounds checked at init"))
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(data[at..at + 8].try_into().expect("bounds checked at init"))
}

fn header(data: &[u8]) -> Result<(usize, u32)> {
    if data.len() < COL_HEADER_SIZE {
        return Err(SstError::Corruption(
            "columnar block shorter than header".into(),
        ));
    }
    let rows = u32::from_le_bytes(data[0..4].try_into().expect("checked")) as usize;
    let columns = u32::from_le_bytes(data[4..8].try_into().expect("checked"));
    Ok((rows, columns))
}

/// Validates that an offsets array is in-bounds and non-decreasing, and
/// returns its final value (the byte length of the region it indexes).
fn check_offsets(data: &[u8], at: usize, rows: usize) -> Result<usize> {
    let end = at + (rows + 1) * 4;
    if end > data.len() {
        return Err(SstError::Corruption(
            "columnar offsets region out of bounds".into(),
        ));
    }
    let mut prev = 0u32;
    for i in 0..=rows {
        let v = read_u32(data, at + i * 4);
        if v < prev {
            return Err(SstError::Corruption(
                "columnar offsets not monotonic".into(),
            ));
        }
        prev = v;
    }
    Ok(prev as usize)
}

// ------------------------------------------------------------------------------------------------
// Key schemas
// ------------------------------------------------------------------------------------------------

/// Name of the provided key schema.
pub const DEFAULT_KEY_SCHEMA_NAME: &str = "petra.default";

/// Names the column layout of columnar data blocks. A table records the
/// schema name it was written with; opening a columnar file whose schema is
/// not registered fails with an error enumerating the known names.
#[derive(Debug, Clone)]
pub struct KeySchema {
    name: String,
    columns: u32,
}

impl KeySchema {
    /// A schema declaring `columns` data-block columns.
    pub fn new(name: impl Into<String>, columns: u32) -> KeySchema {
        KeySchema {
            name: name.into(),
            columns,
        }
    }

    /// The default schema: raw keys in a single key column alongside the
    /// trailer, obsolete, and value columns.
    pub fn default_schema() -> KeySchema {
        KeySchema::new(DEFAULT_KEY_SCHEMA_NAME, DATA_BLOCK_COLUMNS)
    }

    /// Schema name recorded in table properties.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Column count a data block written under this schema declares.
    pub fn columns(&self) -> u32 {
        self.columns
    }
}

/// Name → key schema lookup table.
#[derive(Clone)]
pub struct KeySchemaRegistry {
    by_name: HashMap<String, Arc<KeySchema>>,
}

impl KeySchemaRegistry {
    /// An empty registry.
    pub fn new() -> KeySchemaRegistry {
        KeySchemaRegistry {
            by_name: HashMap::new(),
        }
    }

    /// Registers a schema under its own name.
    pub fn register(&mut self, schema: Arc<KeySchema>) {
        self.by_name.insert(schema.name().to_string(), schema);
    }

    /// Looks up a schema by name.
    pub fn get(&self, name: &str) -> Option<Arc<KeySchema>> {
        self.by_name.get(name).cloned()
    }

    /// Sorted names of every registered schema, for error messages.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_name.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for KeySchemaRegistry {
    fn default() -> KeySchemaRegistry {
        let mut r = KeySchemaRegistry::new();
        r.register(Arc::new(KeySchema::default_schema()));
        r
    }
}

// ------------------------------------------------------------------------------------------------
// Block metadata
// ------------------------------------------------------------------------------------------------

/// Precomputed region offsets of a columnar data block.
#[derive(Debug, Copy, Clone)]
pub struct ColumnarDataMeta {
    /// Number of rows.
    pub rows: usize,
    key_offsets_at: usize,
    trailers_at: usize,
    obsolete_at: usize,
    value_offsets_at: usize,
    key_bytes_at: usize,
    value_bytes_at: usize,
}

impl ColumnarDataMeta {
    fn key_range(&self, data: &[u8], row: usize) -> std::ops::Range<usize> {
        let start = read_u32(data, self.key_offsets_at + row * 4) as usize;
        let end = read_u32(data, self.key_offsets_at + (row + 1) * 4) as usize;
        self.key_bytes_at + start..self.key_bytes_at + end
    }

    fn trailer(&self, data: &[u8], row: usize) -> u64 {
        read_u64(data, self.trailers_at + row * 8)
    }

    fn obsolete(&self, data: &[u8], row: usize) -> bool {
        data[self.obsolete_at + row] != 0
    }

    fn value_range(&self, data: &[u8], row: usize) -> std::ops::Range<usize> {
        let start = read_u32(data, self.value_offsets_at + row * 4) as usize;
        let end = read_u32(data, self.value_offsets_at + (row + 1) * 4) as usize;
        self.value_bytes_at + start..self.value_bytes_at + end
    }
}

/// Precomputed region offsets of a two-column (keys + values) block.
#[derive(Debug, Copy, Clone)]
pub struct TwoColumnMeta {
    /// Number of rows.
    pub rows: usize,
    key_offsets_at: usize,
    value_offsets_at: usize,
    key_bytes_at: usize,
    value_bytes_at: usize,
}

impl TwoColumnMeta {
    pub(crate) fn key_range(&self, data: &[u8], row: usize) -> std::ops::Range<usize> {
        let start = read_u32(data, self.key_offsets_at + row * 4) as usize;
        let end = read_u32(data, self.key_offsets_at + (row + 1) * 4) as usize;
        self.key_bytes_at + start..self.key_bytes_at + end
    }

    pub(crate) fn value_range(&self, data: &[u8], row: usize) -> std::ops::Range<usize> {
        let start = read_u32(data, self.value_offsets_at + row * 4) as usize;
        let end = read_u32(data, self.value_offsets_at + (row + 1) * 4) as usize;
        self.value_bytes_at + start..self.value_bytes_at + end
    }
}

/// Region offsets of a columnar index block.
pub type ColumnarIndexMeta = TwoColumnMeta;

/// Region offsets of a columnar keyspan block.
pub type ColumnarKeyspanMeta = TwoColumnMeta;

/// Initializes metadata for a columnar data block, validating the declared
/// column count against the key schema.
pub fn init_data_block_metadata(schema: &KeySchema, data: &[u8]) -> Result<ColumnarDataMeta> {
    let (rows, columns) = header(data)?;
    if columns != schema.columns() {
        return Err(SstError::Corruption(format!(
            "columnar data block declares {columns} columns, key schema {:?} expects {}",
            schema.name(),
            schema.columns()
        )));
    }
    let key_offsets_at = COL_HEADER_SIZE;
    let trailers_at = key_offsets_at + (rows + 1) * 4;
    let obsolete_at = trailers_at + rows * 8;
    let value_offsets_at = obsolete_at + rows;
    let key_bytes_at = value_offsets_at + (rows + 1) * 4;
    if key_bytes_at > data.len() {
        return Err(SstError::Corruption(
            "columnar data block regions out of bounds".into(),
        ));
    }
    let key_bytes_len = check_offsets(data, key_offsets_at, rows)?;
    let value_bytes_len = check_offsets(data, value_offsets_at, rows)?;
    let value_bytes_at = key_bytes_at + key_bytes_len;
    if value_bytes_at + value_bytes_len != data.len() {
        return Err(SstError::Corruption(
            "columnar data block length mismatch".into(),
        ));
    }
    Ok(ColumnarDataMeta {
        rows,
        key_offsets_at,
        trailers_at,
        obsolete_at,
        value_offsets_at,
        key_bytes_at,
        value_bytes_at,
    })
}

fn init_two_column(data: &[u8], what: &str) -> Result<TwoColumnMeta> {
    let (rows, columns) = header(data)?;
    if columns != TWO_COLUMNS {
        return Err(SstError::Corruption(format!(
            "columnar {what} block declares {columns} columns, expected {TWO_COLUMNS}"
        )));
    }
    let key_offsets_at = COL_HEADER_SIZE;
    let value_offsets_at = key_offsets_at + (rows + 1) * 4;
    let key_bytes_at = value_offsets_at + (rows + 1) * 4;
    if key_bytes_at > data.len() {
        return Err(SstError::Corruption(format!(
            "columnar {what} block regions out of bounds"
        )));
    }
    let key_bytes_len = check_offsets(data, key_offsets_at, rows)?;
    let value_bytes_len = check_offsets(data, value_offsets_at, rows)?;
    let value_bytes_at = key_bytes_at + key_bytes_len;
    if value_bytes_at + value_bytes_len != data.len() {
        return Err(SstError::Corruption(format!(
            "columnar {what} block length mismatch"
        )));
    }
    Ok(TwoColumnMeta {
        rows,
        key_offsets_at,
        value_offsets_at,
        key_bytes_at,
        value_bytes_at,
    })
}

/// Initializes metadata for a columnar index block.
pub fn init_index_block_metadata(data: &[u8]) -> Result<ColumnarIndexMeta> {
    init_two_column(data, "index")
}

/// Initializes metadata for a columnar keyspan block.
pub fn init_keyspan_block_metadata(data: &[u8]) -> Result<ColumnarKeyspanMeta> {
    init_two_column(data, "keyspan")
}

// ------------------------------------------------------------------------------------------------
// Block builders (writer side)
// ------------------------------------------------------------------------------------------------

/// Accumulates rows for one columnar data block.
#[derive(Default)]
pub(crate) struct ColDataBlockBuilder {
    key_offsets: Vec<u32>,
    keys: Vec<u8>,
    trailers: Vec<u64>,
    obsolete: Vec<u8>,
    value_offsets: Vec<u32>,
    values: Vec<u8>,
}

impl ColDataBlockBuilder {
    pub(crate) fn new() -> ColDataBlockBuilder {
        ColDataBlockBuilder::default()
    }

    pub(crate) fn add(&mut self, user_key: &[u8], trailer: u64, obsolete: bool, value: &[u8]) {
        if self.key_offsets.is_empty() {
            self.key_offsets.push(0);
            self.value_offsets.push(0);
        }
        self.keys.extend_from_slice(user_key);
        self.key_offsets.push(self.keys.len() as u32);
        self.trailers.push(trailer);
        self.obsolete.push(obsolete as u8);
        self.values.extend_from_slice(value);
        self.value_offsets.push(self.values.len() as u32);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.trailers.is_empty()
    }

    pub(crate) fn size_estimate(&self) -> usize {
        COL_HEADER_SIZE
            + self.key_offsets.len() * 4
            + self.trailers.len() * 9
            + self.value_offsets.len() * 4
            + self.keys.len()
            + self.values.len()
    }

    pub(crate) fn finish(&mut self) -> Vec<u8> {
        let rows = self.trailers.len();
        let mut out = Vec::with_capacity(self.size_estimate());
        out.extend_from_slice(&(rows as u32).to_le_bytes());
        out.extend_from_slice(&DATA_BLOCK_COLUMNS.to_le_bytes());
        for &o in &self.key_offsets {
            out.extend_from_slice(&o.to_le_bytes());
        }
        for &t in &self.trailers {
            out.extend_from_slice(&t.to_le_bytes());
        }
        out.extend_from_slice(&self.obsolete);
        for &o in &self.value_offsets {
            out.extend_from_slice(&o.to_le_bytes());
        }
        out.extend_from_slice(&self.keys);
        out.extend_from_slice(&self.values);
        *self = ColDataBlockBuilder::new();
        out
    }
}

/// Accumulates rows for one two-column (keys + values) block.
#[derive(Default)]
pub(crate) struct TwoColumnBlockBuilder {
    key_offsets: Vec<u32>,
    keys: Vec<u8>,
    value_offsets: Vec<u32>,
    values: Vec<u8>,
}

impl TwoColumnBlockBuilder {
    pub(crate) fn new() -> TwoColumnBlockBuilder {
        TwoColumnBlockBuilder::default()
    }

    pub(crate) fn add(&mut self, key: &[u8], value: &[u8]) {
        if self.key_offsets.is_empty() {
            self.key_offsets.push(0);
            self.value_offsets.push(0);
        }
        self.keys.extend_from_slice(key);
        self.key_offsets.push(self.keys.len() as u32);
        self.values.extend_from_slice(value);
        self.value_offsets.push(self.values.len() as u32);
    }

    pub(crate) fn rows(&self) -> usize {
        self.key_offsets.len().saturating_sub(1)
    }

    pub(crate) fn finish(&mut self) -> Vec<u8> {
        let rows = self.rows();
        let mut out = Vec::new();
        out.extend_from_slice(&(rows as u32).to_le_bytes());
        out.extend_from_slice(&TWO_COLUMNS.to_le_bytes());
        if self.key_offsets.is_empty() {
            // Zero-row block still carries its sentinel offsets.
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
        } else {
            for &o in &self.key_offsets {
                out.extend_from_slice(&o.to_le_bytes());
            }
            for &o in &self.value_offsets {
                out.extend_from_slice(&o.to_le_bytes());
            }
        }
        out.extend_from_slice(&self.keys);
        out.extend_from_slice(&self.values);
        *self = TwoColumnBlockBuilder::new();
        out
    }
}

// ------------------------------------------------------------------------------------------------
// Data iterator
// ------------------------------------------------------------------------------------------------

fn columnar_data_meta(block: &BufferHandle) -> Result<ColumnarDataMeta> {
    match block.metadata() {
        BlockMetadata::ColumnarData(m) => Ok(*m),
        _ => Err(SstError::Internal(
            "columnar data block loaded without columnar metadata".into(),
        )),
    }
}

fn two_column_meta(block: &BufferHandle) -> Result<TwoColumnMeta> {
    match block.metadata() {
        BlockMetadata::ColumnarIndex(m) | BlockMetadata::ColumnarKeyspan(m) => Ok(*m),
        _ => Err(SstError::Internal(
            "columnar block loaded without columnar metadata".into(),
        )),
    }
}

/// Columnar implementation of [`DataIterator`]. Seeks binary search the
/// key column using the precomputed block metadata.
pub struct ColDataIter {
    block: BufferHandle,
    meta: ColumnarDataMeta,
    cmp: Arc<dyn Comparator>,
    transforms: IterTransforms,
    row: usize,
    valid: bool,
    key_buf: Vec<u8>,
}

impl ColDataIter {
    fn position(&mut self, row: usize) -> bool {
        if row >= self.meta.rows {
            self.valid = false;
            return false;
        }
        self.row = row;
        self.valid = true;
        true
    }

    fn settle(&mut self, forward: bool) -> bool {
        if self.transforms.hide_obsolete_points {
            let data = self.block.data();
            while self.valid && self.meta.obsolete(data, self.row) {
                if forward {
                    if self.row + 1 >= self.meta.rows {
                        self.valid = false;
                        return false;
                    }
                    self.row += 1;
                } else {
                    if self.row == 0 {
                        self.valid = false;
                        return false;
                    }
                    self.row -= 1;
                }
            }
        }
        if !self.valid {
            return false;
        }
        if let Some(prefix) = &self.transforms.synthetic_prefix {
            let range = self.meta.key_range(self.block.data(), self.row);
            self.key_buf.clear();
            self.key_buf.extend_from_slice(prefix);
            let data = self.block.data();
            self.key_buf.extend_from_slice(&data[range]);
        }
        true
    }

    /// First row with user key ≥ `key`.
    fn lower_bound(&self, key: &[u8]) -> usize {
        let data = self.block.data();
        let mut lo = 0usize;
        let mut hi = self.meta.rows;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let mid_key = &data[self.meta.key_range(data, mid)];
            if self.cmp.compare(mid_key, key) == std::cmp::Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }
}

impl DataIterator for ColDataIter {
    fn new(
        block: BufferHandle,
        cmp: Arc<dyn Comparator>,
        transforms: IterTransforms,
    ) -> Result<ColDataIter> {
        let meta = columnar_data_meta(&block)?;
        Ok(ColDataIter {
            block,
            meta,
            cmp,
            transforms,
            row: 0,
            valid: false,
            key_buf: Vec::new(),
        })
    }

    fn seek_ge(&mut self, key: &[u8]) -> bool {
        let row = self.lower_bound(key);
        self.position(row) && self.settle(true)
    }

    fn first(&mut self) -> bool {
        self.position(0) && self.settle(true)
    }

    fn last(&mut self) -> bool {
        if self.meta.rows == 0 {
            self.valid = false;
            return false;
        }
        self.position(self.meta.rows - 1) && self.settle(false)
    }

    fn next(&mut self) -> bool {
        if !self.valid {
            return false;
        }
        self.position(self.row + 1) && self.settle(true)
    }

    fn prev(&mut self) -> bool {
        if !self.valid || self.row == 0 {
            self.valid = false;
            return false;
        }
        self.position(self.row - 1) && self.settle(false)
    }

    fn valid(&self) -> bool {
        self.valid
    }

    fn key(&self) -> KeyRef<'_> {
        debug_assert!(self.valid);
        let data = self.block.data();
        let user_key: &[u8] = if self.transforms.synthetic_prefix.is_some() {
            &self.key_buf
        } else {
            &data[self.meta.key_range(data, self.row)]
        };
        let raw_trailer = self.meta.trailer(data, self.row);
        let trailer = match self.transforms.synthetic_seqnum {
            Some(seqnum) => trailer_with_seqnum(raw_trailer, seqnum),
            None => raw_trailer,
        };
        KeyRef { user_key, trailer }
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        let data = self.block.data();
        &data[self.meta.value_range(data, self.row)]
    }
}

// ------------------------------------------------------------------------------------------------
// Index iterator
// ------------------------------------------------------------------------------------------------

/// Columnar implementation of [`IndexIterator`].
pub struct ColIndexIter {
    block: BufferHandle,
    meta: ColumnarIndexMeta,
    cmp: Arc<dyn Comparator>,
    row: usize,
    valid: bool,
}

impl ColIndexIter {
    fn lower_bound(&self, key: &[u8]) -> usize {
        let data = self.block.data();
        let mut lo = 0usize;
        let mut hi = self.meta.rows;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let mid_key = &data[self.meta.key_range(data, mid)];
            if self.cmp.compare(mid_key, key) == std::cmp::Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    fn position(&mut self, row: usize) -> bool {
        if row >= self.meta.rows {
            self.valid = false;
            return false;
        }
        self.row = row;
        self.valid = true;
        true
    }
}

impl IndexIterator for ColIndexIter {
    fn new(block: BufferHandle, cmp: Arc<dyn Comparator>) -> Result<ColIndexIter> {
        let meta = two_column_meta(&block)?;
        Ok(ColIndexIter {
            block,
            meta,
            cmp,
            row: 0,
            valid: false,
        })
    }

    fn seek_ge(&mut self, key: &[u8]) -> bool {
        let row = self.lower_bound(key);
        self.position(row)
    }

    fn first(&mut self) -> bool {
        self.position(0)
    }

    fn last(&mut self) -> bool {
        if self.meta.rows == 0 {
            self.valid = false;
            return false;
        }
        self.position(self.meta.rows - 1)
    }

    fn next(&mut self) -> bool {
        if !self.valid {
            return false;
        }
        self.position(self.row + 1)
    }

    fn prev(&mut self) -> bool {
        if !self.valid || self.row == 0 {
            self.valid = false;
            return false;
        }
        self.position(self.row - 1)
    }

    fn valid(&self) -> bool {
        self.valid
    }

    fn separator(&self) -> &[u8] {
        debug_assert!(self.valid);
        let data = self.block.data();
        &data[self.meta.key_range(data, self.row)]
    }

    fn block_handle_with_properties(&self) -> Result<HandleWithProperties> {
        debug_assert!(self.valid);
        let data = self.block.data();
        HandleWithProperties::decode(&data[self.meta.value_range(data, self.row)])
            .map_err(|e| SstError::Corruption(format!("corrupt index entry: {e}")))
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

//! Core key model: sequence numbers, key kinds, internal keys, comparators,
//! and mergers.
//!
//! Every record in a table is keyed by an **internal key**: the user key
//! bytes plus a packed trailer carrying the sequence number and the key
//! kind. Tables store internal keys sorted by user key ascending (per the
//! comparator) and, within one user key, by sequence number descending —
//! newest version first.
//!
//! # Trailer encoding
//!
//! ```text
//! trailer = (seqnum << 8) | kind
//! ```
//!
//! Comparators and mergers are looked up by name: a table records the names
//! it was written with, and the reader refuses to open a file whose names
//! it cannot resolve.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use bincode::config::{standard, Configuration, Fixint, LittleEndian};

use crate::error::{Result, SstError};

/// bincode configuration shared by every on-disk structure: little-endian,
/// fixed integer encoding. Fixed-int keeps record sizes deterministic,
/// which the footer and block codecs rely on.
pub(crate) type WireConfig = Configuration<LittleEndian, Fixint>;

/// Returns the crate-wide bincode configuration.
pub(crate) fn wire_config() -> WireConfig {
    standard().with_fixed_int_encoding()
}

// ------------------------------------------------------------------------------------------------
// Sequence numbers and key kinds
// ------------------------------------------------------------------------------------------------

/// Monotonically increasing version number assigned by the storage engine.
pub type SeqNum = u64;

/// Number of bits the sequence number is shifted by inside a trailer.
const TRAILER_KIND_BITS: u32 = 8;

/// The kind of operation an internal key represents.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum KeyKind {
    /// Point deletion tombstone.
    Delete = 0,
    /// Point write.
    Set = 1,
    /// Merge operand, resolved by the configured merger.
    Merge = 2,
    /// Range deletion fragment.
    RangeDelete = 3,
    /// Range key set fragment.
    RangeKeySet = 4,
    /// Range key unset fragment.
    RangeKeyUnset = 5,
    /// Range key deletion fragment.
    RangeKeyDelete = 6,
}

impl KeyKind {
    /// Decodes a kind byte. Unknown bytes are corruption.
    pub fn from_u8(v: u8) -> Result<KeyKind> {
        match v {
            0 => Ok(KeyKind::Delete),
            1 => Ok(KeyKind::Set),
            2 => Ok(KeyKind::Merge),
            3 => Ok(KeyKind::RangeDelete),
            4 => Ok(KeyKind::RangeKeySet),
            5 => Ok(KeyKind::RangeKeyUnset),
            6 => Ok(KeyKind::RangeKeyDelete),
            _ => Err(SstError::Corruption(format!("unknown key kind {v}"))),
        }
    }
}

/// Packs a sequence number and kind into a trailer.
pub fn make_trailer(seqnum: SeqNum, kind: KeyKind) -> u64 {
    (seqnum << TRAILER_KIND_BITS) | kind as u64
}

/// Extracts the sequence number from a trailer.
pub fn trailer_seqnum(trailer: u64) -> SeqNum {
    trailer >> TRAILER_KIND_BITS
}

/// Extracts the kind from a trailer.
pub fn trailer_kind(trailer: u64) -> Result<KeyKind> {
    KeyKind::from_u8((trailer & 0xff) as u8)
}

/// Rewrites the sequence number of a trailer, keeping the kind. Used by the
/// sequence-number masking iterator transform.
pub fn trailer_with_seqnum(trailer: u64, seqnum: SeqNum) -> u64 {
    (seqnum << TRAILER_KIND_BITS) | (trailer & 0xff)
}

// ------------------------------------------------------------------------------------------------
// Internal keys
// ------------------------------------------------------------------------------------------------

/// An owned internal key: user key bytes plus a packed trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalKey {
    /// User key bytes, ordered by the table's comparator.
    pub user_key: Vec<u8>,

    /// Packed `(seqnum << 8) | kind`.
    pub trailer: u64,
}

impl InternalKey {
    /// Builds an internal key from parts.
    pub fn new(user_key: impl Into<Vec<u8>>, seqnum: SeqNum, kind: KeyKind) -> InternalKey {
        InternalKey {
            user_key: user_key.into(),
            trailer: make_trailer(seqnum, kind),
        }
    }

    /// The sequence number packed into the trailer.
    pub fn seqnum(&self) -> SeqNum {
        trailer_seqnum(self.trailer)
    }

    /// The key kind packed into the trailer.
    pub fn kind(&self) -> Result<KeyKind> {
        trailer_kind(self.trailer)
    }
}

/// A borrowed view of an internal key inside a block buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct KeyRef<'a> {
    /// User key bytes.
    pub user_key: &'a [u8],

    /// Packed trailer.
    pub trailer: u64,
}

impl KeyRef<'_> {
    /// The sequence number packed into the trailer.
    pub fn seqnum(&self) -> SeqNum {
        trailer_seqnum(self.trailer)
    }

    /// Copies this view into an owned [`InternalKey`].
    pub fn to_owned(&self) -> InternalKey {
        InternalKey {
            user_key: self.user_key.to_vec(),
            trailer: self.trailer,
        }
    }
}

/// Total order over internal keys: user key ascending per `cmp`, trailer
/// descending (newer versions sort first).
pub fn compare_internal(cmp: &dyn Comparator, a: &KeyRef<'_>, b: &KeyRef<'_>) -> Ordering {
    cmp.compare(a.user_key, b.user_key)
        .then_with(|| b.trailer.cmp(&a.trailer))
}

// ------------------------------------------------------------------------------------------------
// Comparators
// ------------------------------------------------------------------------------------------------

/// User key ordering. A table records the name of the comparator it was
/// written with; the reader refuses files whose comparator it cannot
/// resolve.
pub trait Comparator: Send + Sync {
    /// Stable name recorded in table properties.
    fn name(&self) -> &'static str;

    /// Total order over user keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Length of the prefix portion of `key`. The default treats the whole
    /// key as the prefix.
    fn split(&self, key: &[u8]) -> usize {
        key.len()
    }

    /// Key equality; defaults to `compare == Equal`.
    fn equal(&self, a: &[u8], b: &[u8]) -> bool {
        self.compare(a, b) == Ordering::Equal
    }
}

/// Name of the default bytewise comparator.
pub const BYTEWISE_COMPARATOR_NAME: &str = "petra.bytewise";

/// Lexicographic byte ordering.
#[derive(Debug, Default, Copy, Clone)]
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn name(&self) -> &'static str {
        BYTEWISE_COMPARATOR_NAME
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Name → comparator lookup table consulted when a file was written with a
/// comparator other than the configured default.
#[derive(Clone)]
pub struct ComparatorRegistry {
    by_name: HashMap<&'static str, Arc<dyn Comparator>>,
}

impl ComparatorRegistry {
    /// An empty registry.
    pub fn new() -> ComparatorRegistry {
        ComparatorRegistry {
            by_name: HashMap::new(),
        }
    }

    /// Registers a comparator under its own name.
    pub fn register(&mut self, cmp: Arc<dyn Comparator>) {
        self.by_name.insert(cmp.name(), cmp);
    }

    /// Looks up a comparator by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Comparator>> {
        self.by_name.get(name).cloned()
    }
}

impl Default for ComparatorRegistry {
    fn default() -> ComparatorRegistry {
        let mut r = ComparatorRegistry::new();
        r.register(Arc::new(BytewiseComparator));
        r
    }
}

// ------------------------------------------------------------------------------------------------
// Mergers
// ------------------------------------------------------------------------------------------------

/// In-progress merge of the operands recorded for one user key.
pub trait ValueMerger: Send {
    /// Folds in an operand newer than every operand seen so far.
    fn merge_newer(&mut self, value: &[u8]) -> Result<()>;

    /// Finishes the merge and yields the resolved value.
    fn finish(self: Box<Self>) -> Result<Vec<u8>>;
}

/// Resolves [`KeyKind::Merge`] operands. The reader only validates the
/// merger name recorded in a file; resolution happens in higher layers.
pub trait Merger: Send + Sync {
    /// Stable name recorded in table properties.
    fn name(&self) -> &'static str;

    /// Starts a merge for `key` seeded with its oldest operand.
    fn merge(&self, key: &[u8], value: &[u8]) -> Result<Box<dyn ValueMerger>>;
}

/// Name of the provided concatenating merger.
pub const CONCAT_MERGER_NAME: &str = "petra.concat";

/// Merger that concatenates operands oldest-to-newest.
#[derive(Debug, Default, Copy, Clone)]
pub struct ConcatMerger;

struct ConcatValueMerger {
    buf: Vec<u8>,
}

impl ValueMerger for ConcatValueMerger {
    fn merge_newer(&mut self, value: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(value);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<Vec<u8>> {
        Ok(self.buf)
    }
}

impl Merger for ConcatMerger {
    fn name(&self) -> &'static str {
        CONCAT_MERGER_NAME
    }

    fn merge(&self, _key: &[u8], value: &[u8]) -> Result<Box<dyn ValueMerger>> {
        Ok(Box::new(ConcatValueMerger {
            buf: value.to_vec(),
        }))
    }
}

/// Name → merger lookup table.
#[derive(Clone)]
pub struct MergerRegistry {
    by_name: HashMap<&'static str, Arc<dyn Merger>>,
}

impl MergerRegistry {
    /// An empty registry.
    pub fn new() -> MergerRegistry {
        MergerRegistry {
            by_name: HashMap::new(),
        }
    }

    /// Registers a merger under its own name.
    pub fn register(&mut self, merger: Arc<dyn Merger>) {
        self.by_name.insert(merger.name(), merger);
    }

    /// Looks up a merger by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Merger>> {
        self.by_name.get(name).cloned()
    }
}

impl Default for MergerRegistry {
    fn default() -> MergerRegistry {
        let mut r = MergerRegistry::new();
        r.register(Arc::new(ConcatMerger));
        r
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailer_round_trip() {
        let t = make_trailer(42, KeyKind::Set);
        assert_eq!(trailer_seqnum(t), 42);
        assert_eq!(trailer_kind(t).unwrap(), KeyKind::Set);

        let masked = trailer_with_seqnum(t, 7);
        assert_eq!(trailer_seqnum(masked), 7);
        assert_eq!(trailer_kind(masked).unwrap(), KeyKind::Set);
    }

    #[test]
    fn unknown_kind_is_corruption() {
        assert!(matches!(
            KeyKind::from_u8(0xee),
            Err(SstError::Corruption(_))
        ));
    }

    #[test]
    fn internal_key_order_newest_first() {
        let cmp = BytewiseComparator;
        let newer = InternalKey::new(b"k".to_vec(), 9, KeyKind::Set);
        let older = InternalKey::new(b"k".to_vec(), 3, KeyKind::Set);
        let a = KeyRef {
            user_key: &newer.user_key,
            trailer: newer.trailer,
        };
        let b = KeyRef {
            user_key: &older.user_key,
            trailer: older.trailer,
        };
        assert_eq!(compare_internal(&cmp, &a, &b), Ordering::Less);
    }

    #[test]
    fn registries_resolve_defaults() {
        let comparators = ComparatorRegistry::default();
        assert!(comparators.get(BYTEWISE_COMPARATOR_NAME).is_some());
        assert!(comparators.get("nope").is_none());

        let mergers = MergerRegistry::default();
        assert!(mergers.get(CONCAT_MERGER_NAME).is_some());
    }

    #[test]
    fn concat_merger_appends() {
        let m = ConcatMerger;
        let mut vm = m.merge(b"k", b"a").unwrap();
        vm.merge_newer(b"b").unwrap();
        vm.merge_newer(b"c").unwrap();
        assert_eq!(vm.finish().unwrap(), b"abc");
    }
}

//! Filter policies and the table filter reader.
//!
//! A table may carry one **full filter block** per filter policy: a
//! whole-file membership structure probed before point seeks. A negative
//! probe proves the key is absent and short-circuits the seek without
//! touching any data block. The provided policy is a bloom filter built on
//! the [`bloomfilter`] crate; a corrupted filter degrades to "maybe
//! present" so reads still succeed through the full search path.

use std::sync::Arc;

use bloomfilter::Bloom;
use tracing::warn;

use crate::error::{Result, SstError};

/// Metaindex name prefix for full filter blocks; the policy name follows.
pub const FULL_FILTER_PREFIX: &str = "fullfilter.";

/// Whole-file membership filter builder and prober.
pub trait FilterPolicy: Send + Sync {
    /// Stable policy name; the metaindex entry is `fullfilter.<name>`.
    fn name(&self) -> &'static str;

    /// Builds the filter block contents from every user key in the file.
    fn build(&self, keys: &[Vec<u8>]) -> Result<Vec<u8>>;

    /// Probes the filter. `true` means the key may be present; `false`
    /// proves it is absent.
    fn may_contain(&self, filter: &[u8], key: &[u8]) -> bool;
}

/// Name of the provided bloom filter policy.
pub const BLOOM_FILTER_POLICY_NAME: &str = "petra.bloom";

/// Bloom-filter policy with a configurable false-positive rate.
#[derive(Debug, Clone)]
pub struct BloomFilterPolicy {
    fp_rate: f64,
}

impl BloomFilterPolicy {
    /// A policy targeting the given false-positive rate.
    pub fn new(fp_rate: f64) -> BloomFilterPolicy {
        BloomFilterPolicy { fp_rate }
    }
}

impl Default for BloomFilterPolicy {
    fn default() -> BloomFilterPolicy {
        BloomFilterPolicy { fp_rate: 0.01 }
    }
}

impl FilterPolicy for BloomFilterPolicy {
    fn name(&self) -> &'static str {
        BLOOM_FILTER_POLICY_NAME
    }

    fn build(&self, keys: &[Vec<u8>]) -> Result<Vec<u8>> {
        let mut bloom: Bloom<[u8]> = Bloom::new_for_fp_rate(keys.len().max(1), self.fp_rate)
            .map_err(|e| SstError::Internal(e.to_string()))?;
        for key in keys {
            bloom.set(key);
        }
        Ok(bloom.as_slice().to_vec())
    }

    fn may_contain(&self, filter: &[u8], key: &[u8]) -> bool {
        match Bloom::<[u8]>::from_slice(filter) {
            Ok(bloom) => bloom.check(key),
            // Corrupted filter: fall back to the full search path.
            Err(_) => true,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Filter-block usage policy
// ------------------------------------------------------------------------------------------------

/// Caller policy for when a point iterator consults the filter block.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FilterBlockSizeLimit {
    /// Probe the filter whenever the file carries one.
    Always,

    /// Never probe the filter (compaction iterators).
    Never,

    /// Probe only when the filter block is at most this many bytes.
    BelowSize(u64),
}

impl FilterBlockSizeLimit {
    /// Whether a filter block of `len` bytes should be used.
    pub fn permits(self, len: u64) -> bool {
        match self {
            FilterBlockSizeLimit::Always => true,
            FilterBlockSizeLimit::Never => false,
            FilterBlockSizeLimit::BelowSize(limit) => len <= limit,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Table filter reader
// ------------------------------------------------------------------------------------------------

/// Probes a table's full filter block under its policy.
pub struct TableFilterReader {
    policy: Arc<dyn FilterPolicy>,
}

impl TableFilterReader {
    /// Binds a policy to this table's filter block.
    pub fn new(policy: Arc<dyn FilterPolicy>) -> TableFilterReader {
        TableFilterReader { policy }
    }

    /// The bound policy.
    pub fn policy(&self) -> &Arc<dyn FilterPolicy> {
        &self.policy
    }

    /// Probes pre-loaded filter block bytes. Probe failures never turn
    /// into read errors; a filter that cannot be interpreted reports
    /// "maybe present".
    pub fn may_contain(&self, filter: &[u8], key: &[u8]) -> bool {
        if filter.is_empty() {
            warn!(policy = self.policy.name(), "empty filter block; skipping probe");
            return true;
        }
        self.policy.may_contain(filter, key)
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

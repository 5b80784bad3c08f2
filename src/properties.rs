//! The properties block: file-level statistics and configuration names.
//!
//! Written once by the table builder, decoded once when a reader opens the
//! file. The comparator, merger, and key-schema names recorded here must
//! resolve against the reader's configuration or the file refuses to open.
//! User properties are free-form string pairs; callers may supply a
//! deny-list of keys to drop at load time.

use std::collections::HashSet;

use crate::base::wire_config;
use crate::error::Result;

/// Index shape of a table.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IndexType {
    /// The top-level index points directly at data blocks.
    SingleLevel,

    /// The top-level index points at sub-index blocks, which point at data
    /// blocks.
    TwoLevel,
}

/// Statistics shared by every table format.
#[derive(Debug, Clone, Default, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct CommonProperties {
    /// Total number of point entries.
    pub num_entries: u64,

    /// Number of point deletion entries.
    pub num_deletions: u64,

    /// Number of range deletion fragments.
    pub num_range_deletions: u64,

    /// Number of range key fragments.
    pub num_range_keys: u64,

    /// Sum of user key lengths across point entries.
    pub raw_key_size: u64,

    /// Sum of value lengths across point entries.
    pub raw_value_size: u64,

    /// Total bytes of data blocks, trailers included. Data blocks start at
    /// file offset zero, so this is also the offset one past the last data
    /// block.
    pub data_size: u64,

    /// Total bytes of value blocks, trailers included. Zero for formats
    /// without value blocks.
    pub value_blocks_size: u64,

    /// Number of data blocks.
    pub num_data_blocks: u64,

    /// Number of sub-index partitions. Zero means a single-level index.
    pub index_partitions: u64,

    /// Largest sequence number of any entry in the file.
    pub largest_seqnum: u64,
}

/// Decoded properties block.
#[derive(Debug, Clone, Default, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Properties {
    /// Name of the comparator the file was written with.
    pub comparator_name: String,

    /// Name of the merger the file was written with; empty when the file
    /// holds no merge operands.
    pub merger_name: String,

    /// Name of the key schema (columnar formats only; empty otherwise).
    pub key_schema_name: String,

    /// Shared statistics.
    pub common: CommonProperties,

    /// Free-form user properties, sorted by key.
    pub user_properties: Vec<(String, String)>,
}

impl Properties {
    /// The index shape implied by `index_partitions`.
    pub fn index_type(&self) -> IndexType {
        if self.common.index_partitions > 0 {
            IndexType::TwoLevel
        } else {
            IndexType::SingleLevel
        }
    }

    /// Encodes the properties block. Writer-side only.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::encode_to_vec(self, wire_config())?)
    }

    /// Decodes a properties block, dropping any user property whose key
    /// appears in `denied_user_properties`.
    pub fn load(data: &[u8], denied_user_properties: &HashSet<String>) -> Result<Properties> {
        let (mut props, _) = bincode::decode_from_slice::<Properties, _>(data, wire_config())?;
        if !denied_user_properties.is_empty() {
            props
                .user_properties
                .retain(|(k, _)| !denied_user_properties.contains(k));
        }
        Ok(props)
    }

    /// Looks up a user property by key.
    pub fn user_property(&self, key: &str) -> Option<&str> {
        self.user_properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Properties {
        Properties {
            comparator_name: "petra.bytewise".to_string(),
            merger_name: String::new(),
            key_schema_name: "petra.default".to_string(),
            common: CommonProperties {
                num_entries: 100,
                num_deletions: 3,
                num_range_deletions: 1,
                num_range_keys: 0,
                raw_key_size: 800,
                raw_value_size: 6400,
                data_size: 8192,
                value_blocks_size: 0,
                num_data_blocks: 2,
                index_partitions: 0,
                largest_seqnum: 100,
            },
            user_properties: vec![
                ("app.owner".to_string(), "tests".to_string()),
                ("app.secret".to_string(), "hidden".to_string()),
            ],
        }
    }

    #[test]
    fn round_trip() {
        let props = sample();
        let bytes = props.encode().unwrap();
        let loaded = Properties::load(&bytes, &HashSet::new()).unwrap();
        assert_eq!(loaded, props);
    }

    #[test]
    fn deny_list_filters_user_properties() {
        let bytes = sample().encode().unwrap();
        let denied: HashSet<String> = ["app.secret".to_string()].into_iter().collect();
        let loaded = Properties::load(&bytes, &denied).unwrap();
        assert_eq!(loaded.user_property("app.owner"), Some("tests"));
        assert_eq!(loaded.user_property("app.secret"), None);
    }

    #[test]
    fn index_type_follows_partitions() {
        let mut props = sample();
        assert_eq!(props.index_type(), IndexType::SingleLevel);
        props.common.index_partitions = 10;
        assert_eq!(props.index_type(), IndexType::TwoLevel);
    }
}

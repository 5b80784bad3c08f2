//! Basic build/open cycles across every table shape.
//!
//! ## See also
//! - [`tests_iter`] — iterator ordering, seeks, bounds
//! - [`tests_corruption`] — corrupted and misconfigured files

#[cfg(test)]
mod tests {
    use crate::base::BYTEWISE_COMPARATOR_NAME;
    use crate::block::cache::BlockCache;
    use crate::colblk::DEFAULT_KEY_SCHEMA_NAME;
    use crate::filter::BloomFilterPolicy;
    use crate::iterator::IterTransforms;
    use crate::properties::IndexType;
    use crate::reader::iter::SstIterator;
    use crate::reader::tests::helpers::*;
    use crate::reader::ReaderOptions;
    use crate::writer::WriterOptions;
    use std::sync::Arc;
    use tempfile::TempDir;

    // ================================================================
    // 1. Open succeeds for every shape and reports its metadata
    // ================================================================

    /// # Scenario
    /// Build a 20-entry table in each `{row, columnar} × {single,
    /// two-level}` shape and open it.
    ///
    /// # Expected behavior
    /// `Reader::new` succeeds; format, index type, entry counts, and
    /// configuration names round-trip through the properties block.
    #[test]
    fn open_reports_format_and_properties() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        for (i, shape) in ALL_SHAPES.iter().enumerate() {
            let entries = numbered_entries(20);
            let path = build_table(
                tmp.path(),
                &format!("basic_{i}.sst"),
                shape_opts(*shape),
                &entries,
            );
            let reader = open(&path).unwrap();

            assert_eq!(reader.table_format().unwrap(), shape_format(*shape));
            let props = reader.properties();
            assert_eq!(props.comparator_name, BYTEWISE_COMPARATOR_NAME);
            assert_eq!(props.common.num_entries, 20);
            assert_eq!(props.common.largest_seqnum, 20);
            assert!(props.common.num_data_blocks >= 2, "block size 64 must split");
            if shape.two_level {
                assert_eq!(props.index_type(), IndexType::TwoLevel);
                assert!(props.common.index_partitions >= 2);
            } else {
                assert_eq!(props.index_type(), IndexType::SingleLevel);
                assert_eq!(props.common.index_partitions, 0);
            }
            if shape.columnar {
                assert_eq!(props.key_schema_name, DEFAULT_KEY_SCHEMA_NAME);
            } else {
                assert!(props.key_schema_name.is_empty());
            }
        }
    }

    // ================================================================
    // 2. Data size accounting
    // ================================================================

    /// # Scenario
    /// Data blocks start at offset zero, so `data_size` must equal the
    /// offset one past the last data block and stay below the file size.
    #[test]
    fn data_size_is_prefix_of_file() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let entries = numbered_entries(50);
        let path = build_table(
            tmp.path(),
            "sizes.sst",
            shape_opts(Shape { columnar: true, two_level: false }),
            &entries,
        );
        let file_size = std::fs::metadata(&path).unwrap().len();
        let reader = open(&path).unwrap();
        let data_size = reader.common_properties().data_size;
        assert!(data_size > 0);
        assert!(data_size < file_size);
    }

    // ================================================================
    // 3. User properties and the deny-list
    // ================================================================

    /// # Scenario
    /// Record two user properties; open once normally and once with one
    /// key denied.
    ///
    /// # Expected behavior
    /// The denied key is absent after load, the other survives.
    #[test]
    fn denied_user_properties_are_dropped() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let mut opts = WriterOptions::default();
        opts.user_properties = vec![
            ("app.owner".to_string(), "tests".to_string()),
            ("app.internal".to_string(), "secret".to_string()),
        ];
        let path = build_table(tmp.path(), "props.sst", opts, &numbered_entries(4));

        let reader = open(&path).unwrap();
        assert_eq!(reader.properties().user_property("app.owner"), Some("tests"));
        assert_eq!(
            reader.properties().user_property("app.internal"),
            Some("secret")
        );

        let mut options = ReaderOptions::default();
        options.denied_user_properties.insert("app.internal".to_string());
        let reader = open_with(&path, options).unwrap();
        assert_eq!(reader.properties().user_property("app.owner"), Some("tests"));
        assert_eq!(reader.properties().user_property("app.internal"), None);
    }

    // ================================================================
    // 4. Shared block cache
    // ================================================================

    /// # Scenario
    /// Open a table with a shared cache and run two full scans.
    ///
    /// # Expected behavior
    /// Both scans agree and the cache holds blocks afterwards.
    #[test]
    fn scans_populate_the_shared_cache() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let entries = numbered_entries(30);
        let path = build_table(
            tmp.path(),
            "cached.sst",
            shape_opts(Shape { columnar: false, two_level: false }),
            &entries,
        );

        let cache = Arc::new(BlockCache::new(128));
        let mut options = ReaderOptions::default();
        options.cache = Some(cache.clone());
        let reader = open_with(&path, options).unwrap();

        let mut a = reader.new_iter(IterTransforms::none(), None, None).unwrap();
        let mut b = reader.new_iter(IterTransforms::none(), None, None).unwrap();
        let first = collect_forward(a.as_mut());
        let second = collect_forward(b.as_mut());
        assert_eq!(first.len(), 30);
        assert_eq!(first, second);
        assert!(!cache.is_empty());
    }

    // ================================================================
    // 5. Filter block presence
    // ================================================================

    /// # Scenario
    /// Build a table with a bloom filter policy and seek a key past the
    /// end of the keyspace.
    ///
    /// # Expected behavior
    /// The seek returns past-end whether the probe short-circuits or a
    /// false positive falls through to the index.
    #[test]
    fn filtered_seek_past_keyspace_is_empty() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let mut opts = shape_opts(Shape { columnar: true, two_level: false });
        opts.filter_policy = Some(Arc::new(BloomFilterPolicy::default()));
        let path = build_table(tmp.path(), "filtered.sst", opts, &numbered_entries(100));

        let reader = open(&path).unwrap();
        let mut it = reader.new_iter(IterTransforms::none(), None, None).unwrap();
        assert!(it.seek_ge(b"zzz_absent").unwrap().is_none());
        // Present keys are never filtered out.
        let hit = it.seek_ge(b"key_0042").unwrap().unwrap();
        assert_eq!(hit.0.user_key, b"key_0042");
    }
}

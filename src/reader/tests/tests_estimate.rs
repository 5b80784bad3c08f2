//! Disk-usage estimation.

#[cfg(test)]
mod tests {
    use crate::readable::ReadContext;
    use crate::reader::tests::helpers::*;
    use tempfile::TempDir;

    // ================================================================
    // 1. Estimates never exceed the file size (universal property 2)
    // ================================================================

    /// # Scenario
    /// Estimate usage for a sweep of `[a, b]` ranges over every shape.
    ///
    /// # Expected behavior
    /// Every estimate is ≤ the file size, and full-range estimates are
    /// positive.
    #[test]
    fn estimates_bounded_by_file_size() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let entries = numbered_entries(120);
        for (i, shape) in ALL_SHAPES.iter().enumerate() {
            let path = build_table(
                tmp.path(),
                &format!("est_{i}.sst"),
                shape_opts(*shape),
                &entries,
            );
            let file_size = std::fs::metadata(&path).unwrap().len();
            let reader = open(&path).unwrap();
            let rctx = ReadContext::new();

            for (lo, hi) in [(0usize, 119usize), (0, 0), (10, 30), (60, 119), (100, 110)] {
                let start = format!("key_{lo:04}").into_bytes();
                let end = format!("key_{hi:04}").into_bytes();
                let estimate = reader.estimate_disk_usage(&rctx, &start, &end).unwrap();
                assert!(
                    estimate <= file_size,
                    "estimate {estimate} exceeds file size {file_size} ({shape:?}, {lo}..{hi})"
                );
                assert!(estimate > 0, "overlapping range must estimate > 0");
            }

            // Wider subranges never estimate smaller.
            let narrow = reader
                .estimate_disk_usage(&rctx, b"key_0040", b"key_0050")
                .unwrap();
            let wide = reader
                .estimate_disk_usage(&rctx, b"key_0020", b"key_0090")
                .unwrap();
            assert!(narrow <= wide, "shape {shape:?}");
        }
    }

    // ================================================================
    // 2. Full coverage equals data + value blocks (S3)
    // ================================================================

    /// # Scenario
    /// A two-level table with 100 data blocks in 10 sub-indexes, values
    /// separated into value blocks. Estimate from the first key to the
    /// last.
    ///
    /// # Expected behavior
    /// The estimate equals `data_size + value_blocks_size`: full
    /// coverage, full interpolation.
    #[test]
    fn full_range_estimate_equals_data_plus_value_blocks() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("full.sst");
        let mut opts = shape_opts(Shape { columnar: true, two_level: true });
        opts.block_size = 1; // one entry per data block: 100 blocks
        opts.index_partition_len = Some(10); // 10 sub-indexes
        opts.value_block_min_len = Some(1); // every value separated
        let entries = numbered_entries(100);
        let path = {
            let mut w = crate::writer::SstWriter::new(&path, opts).unwrap();
            for (key, value) in &entries {
                w.add(key, value).unwrap();
            }
            w.finish().unwrap();
            path
        };

        let reader = open(&path).unwrap();
        let props = reader.common_properties();
        assert_eq!(props.num_data_blocks, 100);
        assert_eq!(props.index_partitions, 10);
        assert!(props.value_blocks_size > 0);

        let estimate = reader
            .estimate_disk_usage(&ReadContext::new(), b"key_0000", b"key_0099")
            .unwrap();
        assert_eq!(estimate, props.data_size + props.value_blocks_size);
    }

    // ================================================================
    // 3. Ranges past the file estimate zero
    // ================================================================

    /// # Scenario
    /// Estimate for a range entirely after the last key.
    ///
    /// # Expected behavior
    /// Zero, for flat and partitioned indexes alike.
    #[test]
    fn range_after_file_estimates_zero() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let entries = numbered_entries(40);
        for (i, shape) in ALL_SHAPES.iter().enumerate() {
            let path = build_table(
                tmp.path(),
                &format!("after_{i}.sst"),
                shape_opts(*shape),
                &entries,
            );
            let reader = open(&path).unwrap();
            let estimate = reader
                .estimate_disk_usage(&ReadContext::new(), b"zzz_0", b"zzz_9")
                .unwrap();
            assert_eq!(estimate, 0, "shape {shape:?}");
        }
    }

    // ================================================================
    // 4. Ranges extending past the file include the tail
    // ================================================================

    /// # Scenario
    /// Estimate from a mid-file key to a key beyond the last entry.
    ///
    /// # Expected behavior
    /// The estimate covers every data block from the start key's block
    /// through the last block.
    #[test]
    fn range_beyond_end_includes_tail() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let entries = numbered_entries(60);
        for (i, shape) in ALL_SHAPES.iter().enumerate() {
            let path = build_table(
                tmp.path(),
                &format!("tail_{i}.sst"),
                shape_opts(*shape),
                &entries,
            );
            let reader = open(&path).unwrap();
            let rctx = ReadContext::new();

            let beyond = reader
                .estimate_disk_usage(&rctx, b"key_0030", b"zzz")
                .unwrap();
            let to_last = reader
                .estimate_disk_usage(&rctx, b"key_0030", b"key_0059")
                .unwrap();
            assert_eq!(beyond, to_last, "shape {shape:?}");

            let whole = reader
                .estimate_disk_usage(&rctx, b"key_0000", b"zzz")
                .unwrap();
            assert_eq!(whole, reader.common_properties().data_size, "shape {shape:?}");
        }
    }
}

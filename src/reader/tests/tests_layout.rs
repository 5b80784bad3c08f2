//! Layout enumeration and whole-file checksum validation.

#[cfg(test)]
mod tests {
    use crate::block::{BlockHandle, TRAILER_LEN};
    use crate::filter::BloomFilterPolicy;
    use crate::footer::FOOTER_SIZE;
    use crate::keyspan::{Span, SpanKey};
    use crate::base::{make_trailer, KeyKind};
    use crate::readable::ReadContext;
    use crate::reader::tests::helpers::*;
    use crate::reader::Layout;
    use crate::writer::SstWriter;
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Builds one table exercising every optional block: bloom filter,
    /// range dels, range keys, and (columnar only) value blocks.
    fn build_full_table(dir: &std::path::Path, shape: Shape, name: &str) -> std::path::PathBuf {
        let mut opts = shape_opts(shape);
        opts.filter_policy = Some(Arc::new(BloomFilterPolicy::default()));
        if shape.columnar {
            opts.value_block_min_len = Some(40);
        }
        let path = dir.join(name);
        let mut w = SstWriter::new(&path, opts).unwrap();
        for i in 0..30u32 {
            let value = if i % 5 == 0 {
                vec![b'V'; 64]
            } else {
                format!("value_{i:04}").into_bytes()
            };
            w.add(&point(format!("key_{i:04}").as_bytes(), i as u64 + 1), &value)
                .unwrap();
        }
        w.add_range_del(Span {
            start: b"key_0005".to_vec(),
            end: b"key_0010".to_vec(),
            keys: vec![SpanKey {
                trailer: make_trailer(40, KeyKind::RangeDelete),
                suffix: Vec::new(),
                value: Vec::new(),
            }],
        })
        .unwrap();
        w.add_range_key(Span {
            start: b"key_0000".to_vec(),
            end: b"key_0020".to_vec(),
            keys: vec![SpanKey {
                trailer: make_trailer(41, KeyKind::RangeKeySet),
                suffix: Vec::new(),
                value: b"rk".to_vec(),
            }],
        })
        .unwrap();
        w.finish().unwrap();
        path
    }

    /// Every block in the layout, with whether a trailer follows it.
    fn all_blocks(layout: &Layout) -> Vec<(BlockHandle, bool)> {
        let mut blocks: Vec<(BlockHandle, bool)> = Vec::new();
        for hp in &layout.data {
            blocks.push((hp.handle, true));
        }
        for &bh in &layout.index {
            blocks.push((bh, true));
        }
        if let Some(bh) = layout.top_index {
            blocks.push((bh, true));
        }
        for nb in &layout.filter {
            blocks.push((nb.handle, true));
        }
        for &bh in &[layout.range_del, layout.range_key, layout.properties, layout.metaindex] {
            if bh.length > 0 {
                blocks.push((bh, true));
            }
        }
        for &bh in &layout.value_blocks {
            blocks.push((bh, true));
        }
        if layout.value_index.length > 0 {
            blocks.push((layout.value_index, true));
        }
        blocks.push((layout.footer, false));
        blocks
    }

    // ================================================================
    // 1. Layout partitions the file (universal property 7)
    // ================================================================

    /// # Scenario
    /// Enumerate the layout of a table carrying every optional block, in
    /// each shape.
    ///
    /// # Expected behavior
    /// Sorted by offset, the blocks tile the file exactly: each begins
    /// where the previous one (plus trailer) ended, and the footer ends
    /// at the file size.
    #[test]
    fn layout_partitions_the_file() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        for (i, shape) in ALL_SHAPES.iter().enumerate() {
            let path = build_full_table(tmp.path(), *shape, &format!("layout_{i}.sst"));
            let file_size = std::fs::metadata(&path).unwrap().len();
            let reader = open(&path).unwrap();
            let layout = reader.layout(&ReadContext::new()).unwrap();

            assert_eq!(layout.format, shape_format(*shape));
            assert_eq!(
                layout.data.len() as u64,
                reader.common_properties().num_data_blocks
            );
            assert!(layout.range_del.length > 0);
            assert!(layout.range_key.length > 0);
            assert_eq!(layout.filter.len(), 1);
            assert!(layout.filter[0].name.starts_with("fullfilter."));
            if shape.two_level {
                assert!(layout.top_index.is_some());
                assert_eq!(
                    layout.index.len() as u64,
                    reader.common_properties().index_partitions
                );
            } else {
                assert!(layout.top_index.is_none());
                assert_eq!(layout.index.len(), 1);
            }
            if shape.columnar {
                assert!(!layout.value_blocks.is_empty());
                assert!(layout.value_index.length > 0);
            }

            let mut blocks = all_blocks(&layout);
            blocks.sort_by_key(|(bh, _)| bh.offset);

            assert_eq!(blocks[0].0.offset, 0, "data starts the file");
            let mut end = 0u64;
            for (bh, trailered) in &blocks {
                assert_eq!(bh.offset, end, "blocks must tile without gaps ({shape:?})");
                end = bh.offset + bh.length + if *trailered { TRAILER_LEN } else { 0 };
            }
            assert_eq!(end, file_size, "layout must cover the whole file ({shape:?})");
            assert_eq!(layout.footer.length, FOOTER_SIZE as u64);
        }
    }

    // ================================================================
    // 2. Checksum validation passes on clean files (universal property 1)
    // ================================================================

    /// # Scenario
    /// Validate every block checksum of freshly written tables.
    ///
    /// # Expected behavior
    /// `validate_block_checksums` returns no error for any shape.
    #[test]
    fn validate_clean_files() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        for (i, shape) in ALL_SHAPES.iter().enumerate() {
            let path = build_full_table(tmp.path(), *shape, &format!("validate_{i}.sst"));
            let reader = open(&path).unwrap();
            reader
                .validate_block_checksums(&ReadContext::new())
                .unwrap_or_else(|e| panic!("validation failed for {shape:?}: {e}"));
        }
    }

    // ================================================================
    // 3. Data handles carry their property bytes
    // ================================================================

    /// # Scenario
    /// A V2 table whose every point is obsolete except in the last block.
    ///
    /// # Expected behavior
    /// Layout data handles expose the all-points-obsolete property bytes
    /// recorded by the writer.
    #[test]
    fn layout_exposes_block_properties() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("props_layout.sst");
        let mut opts = shape_opts(Shape { columnar: true, two_level: false });
        opts.block_size = 1; // one entry per block
        let mut w = SstWriter::new(&path, opts).unwrap();
        // Two versions of "a": the older lands in its own fully-obsolete
        // block. Then a live "b".
        w.add(&point(b"a", 9), b"new").unwrap();
        w.add(&point(b"a", 5), b"old").unwrap();
        w.add(&point(b"b", 2), b"live").unwrap();
        w.finish().unwrap();

        let reader = open(&path).unwrap();
        let layout = reader.layout(&ReadContext::new()).unwrap();
        assert_eq!(layout.data.len(), 3);
        assert!(layout.data[0].props.is_empty());
        assert_eq!(layout.data[1].props, vec![1u8]);
        assert!(layout.data[2].props.is_empty());
    }
}

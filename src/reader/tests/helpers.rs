//! Shared scaffolding for the reader tests: table construction across
//! every `{format} × {index shape}` combination, open helpers, and
//! iterator collection.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::fmt::Subscriber;

use crate::base::{InternalKey, KeyKind};
use crate::error::Result;
use crate::footer::TableFormat;
use crate::readable::{FileReadable, ReadContext};
use crate::reader::iter::SstIterator;
use crate::reader::{Reader, ReaderOptions};
use crate::writer::{SstWriter, WriterOptions};

pub(super) fn init_tracing() {
    let _ = Subscriber::builder()
        .with_max_level(Level::TRACE)
        .try_init();
}

/// A point `Set` entry.
pub(super) fn point(key: &[u8], seqnum: u64) -> InternalKey {
    InternalKey::new(key.to_vec(), seqnum, KeyKind::Set)
}

/// One table shape out of the four the reader must decode.
#[derive(Debug, Copy, Clone)]
pub(super) struct Shape {
    pub(super) columnar: bool,
    pub(super) two_level: bool,
}

/// Every `{row, columnar} × {single, two-level}` combination.
pub(super) const ALL_SHAPES: [Shape; 4] = [
    Shape { columnar: false, two_level: false },
    Shape { columnar: false, two_level: true },
    Shape { columnar: true, two_level: false },
    Shape { columnar: true, two_level: true },
];

/// Writer options for a shape, with a small block size so even small
/// tables span several blocks.
pub(super) fn shape_opts(shape: Shape) -> WriterOptions {
    let mut opts = if shape.columnar {
        WriterOptions::default()
    } else {
        WriterOptions::v1()
    };
    opts.block_size = 64;
    if shape.two_level {
        opts.index_partition_len = Some(3);
    }
    opts
}

/// Builds a table of `Set` entries at `dir/name`.
pub(super) fn build_table(
    dir: &Path,
    name: &str,
    opts: WriterOptions,
    entries: &[(InternalKey, Vec<u8>)],
) -> PathBuf {
    let path = dir.join(name);
    let mut w = SstWriter::new(&path, opts).expect("create writer");
    for (key, value) in entries {
        w.add(key, value).expect("add entry");
    }
    w.finish().expect("finish table");
    path
}

/// `count` entries `key_0000 → value_0000`, sequence numbers `1..=count`.
pub(super) fn numbered_entries(count: usize) -> Vec<(InternalKey, Vec<u8>)> {
    (0..count)
        .map(|i| {
            (
                point(format!("key_{i:04}").as_bytes(), i as u64 + 1),
                format!("value_{i:04}").into_bytes(),
            )
        })
        .collect()
}

pub(super) fn open(path: &Path) -> Result<Arc<Reader>> {
    open_with(path, ReaderOptions::default())
}

pub(super) fn open_with(path: &Path, options: ReaderOptions) -> Result<Arc<Reader>> {
    let readable = Box::new(FileReadable::open(path)?);
    Reader::new(&ReadContext::new(), readable, options)
}

/// Drains an iterator front to back, resolving lazy values.
pub(super) fn collect_forward(it: &mut dyn SstIterator) -> Vec<(Vec<u8>, u64, Vec<u8>)> {
    let rctx = ReadContext::new();
    let mut out = Vec::new();
    let mut entry = it.first().expect("first");
    while let Some((key, value)) = entry {
        out.push((
            key.user_key.clone(),
            key.seqnum(),
            value.get(&rctx).expect("fetch value").into_owned(),
        ));
        entry = it.next().expect("next");
    }
    out
}

/// Drains an iterator back to front, resolving lazy values.
pub(super) fn collect_backward(it: &mut dyn SstIterator) -> Vec<(Vec<u8>, u64, Vec<u8>)> {
    let rctx = ReadContext::new();
    let mut out = Vec::new();
    let mut entry = it.last().expect("last");
    while let Some((key, value)) = entry {
        out.push((
            key.user_key.clone(),
            key.seqnum(),
            value.get(&rctx).expect("fetch value").into_owned(),
        ));
        entry = it.prev().expect("prev");
    }
    out
}

/// The on-disk format a shape produces; used by assertions on
/// format-dependent behavior.
pub(super) fn shape_format(shape: Shape) -> TableFormat {
    if shape.columnar {
        TableFormat::V2
    } else {
        TableFormat::V1
    }
}

//! # Petra
//!
//! An **immutable**, **self-describing** sorted-string table (SSTable)
//! reader — the read side of a log-structured merge-tree storage engine —
//! with a companion builder for producing the files it reads.
//!
//! A table stores a sorted sequence of keyed records (point entries,
//! range deletions, and range keys) in individually checksummed,
//! optionally compressed blocks. The reader opens a file, verifies its
//! integrity, decodes its top-of-file metadata, and produces iterators
//! that yield internal keys and lazy values in comparator order — across
//! two on-disk generations (row-oriented V1 and column-oriented V2) and
//! both flat and two-level index trees.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                         Reader                             │
//! │  point iters · fragment iters · layout · checksums · usage │
//! └──────┬──────────────┬─────────────┬───────────────┬────────┘
//!        │              │             │               │
//!   ┌────▼────┐   ┌─────▼─────┐  ┌────▼─────┐   ┌─────▼──────┐
//!   │  Index  │   │   Data    │  │ Keyspan  │   │  Filter /  │
//!   │  iters  │   │   iters   │  │  iters   │   │  value blk │
//!   │ row/col │   │  row/col  │  │ row/col  │   │            │
//!   └────┬────┘   └─────┬─────┘  └────┬─────┘   └─────┬──────┘
//!        └──────────────┴───────┬─────┴───────────────┘
//!                        ┌──────▼───────┐
//!                        │ BlockReader  │  checksum · decompress ·
//!                        │ cache · pool │  metadata init · refcount
//!                        └──────┬───────┘
//!                        ┌──────▼───────┐
//!                        │   Readable   │  pread / mmap
//!                        └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`base`] | Internal keys, comparators, mergers, name registries |
//! | [`readable`] | Byte-random-access file abstraction and cancellation |
//! | [`block`] | Handles, trailers, checksums, compression, block reader, cache |
//! | [`footer`] | Table formats and the fixed-size footer |
//! | [`properties`] | File-level statistics and configuration names |
//! | [`filter`] | Filter policies and the full-filter probe |
//! | [`rowblk`] | Row-oriented block encoding and iterators |
//! | [`colblk`] | Column-oriented block encoding, key schemas, iterators |
//! | [`keyspan`] | Range-del / range-key fragments and their iterators |
//! | [`valblk`] | Value blocks, lazy values, reader providers |
//! | [`reader`] | The reader facade and composed point iterators |
//! | [`writer`] | The companion table builder |
//!
//! ## Guarantees
//!
//! - **Integrity:** every block read verifies its trailer checksum before
//!   the buffer is exposed; flipping any byte of any block is detected.
//! - **Immutability:** loaded blocks are shared read-only; metadata is
//!   derived once per buffer and reused by every iterator.
//! - **Lifecycle:** a reader is `Open` until it is `Closed` or an error
//!   latches it `Failed`; both terminal states are permanent, and live
//!   iterators observe them on their next operation.
//! - **Name binding:** the comparator, merger, and key schema recorded in
//!   a file must resolve against the configuration or the file refuses to
//!   open.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use petra::base::{InternalKey, KeyKind};
//! use petra::iterator::IterTransforms;
//! use petra::readable::{FileReadable, ReadContext};
//! use petra::reader::iter::SstIterator;
//! use petra::reader::{Reader, ReaderOptions};
//! use petra::writer::{SstWriter, WriterOptions};
//!
//! // Build a table.
//! let mut w = SstWriter::new("/tmp/example.sst", WriterOptions::default()).unwrap();
//! w.add(&InternalKey::new(b"a".to_vec(), 1, KeyKind::Set), b"1").unwrap();
//! w.add(&InternalKey::new(b"b".to_vec(), 2, KeyKind::Set), b"2").unwrap();
//! w.finish().unwrap();
//!
//! // Read it back.
//! let readable = Box::new(FileReadable::open("/tmp/example.sst").unwrap());
//! let reader = Reader::new(&ReadContext::new(), readable, ReaderOptions::default()).unwrap();
//! let mut it = reader.new_iter(IterTransforms::none(), None, None).unwrap();
//! let mut entry = it.first().unwrap();
//! while let Some((key, value)) = entry {
//!     println!("{:?} => {} bytes", key.user_key, value.len());
//!     entry = it.next().unwrap();
//! }
//! reader.close().unwrap();
//! ```

pub mod base;
pub mod block;
pub mod colblk;
pub mod error;
pub mod filter;
pub mod footer;
pub mod iterator;
pub mod keyspan;
pub mod properties;
pub mod readable;
pub mod reader;
pub mod rowblk;
pub mod valblk;
pub mod writer;

pub use error::{Result, SstError};

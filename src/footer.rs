//! Table formats and the fixed-size footer.
//!
//! The footer anchors discovery of every other block. It is the last
//! [`FOOTER_SIZE`] bytes of the file:
//!
//! ```text
//! [MAGIC 4B][FORMAT 1B][CHECKSUM_KIND 1B][METAINDEX 16B][INDEX 16B][CRC32 4B]
//! ```
//!
//! All fields are bincode fixed-int encoded; the trailing CRC32 covers
//! every preceding footer byte. The format byte selects the table format,
//! which in turn decides whether blocks are row- or column-oriented and
//! which auxiliary blocks may exist.

use crate::base::wire_config;
use crate::block::{BlockHandle, ChecksumKind};
use crate::error::{Result, SstError};
use crate::readable::{ReadContext, ReadHandle};

/// Magic bytes identifying a table file.
pub const FOOTER_MAGIC: [u8; 4] = *b"PTRA";

/// Encoded footer length. Fixed for every format version.
pub const FOOTER_SIZE: usize = 42;

// ------------------------------------------------------------------------------------------------
// Table format
// ------------------------------------------------------------------------------------------------

/// Versioned on-disk layout discriminator carried in the footer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TableFormat {
    /// Row-oriented blocks. No value blocks, no obsolete-point markers.
    V1 = 1,

    /// Column-oriented blocks with precomputed block metadata. Adds value
    /// blocks and obsolete-point markers.
    V2 = 2,
}

impl Default for TableFormat {
    fn default() -> TableFormat {
        TableFormat::V1
    }
}

impl TableFormat {
    /// Decodes a format byte. Unknown bytes are corruption.
    pub fn from_u8(v: u8) -> Result<TableFormat> {
        match v {
            1 => Ok(TableFormat::V1),
            2 => Ok(TableFormat::V2),
            _ => Err(SstError::Corruption(format!(
                "unknown table format {v}"
            ))),
        }
    }

    /// Whether blocks in this format are column-oriented.
    pub fn block_columnar(self) -> bool {
        matches!(self, TableFormat::V2)
    }

    /// Whether this format may store values in separate value blocks.
    pub fn supports_value_blocks(self) -> bool {
        matches!(self, TableFormat::V2)
    }

    /// Whether this format marks shadowed points obsolete, enabling the
    /// hide-obsolete-points iterator transform.
    pub fn supports_obsolete_hiding(self) -> bool {
        matches!(self, TableFormat::V2)
    }
}

// ------------------------------------------------------------------------------------------------
// Footer
// ------------------------------------------------------------------------------------------------

/// Decoded footer: format, checksum kind, and the two anchor handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footer {
    /// Table format the file was written with.
    pub format: TableFormat,

    /// Checksum function used by every block trailer in this file.
    pub checksum: ChecksumKind,

    /// Handle of the metaindex block.
    pub metaindex: BlockHandle,

    /// Handle of the top-level index block.
    pub index: BlockHandle,

    /// Placement of the footer itself, for layout enumeration.
    pub footer_handle: BlockHandle,
}

/// Raw wire form of the footer.
#[derive(bincode::Encode, bincode::Decode)]
struct FooterWire {
    magic: [u8; 4],
    format: u8,
    checksum_kind: u8,
    metaindex: BlockHandle,
    index: BlockHandle,
    footer_crc32: u32,
}

impl Footer {
    /// Encodes a footer for the given fields. Writer-side only.
    pub fn encode(
        format: TableFormat,
        checksum: ChecksumKind,
        metaindex: BlockHandle,
        index: BlockHandle,
    ) -> Result<Vec<u8>> {
        let mut wire = FooterWire {
            magic: FOOTER_MAGIC,
            format: format as u8,
            checksum_kind: checksum as u8,
            metaindex,
            index,
            footer_crc32: 0,
        };
        let without_crc = bincode::encode_to_vec(&wire, wire_config())?;
        wire.footer_crc32 = ChecksumKind::Crc32.checksum(&without_crc[..FOOTER_SIZE - 4]);
        let bytes = bincode::encode_to_vec(&wire, wire_config())?;
        debug_assert_eq!(bytes.len(), FOOTER_SIZE);
        Ok(bytes)
    }

    /// Decodes footer bytes located at `offset` within the file.
    pub fn decode(data: &[u8], offset: u64) -> Result<Footer> {
        if data.len() != FOOTER_SIZE {
            return Err(SstError::Corruption(format!(
                "footer must be {FOOTER_SIZE} bytes, got {}",
                data.len()
            )));
        }
        let (wire, _) = bincode::decode_from_slice::<FooterWire, _>(data, wire_config())?;
        if wire.magic != FOOTER_MAGIC {
            return Err(SstError::Corruption("bad footer magic".into()));
        }
        let computed = ChecksumKind::Crc32.checksum(&data[..FOOTER_SIZE - 4]);
        if computed != wire.footer_crc32 {
            return Err(SstError::ChecksumMismatch);
        }
        Ok(Footer {
            format: TableFormat::from_u8(wire.format)?,
            checksum: ChecksumKind::from_u8(wire.checksum_kind)?,
            metaindex: wire.metaindex,
            index: wire.index,
            footer_handle: BlockHandle::new(offset, FOOTER_SIZE as u64),
        })
    }
}

/// Reads and decodes the footer from the tail of the file.
pub fn read_footer(rctx: &ReadContext, rh: &ReadHandle, file_size: u64) -> Result<Footer> {
    if file_size < FOOTER_SIZE as u64 {
        return Err(SstError::Corruption(format!(
            "file size {file_size} is smaller than the footer"
        )));
    }
    let offset = file_size - FOOTER_SIZE as u64;
    let mut buf = [0u8; FOOTER_SIZE];
    rh.read_at(rctx, &mut buf, offset)?;
    Footer::decode(&buf, offset)
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_footer_has_fixed_size() {
        let bytes = Footer::encode(
            TableFormat::V1,
            ChecksumKind::Crc32,
            BlockHandle::new(100, 50),
            BlockHandle::new(200, 80),
        )
        .unwrap();
        assert_eq!(bytes.len(), FOOTER_SIZE);
    }

    #[test]
    fn round_trip_both_formats() {
        for (format, checksum) in [
            (TableFormat::V1, ChecksumKind::Crc32),
            (TableFormat::V2, ChecksumKind::XxHash64),
        ] {
            let bytes = Footer::encode(
                format,
                checksum,
                BlockHandle::new(10, 20),
                BlockHandle::new(30, 40),
            )
            .unwrap();
            let footer = Footer::decode(&bytes, 4096).unwrap();
            assert_eq!(footer.format, format);
            assert_eq!(footer.checksum, checksum);
            assert_eq!(footer.metaindex, BlockHandle::new(10, 20));
            assert_eq!(footer.index, BlockHandle::new(30, 40));
            assert_eq!(footer.footer_handle, BlockHandle::new(4096, FOOTER_SIZE as u64));
        }
    }

    #[test]
    fn bad_magic_is_corruption() {
        let mut bytes = Footer::encode(
            TableFormat::V1,
            ChecksumKind::Crc32,
            BlockHandle::default(),
            BlockHandle::default(),
        )
        .unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            Footer::decode(&bytes, 0),
            Err(SstError::Corruption(_))
        ));
    }

    #[test]
    fn crc_flip_is_checksum_mismatch() {
        let mut bytes = Footer::encode(
            TableFormat::V2,
            ChecksumKind::XxHash64,
            BlockHandle::new(1, 2),
            BlockHandle::new(3, 4),
        )
        .unwrap();
        bytes[7] ^= 0xff; // inside the metaindex handle
        assert!(matches!(
            Footer::decode(&bytes, 0),
            Err(SstError::ChecksumMismatch)
        ));
    }

    #[test]
    fn unknown_format_byte_rejected() {
        let mut bytes = Footer::encode(
            TableFormat::V1,
            ChecksumKind::Crc32,
            BlockHandle::default(),
            BlockHandle::default(),
        )
        .unwrap();
        bytes[4] = 99;
        // Fix up the CRC so the format check itself is what fires.
        let crc = ChecksumKind::Crc32.checksum(&bytes[..FOOTER_SIZE - 4]);
        bytes[FOOTER_SIZE - 4..].copy_from_slice(&crc.to_le_bytes());
        assert!(matches!(
            Footer::decode(&bytes, 0),
            Err(SstError::Corruption(_))
        ));
    }
}

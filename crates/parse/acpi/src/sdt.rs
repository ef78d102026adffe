//! System Description Table (SDT) header layout and checksum utilities.
//!
//! Every ACPI table starts with the same 36-byte header. The mutation
//! engine addresses header fields by byte offset so it can read and patch
//! tables of any alignment; [`SdtHeader`] is a parsed snapshot used where a
//! whole-header view is more convenient than individual field reads.

use muon_binparse::{FromBytes, IntoBytes};

use crate::sig::{OemTableId, Signature};

/// Size in bytes of the shared `(signature, length)` prefix every table
/// carries, the minimum a buffer must hold before any field is trusted.
pub const COMMON_HEADER_SIZE: usize = 8;

/// Byte offset of the table length field.
pub const LENGTH_OFFSET: usize = 4;
/// Byte offset of the checksum field.
pub const CHECKSUM_OFFSET: usize = 9;
/// Byte offset of the 6-byte OEM id field.
pub const OEM_ID_OFFSET: usize = 10;
/// Byte offset of the 8-byte OEM table id field.
pub const OEM_TABLE_ID_OFFSET: usize = 16;

/// Parsed snapshot of a standard ACPI table header.
#[derive(Debug, Clone, Copy)]
pub struct SdtHeader {
    /// 4-byte ASCII signature identifying the table type.
    pub signature: Signature,
    /// Total length of the table, including the header, in bytes.
    pub length: u32,
    /// Revision of the table structure.
    pub revision: u8,
    /// Checksum byte. The entire table must sum to zero.
    pub checksum: u8,
    /// OEM-supplied identification string.
    pub oem_id: [u8; 6],
    /// OEM-supplied table identification string.
    pub oem_table_id: OemTableId,
}

impl SdtHeader {
    /// The size of an SDT header in bytes.
    pub const SIZE: usize = 36;

    /// Read a header snapshot from the start of `data`.
    ///
    /// Returns `None` if `data` is shorter than [`SdtHeader::SIZE`].
    #[must_use]
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            signature: Signature::from_bytes(data)?,
            length: u32::read_at(data, LENGTH_OFFSET)?,
            revision: u8::read_at(data, 8)?,
            checksum: u8::read_at(data, CHECKSUM_OFFSET)?,
            oem_id: <[u8; 6]>::read_at(data, OEM_ID_OFFSET)?,
            oem_table_id: OemTableId(<[u8; 8]>::read_at(data, OEM_TABLE_ID_OFFSET)?),
        })
    }
}

/// Additive 8-bit checksum of `data`.
///
/// A correctly checksummed table sums to zero mod 256.
#[must_use]
pub fn checksum8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

/// Returns `true` when `data` carries a valid additive checksum.
#[must_use]
pub fn validate_checksum(data: &[u8]) -> bool {
    checksum8(data) == 0
}

/// Recompute the checksum byte at `checksum_offset` so that `data` sums to
/// zero.
///
/// Does nothing if `checksum_offset` lies outside `data`.
pub fn update_checksum(data: &mut [u8], checksum_offset: usize) {
    if checksum_offset >= data.len() {
        return;
    }
    data[checksum_offset] = 0;
    let sum = checksum8(data);
    let _ = 0u8.wrapping_sub(sum).write_at(data, checksum_offset);
}

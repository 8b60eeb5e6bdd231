//! Boot firmware table layout.
//!
//! The SAN drive is described to the booted operating system through an
//! ACPI-style table (the sBFT) carrying a SCSI sub-table (logical unit)
//! and an SRP sub-table (initiator and target port IDs). The protocol
//! layer fills the sub-tables; the firmware emulator owns the reserved
//! buffer, the OEM identity fields, and the final checksum.

use core::ops::Range;

/// Table signature.
pub const SBFT_SIG: [u8; 4] = *b"sBFT";

/// ACPI description header length.
pub const ACPI_HEADER_LEN: usize = 36;

/// Signature field.
pub const SIGNATURE: Range<usize> = 0..4;
/// Table length field (little-endian).
pub const LENGTH: Range<usize> = 4..8;
/// Revision field.
pub const REVISION: usize = 8;
/// Checksum field.
pub const CHECKSUM: usize = 9;
/// OEM ID field.
pub const OEM_ID: Range<usize> = 10..16;
/// OEM table ID field.
pub const OEM_TABLE_ID: Range<usize> = 16..24;
/// OEM revision field (little-endian).
pub const OEM_REVISION: Range<usize> = 24..28;
/// Creator ID field.
pub const CREATOR_ID: Range<usize> = 28..32;
/// Creator revision field (little-endian).
pub const CREATOR_REVISION: Range<usize> = 32..36;

/// SCSI sub-table offset field (little-endian).
pub const SCSI_OFFSET: Range<usize> = 36..38;
/// SRP sub-table offset field (little-endian).
pub const SRP_OFFSET: Range<usize> = 38..40;

/// SCSI sub-table position: an 8-byte logical unit number.
pub const SCSI_SUBTABLE: usize = 48;
/// SRP sub-table position: 16-byte initiator and target port IDs.
pub const SRP_SUBTABLE: usize = 56;

/// Total table length.
pub const SBFT_LEN: usize = SRP_SUBTABLE + 32;

/// Size of the reserved, 16-byte-aligned table buffer.
pub const SBFT_BUFFER_LEN: usize = 768;

/// Declared length of a table, bounded by the buffer that holds it.
pub fn table_length(table: &[u8]) -> usize {
    if table.len() < ACPI_HEADER_LEN {
        return table.len();
    }
    let length = u32::from_le_bytes(table[LENGTH].try_into().unwrap()) as usize;
    length.min(table.len())
}

/// Fix up the header checksum.
///
/// The checksum byte is chosen so that the sum of every byte in the
/// table equals zero modulo 256.
pub fn fix_checksum(table: &mut [u8]) {
    if table.len() < ACPI_HEADER_LEN {
        return;
    }
    table[CHECKSUM] = 0;
    let length = table_length(table);
    let sum = table[..length]
        .iter()
        .fold(0u8, |sum, byte| sum.wrapping_add(*byte));
    table[CHECKSUM] = sum.wrapping_neg();
}

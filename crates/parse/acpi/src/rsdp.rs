//! Root System Description Pointer (RSDP) layout and discovery.
//!
//! The RSDP is found through the firmware configuration table list,
//! preferring an ACPI 2.0+ entry over a 1.0 one, and falling back to the
//! legacy physical memory scan (the 0xE0000–0xFFFFF BIOS window and the
//! EBDA) when the configuration tables carry no ACPI entry at all.

use muon_binparse::FromBytes;

use crate::sig;
use crate::{AcpiError, AcpiPlatform, Guid};

/// Byte offset of the 8-byte `RSD PTR ` signature.
pub const SIGNATURE_OFFSET: usize = 0;
/// Byte offset of the ACPI 1.0 checksum, covering the first 20 bytes.
pub const CHECKSUM_OFFSET: usize = 8;
/// Byte offset of the revision field.
pub const REVISION_OFFSET: usize = 15;
/// Byte offset of the 32-bit RSDT address.
pub const RSDT_ADDRESS_OFFSET: usize = 16;
/// Byte offset of the structure length (ACPI 2.0+).
pub const LENGTH_OFFSET: usize = 20;
/// Byte offset of the 64-bit XSDT address (ACPI 2.0+).
pub const XSDT_ADDRESS_OFFSET: usize = 24;
/// Byte offset of the extended checksum, covering `length` bytes
/// (ACPI 2.0+).
pub const EXTENDED_CHECKSUM_OFFSET: usize = 32;

/// Size of the ACPI 1.0 RSDP, and the range of its first checksum.
pub const V1_SIZE: usize = 20;
/// Size of the ACPI 2.0+ RSDP.
pub const V2_SIZE: usize = 36;

/// Base of the BIOS read-only window scanned for a legacy RSDP.
const BIOS_SCAN_BASE: u64 = 0xE0000;
/// Length of the BIOS scan window.
const BIOS_SCAN_LEN: usize = 0x20000;
/// Physical address of the real-mode pointer to the EBDA segment.
const EBDA_POINTER: u64 = 0x40E;
/// Length of the EBDA window scanned for a legacy RSDP.
const EBDA_SCAN_LEN: usize = 0x400;
/// The RSDP is always 16-byte aligned.
const RSDP_ALIGN: usize = 16;

/// Locate the RSDP.
///
/// Scans the platform's configuration table list first: an ACPI 2.0 entry
/// wins immediately, while a 1.0 entry is remembered and the scan
/// continues in case a 2.0 entry follows. If the list has neither, the
/// legacy memory windows are searched for the 8-byte signature.
///
/// # Errors
///
/// Returns [`AcpiError::NotFound`] if no RSDP exists anywhere.
pub fn find_rsdp(platform: &impl AcpiPlatform) -> Result<u64, AcpiError> {
    let mut rsdp = None;

    for entry in platform.configuration_tables() {
        if entry.vendor_guid == Guid::ACPI_20_TABLE {
            log::debug!("found ACPI 2.0 RSDP at {:#x}", entry.address);
            return Ok(entry.address);
        }

        // Use ACPI 1.0 if present, but keep looking for a 2.0 entry.
        if entry.vendor_guid == Guid::ACPI_10_TABLE {
            log::debug!("found ACPI 1.0 RSDP at {:#x}", entry.address);
            rsdp = Some(entry.address);
        }
    }

    if rsdp.is_none() {
        rsdp = find_legacy_rsdp(platform);
        if let Some(address) = rsdp {
            log::debug!("found legacy RSDP at {address:#x}");
        }
    }

    rsdp.ok_or_else(|| {
        log::warn!("failed to find ACPI RSDP");
        AcpiError::NotFound
    })
}

/// Scan the legacy physical memory windows for the RSDP signature.
fn find_legacy_rsdp(platform: &impl AcpiPlatform) -> Option<u64> {
    // SAFETY: the BIOS window is always mapped on legacy platforms; the
    // scan stays within the mapped length.
    let window = unsafe {
        let ptr = platform.map_physical(BIOS_SCAN_BASE, BIOS_SCAN_LEN);
        core::slice::from_raw_parts(ptr, BIOS_SCAN_LEN)
    };

    let mut rsdp = None;
    for offset in (0..=BIOS_SCAN_LEN - sig::RSDP.len()).step_by(RSDP_ALIGN) {
        if window[offset..offset + sig::RSDP.len()] == sig::RSDP {
            rsdp = Some(BIOS_SCAN_BASE + offset as u64);
        }
    }

    if rsdp.is_some() {
        return rsdp;
    }

    // The EBDA segment address lives in the BIOS data area.
    // SAFETY: the BIOS data area and EBDA are identity mapped; reads stay
    // within the mapped lengths.
    unsafe {
        let ptr = platform.map_physical(EBDA_POINTER, 2);
        let segment = u16::read_from(core::slice::from_raw_parts(ptr, 2))?;
        let base = u64::from(segment) << 4;
        if base == 0 {
            return None;
        }

        let ptr = platform.map_physical(base, EBDA_SCAN_LEN);
        let window = core::slice::from_raw_parts(ptr, EBDA_SCAN_LEN);
        for offset in (0..=EBDA_SCAN_LEN - sig::RSDP.len()).step_by(RSDP_ALIGN) {
            if window[offset..offset + sig::RSDP.len()] == sig::RSDP {
                return Some(base + offset as u64);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::TestPlatform;
    use crate::ConfigurationTable;

    #[test]
    fn prefers_acpi_20_configuration_entry() {
        let platform = TestPlatform::new(vec![
            ConfigurationTable {
                vendor_guid: Guid::ACPI_10_TABLE,
                address: 0x1000,
            },
            ConfigurationTable {
                vendor_guid: Guid::ACPI_20_TABLE,
                address: 0x2000,
            },
        ]);
        assert_eq!(find_rsdp(&platform), Ok(0x2000));
    }

    #[test]
    fn falls_back_to_acpi_10_entry() {
        let platform = TestPlatform::new(vec![ConfigurationTable {
            vendor_guid: Guid::ACPI_10_TABLE,
            address: 0x1000,
        }]);
        assert_eq!(find_rsdp(&platform), Ok(0x1000));
    }

    #[test]
    fn bios_window_scan_keeps_last_match() {
        let platform = TestPlatform::new(Vec::new());
        platform.write_low(BIOS_SCAN_BASE, &sig::RSDP);
        platform.write_low(BIOS_SCAN_BASE + 0x100, &sig::RSDP);
        assert_eq!(find_rsdp(&platform), Ok(BIOS_SCAN_BASE + 0x100));
    }

    #[test]
    fn ebda_scan_finds_signature() {
        let platform = TestPlatform::new(Vec::new());
        // EBDA segment 0x9FC0 puts the area at 0x9FC00.
        platform.write_low(EBDA_POINTER, &0x9FC0u16.to_le_bytes());
        platform.write_low(0x9FC00 + 32, &sig::RSDP);
        assert_eq!(find_rsdp(&platform), Ok(0x9FC00 + 32));
    }

    #[test]
    fn nothing_found_is_not_found() {
        let platform = TestPlatform::new(Vec::new());
        assert_eq!(find_rsdp(&platform), Err(AcpiError::NotFound));
    }
}

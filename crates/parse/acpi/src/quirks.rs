//! Firmware quirk fixups.
//!
//! Four table-level workarounds for firmware habits that get in the way
//! of a clean boot handoff: a missing or disabled FADT reset register,
//! a stale FACS hardware signature (which makes some firmware resume
//! from a hibernation image it should discard), a BGRT that claims the
//! boot logo is already displayed, and root/FADT OEM ids that disagree
//! with the licensing table some activation schemes key off.

use muon_binparse::{FromBytes, IntoBytes};

use crate::fadt::{self, gas, FadtFlags};
use crate::sdt::{self, SdtHeader};
use crate::sig::{self, Signature};
use crate::{size_to_pages, AcpiContext, AcpiError, AcpiPlatform};

/// Byte offset of the FACS hardware signature.
const FACS_HARDWARE_SIGNATURE_OFFSET: usize = 8;
/// Fewest FACS bytes covering the hardware signature.
const FACS_MIN_LENGTH: usize = FACS_HARDWARE_SIGNATURE_OFFSET + 4;

/// Byte offset of the BGRT status byte.
const BGRT_STATUS_OFFSET: usize = 38;
/// BGRT status bit: the image has been displayed.
const BGRT_STATUS_DISPLAYED: u8 = 1;

/// I/O port of the default x86 reset register.
const RESET_PORT: u64 = 0xCF9;
/// Value written to the default reset register to reset.
const RESET_VALUE: u8 = 6;

impl<P: AcpiPlatform> AcpiContext<P> {
    /// Make the FADT advertise a usable reset register.
    ///
    /// A FADT too short to hold the reset register block is copied into
    /// an enlarged, zero-extended allocation first. The reset-supported
    /// and sleep-button flags are set, the power-button flag cleared,
    /// and a zero reset register is filled in with the standard 0xCF9
    /// I/O port. A FADT that already advertises a nonzero reset
    /// register is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`AcpiError::NotFound`] without a FADT, and allocation
    /// errors from copy-on-write.
    pub fn fadt_enable_reset(&mut self) -> Result<(), AcpiError> {
        let address = self.fadt.ok_or(AcpiError::NotFound)?;
        let length = self.table_length(address);

        if length >= fadt::RESET_MIN_LENGTH {
            // SAFETY: the FADT address refers to a discovered table.
            let data = unsafe { self.table_bytes(address) };
            let flags =
                FadtFlags::from_bits_retain(u32::read_at(data, fadt::FLAGS_OFFSET).unwrap_or(0));
            let reset_address =
                u64::read_at(data, fadt::RESET_REG_OFFSET + gas::ADDRESS).unwrap_or(0);
            if flags.contains(FadtFlags::RESET_REG_SUP) && reset_address != 0 {
                return Ok(());
            }
            self.ensure_fadt_writable()?;
        } else {
            log::debug!("FADT of {length} bytes lacks a reset register, enlarging");
            self.allocate_copy_fadt(Some(fadt::RESET_MIN_LENGTH as u32))?;
        }

        let address = self.fadt.ok_or(AcpiError::NotFound)?;
        // SAFETY: the FADT is writable after the block above.
        let data = unsafe { self.table_bytes_mut(address) };

        let mut flags =
            FadtFlags::from_bits_retain(u32::read_at(data, fadt::FLAGS_OFFSET).unwrap_or(0));
        flags.insert(FadtFlags::RESET_REG_SUP | FadtFlags::SLP_BUTTON);
        flags.remove(FadtFlags::PWR_BUTTON);
        let _ = flags.bits().write_at(data, fadt::FLAGS_OFFSET);

        let reset_address = u64::read_at(data, fadt::RESET_REG_OFFSET + gas::ADDRESS).unwrap_or(0);
        if reset_address == 0 {
            data[fadt::RESET_REG_OFFSET + gas::ADDRESS_SPACE_ID] = gas::SPACE_SYSTEM_IO;
            data[fadt::RESET_REG_OFFSET + gas::REGISTER_BIT_WIDTH] = 8;
            data[fadt::RESET_REG_OFFSET + gas::REGISTER_BIT_OFFSET] = 0;
            data[fadt::RESET_REG_OFFSET + gas::ACCESS_SIZE] = gas::ACCESS_BYTE;
            let _ = RESET_PORT.write_at(data, fadt::RESET_REG_OFFSET + gas::ADDRESS);
            data[fadt::RESET_VALUE_OFFSET] = RESET_VALUE;
            log::debug!("installed default reset register at port {RESET_PORT:#x}");
        }

        sdt::update_checksum(data, sdt::CHECKSUM_OFFSET);
        Ok(())
    }

    /// Zero the FACS hardware signature so firmware discards any stale
    /// hibernation image on the next boot.
    ///
    /// The FACS is reached through the FADT's 64-bit pointer when
    /// present, the 32-bit one otherwise. A missing or too-short FACS
    /// is skipped silently. A read-only FACS is copied and the FADT's
    /// pointers rewired; the FACS itself carries no checksum.
    ///
    /// # Errors
    ///
    /// Returns [`AcpiError::NotFound`] without a FADT, and allocation
    /// errors from copy-on-write.
    pub fn reset_hardware_signature(&mut self) -> Result<(), AcpiError> {
        let fadt_addr = self.fadt.ok_or(AcpiError::NotFound)?;
        // SAFETY: the FADT address refers to a discovered table.
        let data = unsafe { self.table_bytes(fadt_addr) };

        let mut facs = 0u64;
        if data.len() >= fadt::X_FIRMWARE_CTRL_MIN_LENGTH {
            facs = u64::read_at(data, fadt::X_FIRMWARE_CTRL_OFFSET).unwrap_or(0);
        }
        if facs == 0 {
            facs = u32::read_at(data, fadt::FIRMWARE_CTRL_OFFSET).map_or(0, u64::from);
        }
        if facs == 0 {
            log::debug!("FADT references no FACS");
            return Ok(());
        }

        // SAFETY: the FADT's FACS pointer refers to a mapped structure;
        // its length field sits at the same offset as an SDT's.
        let facs_data = unsafe { self.table_bytes(facs) };
        if facs_data.len() < FACS_MIN_LENGTH {
            log::debug!("FACS of {} bytes is too short", facs_data.len());
            return Ok(());
        }
        if u32::read_at(facs_data, FACS_HARDWARE_SIGNATURE_OFFSET) == Some(0) {
            return Ok(());
        }

        let mut target = facs;
        if !self.probe_writable(facs) {
            let length = facs_data.len();
            let pages = size_to_pages(length);
            let copy = self.allocate_copy(facs, length)?;
            if let Err(error) = self.ensure_fadt_writable() {
                self.platform.free_pages(copy, pages);
                return Err(error);
            }
            let fadt_addr = self.fadt.ok_or(AcpiError::NotFound)?;
            // SAFETY: ensure_fadt_writable left the FADT writable.
            let fadt_data = unsafe { self.table_bytes_mut(fadt_addr) };
            let _ = (copy as u32).write_at(fadt_data, fadt::FIRMWARE_CTRL_OFFSET);
            if fadt_data.len() >= fadt::X_FIRMWARE_CTRL_MIN_LENGTH {
                let _ = copy.write_at(fadt_data, fadt::X_FIRMWARE_CTRL_OFFSET);
            }
            sdt::update_checksum(fadt_data, sdt::CHECKSUM_OFFSET);
            log::debug!("copied read-only FACS at {facs:#x} to {copy:#x}");
            target = copy;
        }

        // SAFETY: `target` is writable per the probe or the copy above.
        let facs_data = unsafe { self.table_bytes_mut(target) };
        let _ = 0u32.write_at(facs_data, FACS_HARDWARE_SIGNATURE_OFFSET);
        log::debug!("cleared FACS hardware signature");
        Ok(())
    }

    /// Clear the BGRT displayed bit so firmware draws the boot logo
    /// again.
    ///
    /// # Errors
    ///
    /// Returns [`AcpiError::NotFound`] without a BGRT in the working
    /// set, and allocation errors from copy-on-write.
    pub fn reset_logo_status(&mut self) -> Result<(), AcpiError> {
        let index = (0..self.tables.len())
            .find(|&index| {
                // SAFETY: working set entries are mapped tables.
                let data = unsafe { self.table_bytes(self.tables[index].address) };
                Signature::from_bytes(data) == Some(sig::BGRT)
            })
            .ok_or(AcpiError::NotFound)?;

        // SAFETY: working set entries are mapped tables.
        let data = unsafe { self.table_bytes(self.tables[index].address) };
        if data.len() <= BGRT_STATUS_OFFSET {
            log::warn!("BGRT of {} bytes is too short", data.len());
            return Ok(());
        }
        if data[BGRT_STATUS_OFFSET] & BGRT_STATUS_DISPLAYED == 0 {
            return Ok(());
        }

        self.ensure_table_writable(index)?;
        // SAFETY: ensure_table_writable left the table writable.
        let data = unsafe { self.table_bytes_mut(self.tables[index].address) };
        data[BGRT_STATUS_OFFSET] &= !BGRT_STATUS_DISPLAYED;
        sdt::update_checksum(data, sdt::CHECKSUM_OFFSET);
        log::debug!("cleared BGRT displayed status");
        Ok(())
    }

    /// Copy the licensing table's OEM ids into the root tables and the
    /// FADT.
    ///
    /// Windows activation on some OEM machines checks that the SLIC's
    /// OEM id and OEM table id reappear in the RSDT/XSDT headers.
    /// Read-only root tables are skipped with a warning; the FADT is
    /// copy-on-write allocated as usual. [`AcpiContext::apply`] copies
    /// the current root header into the rebuilt roots, so sync before
    /// committing for the ids to reach them.
    ///
    /// # Errors
    ///
    /// Returns [`AcpiError::NotFound`] without a SLIC in the working
    /// set, and allocation errors from copy-on-write.
    pub fn sync_table_ids(&mut self) -> Result<(), AcpiError> {
        let slic = self
            .tables
            .iter()
            .map(|entry| entry.address)
            .find(|&address| {
                // SAFETY: working set entries are mapped tables.
                let data = unsafe { self.table_bytes(address) };
                Signature::from_bytes(data) == Some(sig::SLIC)
            })
            .ok_or(AcpiError::NotFound)?;

        // SAFETY: working set entries are mapped tables.
        let slic_data = unsafe { self.table_bytes(slic) };
        let (Some(oem_id), Some(oem_table_id)) = (
            <[u8; 6]>::read_at(slic_data, sdt::OEM_ID_OFFSET),
            <[u8; 8]>::read_at(slic_data, sdt::OEM_TABLE_ID_OFFSET),
        ) else {
            log::warn!("SLIC of {} bytes is too short", slic_data.len());
            return Ok(());
        };

        for root in [self.rsdt, self.xsdt].into_iter().flatten() {
            // Root tables are not part of the copy-on-write set. A
            // commit copies the current root header into the rebuilt
            // roots, so ids written here carry over, while a skipped
            // read-only root keeps its old ids even after a commit.
            if !self.probe_writable(root) {
                log::warn!("root table at {root:#x} is read-only, skipping id sync");
                continue;
            }
            // SAFETY: the probe above confirmed writability.
            let data = unsafe { self.table_bytes_mut(root) };
            if data.len() < SdtHeader::SIZE {
                continue;
            }
            let _ = oem_id.write_at(data, sdt::OEM_ID_OFFSET);
            let _ = oem_table_id.write_at(data, sdt::OEM_TABLE_ID_OFFSET);
            sdt::update_checksum(data, sdt::CHECKSUM_OFFSET);
        }

        if self.fadt.is_some() {
            self.ensure_fadt_writable()?;
            let address = self.fadt.ok_or(AcpiError::NotFound)?;
            // SAFETY: ensure_fadt_writable left the FADT writable.
            let data = unsafe { self.table_bytes_mut(address) };
            if data.len() >= SdtHeader::SIZE {
                let _ = oem_id.write_at(data, sdt::OEM_ID_OFFSET);
                let _ = oem_table_id.write_at(data, sdt::OEM_TABLE_ID_OFFSET);
                sdt::update_checksum(data, sdt::CHECKSUM_OFFSET);
            }
        }

        log::debug!("synchronized OEM ids from SLIC");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::{
        build_machine, build_machine_at, leak_bytes, make_fadt, make_table, read_back,
    };
    use crate::AcpiContext;

    fn make_facs(hardware_signature: u32) -> Vec<u8> {
        let mut data = vec![0u8; 64];
        data[..4].copy_from_slice(b"FACS");
        let _ = 64u32.write_at(&mut data, sdt::LENGTH_OFFSET);
        let _ = hardware_signature.write_at(&mut data, FACS_HARDWARE_SIGNATURE_OFFSET);
        data
    }

    #[test]
    fn enable_reset_enlarges_short_fadt() {
        let short_fadt = make_table(b"FACP", 116, b"FADT    ");
        let machine = build_machine(&[short_fadt]);
        let old_fadt = machine.table_addresses[0];

        let mut context = AcpiContext::init(machine.platform).unwrap();
        context.fadt_enable_reset().unwrap();

        let new_fadt = context.fadt_address().unwrap();
        assert_ne!(new_fadt, old_fadt);
        assert_eq!(context.table_addresses().next(), Some(new_fadt));

        let data = read_back(new_fadt, fadt::RESET_MIN_LENGTH);
        assert_eq!(
            u32::read_at(&data, sdt::LENGTH_OFFSET),
            Some(fadt::RESET_MIN_LENGTH as u32)
        );
        let flags = FadtFlags::from_bits_retain(u32::read_at(&data, fadt::FLAGS_OFFSET).unwrap());
        assert!(flags.contains(FadtFlags::RESET_REG_SUP));
        assert!(flags.contains(FadtFlags::SLP_BUTTON));
        assert!(!flags.contains(FadtFlags::PWR_BUTTON));
        assert_eq!(
            data[fadt::RESET_REG_OFFSET + gas::ADDRESS_SPACE_ID],
            gas::SPACE_SYSTEM_IO
        );
        assert_eq!(
            u64::read_at(&data, fadt::RESET_REG_OFFSET + gas::ADDRESS),
            Some(RESET_PORT)
        );
        assert_eq!(data[fadt::RESET_VALUE_OFFSET], RESET_VALUE);
        assert!(sdt::validate_checksum(&data));
    }

    #[test]
    fn enable_reset_leaves_working_fadt_alone() {
        let mut fadt_data = make_fadt(0);
        let flags = (FadtFlags::RESET_REG_SUP | FadtFlags::SLP_BUTTON).bits();
        let _ = flags.write_at(&mut fadt_data, fadt::FLAGS_OFFSET);
        let _ = RESET_PORT.write_at(&mut fadt_data, fadt::RESET_REG_OFFSET + gas::ADDRESS);
        sdt::update_checksum(&mut fadt_data, sdt::CHECKSUM_OFFSET);

        let machine = build_machine(&[fadt_data.clone()]);
        let address = machine.table_addresses[0];
        let mut context = AcpiContext::init(machine.platform).unwrap();
        context.fadt_enable_reset().unwrap();

        assert_eq!(context.fadt_address(), Some(address));
        assert_eq!(read_back(address, fadt_data.len()), fadt_data);
    }

    #[test]
    fn enable_reset_fills_zero_register_in_place() {
        let machine = build_machine(&[make_fadt(0)]);
        let address = machine.table_addresses[0];
        let mut context = AcpiContext::init(machine.platform).unwrap();
        context.fadt_enable_reset().unwrap();

        // Writable in place: no copy was made.
        assert_eq!(context.fadt_address(), Some(address));
        let data = read_back(address, 276);
        assert_eq!(
            u64::read_at(&data, fadt::RESET_REG_OFFSET + gas::ADDRESS),
            Some(RESET_PORT)
        );
        assert_eq!(data[fadt::RESET_VALUE_OFFSET], RESET_VALUE);
        assert!(sdt::validate_checksum(&data));
    }

    #[test]
    fn hardware_signature_is_cleared() {
        let facs_addr = leak_bytes(&make_facs(0xDEAD_BEEF));
        let mut fadt_data = make_fadt(0);
        let _ = facs_addr.write_at(&mut fadt_data, fadt::X_FIRMWARE_CTRL_OFFSET);
        sdt::update_checksum(&mut fadt_data, sdt::CHECKSUM_OFFSET);

        let machine = build_machine(&[fadt_data]);
        let mut context = AcpiContext::init(machine.platform).unwrap();
        context.reset_hardware_signature().unwrap();

        let facs = read_back(facs_addr, 64);
        assert_eq!(u32::read_at(&facs, FACS_HARDWARE_SIGNATURE_OFFSET), Some(0));
        // Second run is a no-op.
        context.reset_hardware_signature().unwrap();
    }

    #[test]
    fn hardware_signature_without_facs_is_ok() {
        let machine = build_machine(&[make_fadt(0)]);
        let mut context = AcpiContext::init(machine.platform).unwrap();
        assert_eq!(context.reset_hardware_signature(), Ok(()));
    }

    #[test]
    fn logo_status_bit_is_cleared() {
        let mut bgrt = make_table(b"BGRT", 56, b"BGRTTBL ");
        bgrt[BGRT_STATUS_OFFSET] = BGRT_STATUS_DISPLAYED;
        sdt::update_checksum(&mut bgrt, sdt::CHECKSUM_OFFSET);

        let machine = build_machine(&[bgrt]);
        let address = machine.table_addresses[0];
        let mut context = AcpiContext::init(machine.platform).unwrap();
        context.reset_logo_status().unwrap();

        let data = read_back(address, 56);
        assert_eq!(data[BGRT_STATUS_OFFSET] & BGRT_STATUS_DISPLAYED, 0);
        assert!(sdt::validate_checksum(&data));
    }

    #[test]
    fn logo_status_without_bgrt_is_not_found() {
        let machine = build_machine(&[make_table(b"APIC", 64, b"APICTBL ")]);
        let mut context = AcpiContext::init(machine.platform).unwrap();
        assert_eq!(context.reset_logo_status(), Err(AcpiError::NotFound));
    }

    #[test]
    fn sync_table_ids_copies_slic_ids() {
        let mut slic = make_table(b"SLIC", 374, b"SLICTBL ");
        slic[sdt::OEM_ID_OFFSET..sdt::OEM_ID_OFFSET + 6].copy_from_slice(b"VENDOR");
        sdt::update_checksum(&mut slic, sdt::CHECKSUM_OFFSET);

        let slic_addr = leak_bytes(&slic);
        let fadt_addr = leak_bytes(&make_fadt(0));
        let machine = build_machine_at(&[fadt_addr, slic_addr]);
        let mut context = AcpiContext::init(machine.platform).unwrap();
        context.sync_table_ids().unwrap();

        let xsdt_addr = context.xsdt_address().unwrap();
        let xsdt_len = SdtHeader::SIZE + 2 * 8;
        let xsdt = read_back(xsdt_addr, xsdt_len);
        assert_eq!(&xsdt[sdt::OEM_ID_OFFSET..sdt::OEM_ID_OFFSET + 6], b"VENDOR");
        assert_eq!(
            &xsdt[sdt::OEM_TABLE_ID_OFFSET..sdt::OEM_TABLE_ID_OFFSET + 8],
            b"SLICTBL "
        );
        assert!(sdt::validate_checksum(&xsdt));

        let fadt_data = read_back(fadt_addr, 276);
        assert_eq!(
            &fadt_data[sdt::OEM_ID_OFFSET..sdt::OEM_ID_OFFSET + 6],
            b"VENDOR"
        );
        assert!(sdt::validate_checksum(&fadt_data));
    }

    #[test]
    fn synced_ids_survive_commit() {
        let mut slic = make_table(b"SLIC", 374, b"SLICTBL ");
        slic[sdt::OEM_ID_OFFSET..sdt::OEM_ID_OFFSET + 6].copy_from_slice(b"VENDOR");
        sdt::update_checksum(&mut slic, sdt::CHECKSUM_OFFSET);

        let slic_addr = leak_bytes(&slic);
        let fadt_addr = leak_bytes(&make_fadt(0));
        let machine = build_machine_at(&[fadt_addr, slic_addr]);
        let mut context = AcpiContext::init(machine.platform).unwrap();
        let old_xsdt = context.xsdt_address().unwrap();

        context.sync_table_ids().unwrap();
        context.apply().unwrap();

        // The rebuilt XSDT carries the synced ids forward.
        let new_xsdt = context.xsdt_address().unwrap();
        assert_ne!(new_xsdt, old_xsdt);
        let xsdt = read_back(new_xsdt, SdtHeader::SIZE + 2 * 8);
        assert_eq!(&xsdt[sdt::OEM_ID_OFFSET..sdt::OEM_ID_OFFSET + 6], b"VENDOR");
        assert_eq!(
            &xsdt[sdt::OEM_TABLE_ID_OFFSET..sdt::OEM_TABLE_ID_OFFSET + 8],
            b"SLICTBL "
        );
        assert!(sdt::validate_checksum(&xsdt));
    }

    #[test]
    fn sync_table_ids_without_slic_is_not_found() {
        let machine = build_machine(&[make_fadt(0)]);
        let mut context = AcpiContext::init(machine.platform).unwrap();
        assert_eq!(context.sync_table_ids(), Err(AcpiError::NotFound));
    }
}

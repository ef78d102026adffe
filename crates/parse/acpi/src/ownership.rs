//! Copy-on-write table ownership.
//!
//! Firmware tables may live in read-only memory. Before the first
//! mutation of a table a volatile write probe decides whether it can be
//! edited in place; if not, the table is copied into freshly allocated
//! pages and every cross-reference to it (working set entries, the
//! FADT's DSDT and FACS pointers) is rewired to the copy. The probe's
//! verdict is memoized per table so it runs at most once.

use crate::context::TableEntry;
use crate::sdt;
use crate::{fadt, size_to_pages, AcpiContext, AcpiError, AcpiPlatform, PAGE_SIZE};

use muon_binparse::{FromBytes, IntoBytes};

/// Who owns a table's backing memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ownership {
    /// Firmware memory that failed the write probe; mutations must copy.
    Borrowed,
    /// Memory we can write to, either probed writable in place or
    /// allocated by us.
    Owned,
}

impl<P: AcpiPlatform> AcpiContext<P> {
    /// Probe whether the table at `address` is backed by writable memory.
    ///
    /// Writes an incremented low length byte through a volatile pointer
    /// and reads it back; a write to ROM leaves the value unchanged. The
    /// original byte is restored either way.
    pub(crate) fn probe_writable(&self, address: u64) -> bool {
        // SAFETY: `address` refers to a discovered table; a failed write
        // to read-only memory is harmless and a successful one is
        // reverted below.
        unsafe {
            let ptr = self
                .platform
                .map_physical(address, sdt::COMMON_HEADER_SIZE)
                .add(sdt::LENGTH_OFFSET);
            let old = core::ptr::read_volatile(ptr);
            core::ptr::write_volatile(ptr, old.wrapping_add(1));
            let writable = core::ptr::read_volatile(ptr) == old.wrapping_add(1);
            core::ptr::write_volatile(ptr, old);
            writable
        }
    }

    /// Copy the table at `address` into `new_size` bytes of fresh pages.
    ///
    /// The copy's length field is set to `new_size` (never less than the
    /// source length) and the extension plus the page tail are
    /// zero-filled. The source is left untouched.
    pub(crate) fn allocate_copy(&self, address: u64, new_size: usize) -> Result<u64, AcpiError> {
        // SAFETY: `address` refers to a discovered table.
        let source = unsafe { self.table_bytes(address) };
        let new_size = new_size.max(source.len());

        let pages = size_to_pages(new_size);
        let copy = self.platform.allocate_pages(pages).inspect_err(|_| {
            log::warn!("failed to allocate {pages} pages for table copy");
        })?;
        // SAFETY: allocate_pages returned `pages` mapped, writable pages.
        unsafe {
            let ptr = self.platform.map_physical(copy, pages * PAGE_SIZE);
            let data = core::slice::from_raw_parts_mut(ptr, pages * PAGE_SIZE);
            data[..source.len()].copy_from_slice(source);
            data[source.len()..].fill(0);
            let _ = (new_size as u32).write_at(data, sdt::LENGTH_OFFSET);
        }
        Ok(copy)
    }

    /// Make the working set entry at `index` writable, copying the table
    /// if the probe says its memory is read-only.
    ///
    /// # Errors
    ///
    /// Returns [`AcpiError::OutOfResources`] if a needed copy cannot be
    /// allocated; the entry then still points at the original table.
    pub(crate) fn ensure_table_writable(&mut self, index: usize) -> Result<(), AcpiError> {
        let entry = self.tables[index];
        if entry.ownership == Some(Ownership::Owned) {
            return Ok(());
        }
        if entry.ownership.is_none() && self.probe_writable(entry.address) {
            self.tables[index].ownership = Some(Ownership::Owned);
            return Ok(());
        }
        self.tables[index].ownership = Some(Ownership::Borrowed);

        // The FADT needs its duplicates and cached pointer rewired too.
        if Some(entry.address) == self.fadt {
            return self.allocate_copy_fadt(None);
        }

        let length = self.table_length(entry.address);
        let copy = self.allocate_copy(entry.address, length)?;
        log::debug!("copied read-only table at {:#x} to {copy:#x}", entry.address);
        self.tables[index] = TableEntry::owned(copy);
        Ok(())
    }

    /// Make the FADT writable, copying it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`AcpiError::NotFound`] if no FADT was discovered, or an
    /// allocation error from the copy.
    pub(crate) fn ensure_fadt_writable(&mut self) -> Result<(), AcpiError> {
        let address = self.fadt.ok_or(AcpiError::NotFound)?;
        match self.fadt_ownership() {
            Some(Ownership::Owned) => Ok(()),
            None if self.probe_writable(address) => {
                self.set_ownership(address, Ownership::Owned);
                Ok(())
            }
            _ => {
                self.set_ownership(address, Ownership::Borrowed);
                self.allocate_copy_fadt(None)
            }
        }
    }

    /// Copy the FADT into `new_size` bytes (its current length when
    /// `None`), rewiring every working set entry that aliases it plus
    /// the cached FADT pointer.
    ///
    /// The copy's checksum is not refreshed here; enlarging callers
    /// mutate further and refresh when done.
    ///
    /// # Errors
    ///
    /// Returns [`AcpiError::NotFound`] if no FADT was discovered, or an
    /// allocation error from the copy.
    pub(crate) fn allocate_copy_fadt(&mut self, new_size: Option<u32>) -> Result<(), AcpiError> {
        let old = self.fadt.ok_or(AcpiError::NotFound)?;
        let new_size = new_size.map_or_else(|| self.table_length(old), |size| size as usize);
        let copy = self.allocate_copy(old, new_size)?;

        // Some firmware lists the FADT more than once.
        for entry in &mut self.tables {
            if entry.address == old {
                *entry = TableEntry::owned(copy);
            }
        }
        self.fadt = Some(copy);
        log::debug!("copied FADT at {old:#x} to {copy:#x}, {new_size} bytes");
        Ok(())
    }

    /// Make the DSDT writable, copying it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`AcpiError::InvalidParameter`] if no DSDT was
    /// discovered, or an error from [`AcpiContext::allocate_copy_dsdt`].
    pub(crate) fn ensure_dsdt_writable(&mut self) -> Result<(), AcpiError> {
        let entry = self.dsdt.ok_or(AcpiError::InvalidParameter)?;
        if entry.ownership == Some(Ownership::Owned) {
            return Ok(());
        }
        if entry.ownership.is_none() && self.probe_writable(entry.address) {
            self.dsdt = Some(TableEntry {
                address: entry.address,
                ownership: Some(Ownership::Owned),
            });
            return Ok(());
        }
        self.dsdt = Some(TableEntry {
            address: entry.address,
            ownership: Some(Ownership::Borrowed),
        });
        self.allocate_copy_dsdt(None)
    }

    /// Install a DSDT copy and point the FADT at it.
    ///
    /// Copies either `replacement` or the current DSDT into fresh pages,
    /// makes the FADT writable (copying it in turn if needed), rewrites
    /// its 32-bit DSDT pointer (and the 64-bit one when the FADT is long
    /// enough) and refreshes the FADT checksum.
    ///
    /// # Errors
    ///
    /// Returns [`AcpiError::InvalidParameter`] for a malformed
    /// `replacement` or when copying a DSDT that was never discovered,
    /// [`AcpiError::NotFound`] without a FADT, and allocation errors
    /// otherwise. On failure the context still references the old DSDT.
    pub fn allocate_copy_dsdt(&mut self, replacement: Option<&[u8]>) -> Result<(), AcpiError> {
        let source: &[u8] = match replacement {
            Some(data) => {
                let declared = u32::read_at(data, sdt::LENGTH_OFFSET).unwrap_or(0);
                if data.len() < sdt::COMMON_HEADER_SIZE || declared as usize != data.len() {
                    log::warn!("malformed replacement DSDT of {} bytes", data.len());
                    return Err(AcpiError::InvalidParameter);
                }
                data
            }
            None => {
                let entry = self.dsdt.ok_or(AcpiError::InvalidParameter)?;
                // SAFETY: the DSDT entry refers to a discovered table.
                unsafe { self.table_bytes(entry.address) }
            }
        };

        let pages = size_to_pages(source.len());
        let copy = self.platform.allocate_pages(pages).inspect_err(|_| {
            log::warn!("failed to allocate {pages} pages for DSDT copy");
        })?;
        // SAFETY: allocate_pages returned `pages` mapped, writable pages.
        unsafe {
            let ptr = self.platform.map_physical(copy, pages * PAGE_SIZE);
            let data = core::slice::from_raw_parts_mut(ptr, pages * PAGE_SIZE);
            data[..source.len()].copy_from_slice(source);
            data[source.len()..].fill(0);
        }

        if let Err(error) = self.ensure_fadt_writable() {
            self.platform.free_pages(copy, pages);
            return Err(error);
        }
        let Some(fadt_addr) = self.fadt else {
            self.platform.free_pages(copy, pages);
            return Err(AcpiError::NotFound);
        };

        // SAFETY: ensure_fadt_writable left the FADT in writable memory.
        let data = unsafe { self.table_bytes_mut(fadt_addr) };
        let _ = (copy as u32).write_at(data, fadt::DSDT_OFFSET);
        if data.len() >= fadt::X_DSDT_MIN_LENGTH {
            let _ = copy.write_at(data, fadt::X_DSDT_OFFSET);
        }
        sdt::update_checksum(data, sdt::CHECKSUM_OFFSET);

        self.dsdt = Some(TableEntry::owned(copy));
        log::debug!("installed DSDT copy at {copy:#x}, {} bytes", source.len());
        Ok(())
    }

    /// The memoized ownership of the FADT, if any entry carries one.
    fn fadt_ownership(&self) -> Option<Ownership> {
        let address = self.fadt?;
        self.tables
            .iter()
            .find(|entry| entry.address == address)
            .and_then(|entry| entry.ownership)
    }

    /// Memoize `ownership` on every entry aliasing `address`.
    fn set_ownership(&mut self, address: u64, ownership: Ownership) {
        for entry in &mut self.tables {
            if entry.address == address {
                entry.ownership = Some(ownership);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::{
        build_machine, leak_bytes, make_fadt, make_table, read_back, standard_machine,
    };
    use crate::AcpiContext;

    #[test]
    fn probe_reports_heap_memory_writable() {
        let (machine, _) = standard_machine();
        let context = AcpiContext::init(machine.platform).unwrap();
        let address = context.table_addresses().next().unwrap();
        assert!(context.probe_writable(address));
        // The probe restores the length byte.
        assert_eq!(context.table_length(address), 276);
    }

    #[test]
    fn allocate_copy_same_size_is_byte_exact() {
        let (machine, _) = standard_machine();
        let context = AcpiContext::init(machine.platform).unwrap();
        let address = context.table_addresses().next().unwrap();
        let original = read_back(address, 276);

        let copy = context.allocate_copy(address, 276).unwrap();
        assert_ne!(copy, address);
        assert_eq!(read_back(copy, 276), original);
    }

    #[test]
    fn allocate_copy_enlarges_and_zero_fills() {
        let table = make_table(b"SSDT", 64, b"CpuRef  ");
        let machine = build_machine(&[table.clone()]);
        let context = AcpiContext::init(machine.platform).unwrap();
        let address = context.table_addresses().next().unwrap();

        let copy = context.allocate_copy(address, 200).unwrap();
        let data = read_back(copy, 200);
        assert_eq!(u32::read_at(&data, sdt::LENGTH_OFFSET), Some(200));
        // Body preserved, extension zeroed.
        assert_eq!(&data[8..64], &table[8..64]);
        assert!(data[64..].iter().all(|&b| b == 0));
    }

    #[test]
    fn ensure_table_writable_memoizes_probe() {
        let (machine, _) = standard_machine();
        let mut context = AcpiContext::init(machine.platform).unwrap();

        assert_eq!(context.tables[1].ownership, None);
        context.ensure_table_writable(1).unwrap();
        assert_eq!(context.tables[1].ownership, Some(Ownership::Owned));
        // The address did not change: heap memory is writable in place.
        assert_eq!(context.tables[1].address, context.table_addresses().nth(1).unwrap());
    }

    #[test]
    fn fadt_copy_rewires_duplicates() {
        let dsdt = make_table(b"DSDT", 100, b"DSDTTBL ");
        let dsdt_addr = leak_bytes(&dsdt);
        let fadt_addr = leak_bytes(&make_fadt(dsdt_addr));

        // The same FADT listed twice.
        let machine = crate::context::tests::build_machine_at(&[fadt_addr, fadt_addr]);
        let mut context = AcpiContext::init(machine.platform).unwrap();

        context.allocate_copy_fadt(None).unwrap();
        let copy = context.fadt_address().unwrap();
        assert_ne!(copy, fadt_addr);
        assert!(context.table_addresses().all(|address| address == copy));
    }

    #[test]
    fn dsdt_copy_updates_fadt_pointers() {
        let (machine, old_dsdt) = standard_machine();
        let mut context = AcpiContext::init(machine.platform).unwrap();

        context.allocate_copy_dsdt(None).unwrap();
        let copy = context.dsdt_address().unwrap();
        assert_ne!(copy, old_dsdt);
        assert_eq!(read_back(copy, 100), read_back(old_dsdt, 100));

        let fadt_data = read_back(context.fadt_address().unwrap(), 276);
        assert_eq!(u32::read_at(&fadt_data, fadt::DSDT_OFFSET), Some(copy as u32));
        assert_eq!(u64::read_at(&fadt_data, fadt::X_DSDT_OFFSET), Some(copy));
        assert!(sdt::validate_checksum(&fadt_data));
    }

    #[test]
    fn dsdt_copy_without_dsdt_is_invalid() {
        let machine = build_machine(&[make_table(b"APIC", 64, b"APICTBL ")]);
        let mut context = AcpiContext::init(machine.platform).unwrap();
        assert_eq!(
            context.allocate_copy_dsdt(None),
            Err(AcpiError::InvalidParameter)
        );
    }
}

//! The ACPI table context: discovery, working set maintenance and commit.
//!
//! [`AcpiContext::init`] walks the RSDP to the RSDT/XSDT and enumerates
//! every referenced table into a working set. Mutating operations edit
//! that set (and the tables it points to, copy-on-write), and
//! [`AcpiContext::apply`] commits the result by building fresh root
//! tables and re-pointing the RSDP at them.

use alloc::vec::Vec;

use muon_binparse::{BinaryReader, FromBytes, IntoBytes};

use crate::ownership::Ownership;
use crate::region::AcpiRegion;
use crate::rsdp;
use crate::sdt::{self, SdtHeader};
use crate::sig::{self, Signature};
use crate::{fadt, size_to_pages, AcpiError, AcpiPlatform, PAGE_SIZE};

/// Tables below this address may sit in write-protected legacy memory.
const LEGACY_REGION_END: u64 = 0x10_0000;

/// One table of the working set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TableEntry {
    /// Physical address of the table.
    pub address: u64,
    /// Writability of the backing memory, memoized after the first write
    /// probe. `None` until the table is first touched by a mutation.
    pub ownership: Option<Ownership>,
}

impl TableEntry {
    pub(crate) fn discovered(address: u64) -> Self {
        Self {
            address,
            ownership: None,
        }
    }

    pub(crate) fn owned(address: u64) -> Self {
        Self {
            address,
            ownership: Some(Ownership::Owned),
        }
    }
}

/// Wildcard-capable table match used by delete and patch operations.
///
/// `None` fields match every table. A table shorter than a full header
/// exposes an OEM table id of zero for matching purposes.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableFilter {
    /// Match tables with this signature.
    pub signature: Option<Signature>,
    /// Match tables with exactly this length.
    pub length: Option<u32>,
    /// Match tables with this OEM table id, read as a little-endian
    /// integer.
    pub oem_table_id: Option<u64>,
}

impl TableFilter {
    /// A filter matching every table with `signature`.
    #[must_use]
    pub fn with_signature(signature: Signature) -> Self {
        Self {
            signature: Some(signature),
            ..Self::default()
        }
    }

    /// Whether the table in `data` satisfies every populated field.
    #[must_use]
    pub fn matches(&self, data: &[u8]) -> bool {
        let Some(signature) = Signature::from_bytes(data) else {
            return false;
        };
        if self.signature.is_some_and(|want| want != signature) {
            return false;
        }

        let length = u32::read_at(data, sdt::LENGTH_OFFSET).unwrap_or(0);
        if self.length.is_some_and(|want| want != length) {
            return false;
        }

        if let Some(want) = self.oem_table_id {
            let current = <[u8; 8]>::read_at(data, sdt::OEM_TABLE_ID_OFFSET)
                .map_or(0, u64::from_le_bytes);
            if current != want {
                return false;
            }
        }

        true
    }
}

/// The working copy of the platform's ACPI table set.
///
/// Dropping the context abandons the working set without touching the
/// platform's tables; copies made along the way stay allocated, as the
/// firmware may already reference them.
pub struct AcpiContext<P: AcpiPlatform> {
    pub(crate) platform: P,
    /// Physical address of the RSDP.
    pub(crate) rsdp: u64,
    pub(crate) rsdp_revision: u8,
    pub(crate) rsdt: Option<u64>,
    pub(crate) xsdt: Option<u64>,
    /// The working table set, in root table order.
    pub(crate) tables: Vec<TableEntry>,
    /// Cached FADT address; aliases an entry of `tables`.
    pub(crate) fadt: Option<u64>,
    /// The DSDT, tracked separately as it is reached through the FADT
    /// rather than the root tables.
    pub(crate) dsdt: Option<TableEntry>,
    /// `OperationRegion` declarations remembered by `load_regions`.
    pub(crate) regions: Vec<AcpiRegion>,
}

impl<P: AcpiPlatform> AcpiContext<P> {
    /// Discover the platform's ACPI tables and build a working set.
    ///
    /// Entries that are null, carry the `DSDT` signature, or begin with
    /// the RSDP signature are skipped; firmware has been seen producing
    /// all three. Tables below 1 MiB have their legacy region unlocked so
    /// a later write probe can succeed.
    ///
    /// # Errors
    ///
    /// Returns [`AcpiError::NotFound`] if no RSDP or root table exists,
    /// and [`AcpiError::InvalidParameter`] if the root table holds no
    /// entries.
    pub fn init(platform: P) -> Result<Self, AcpiError> {
        let rsdp_addr = rsdp::find_rsdp(&platform)?;

        // SAFETY: find_rsdp returned a mapped RSDP; the 1.0 prefix is
        // always present.
        let rsdp_v1 = unsafe {
            let ptr = platform.map_physical(rsdp_addr, rsdp::V1_SIZE);
            core::slice::from_raw_parts(ptr, rsdp::V1_SIZE)
        };
        let revision = u8::read_at(rsdp_v1, rsdp::REVISION_OFFSET).unwrap_or(0);
        let rsdt_addr = u32::read_at(rsdp_v1, rsdp::RSDT_ADDRESS_OFFSET).unwrap_or(0);

        let xsdt_addr = if revision > 0 {
            // SAFETY: revision 2+ RSDPs carry the extended fields.
            let rsdp_v2 = unsafe {
                let ptr = platform.map_physical(rsdp_addr, rsdp::V2_SIZE);
                core::slice::from_raw_parts(ptr, rsdp::V2_SIZE)
            };
            u64::read_at(rsdp_v2, rsdp::XSDT_ADDRESS_OFFSET).unwrap_or(0)
        } else {
            0
        };

        let mut context = Self {
            platform,
            rsdp: rsdp_addr,
            rsdp_revision: revision,
            rsdt: (rsdt_addr != 0).then_some(u64::from(rsdt_addr)),
            xsdt: (xsdt_addr != 0).then_some(xsdt_addr),
            tables: Vec::new(),
            fadt: None,
            dsdt: None,
            regions: Vec::new(),
        };

        // Prefer the XSDT's 64-bit entries when both roots exist.
        let (root, entry_size) = match (context.xsdt, context.rsdt) {
            (Some(address), _) => (address, 8),
            (None, Some(address)) => (address, 4),
            (None, None) => {
                log::warn!("RSDP references no root table");
                return Err(AcpiError::NotFound);
            }
        };

        // SAFETY: the root table address came from the RSDP.
        let root_data = unsafe { context.table_bytes(root) };
        let count = root_data.len().saturating_sub(SdtHeader::SIZE) / entry_size;
        if count == 0 {
            log::warn!("root table at {root:#x} holds no entries");
            return Err(AcpiError::InvalidParameter);
        }

        let mut entries = BinaryReader::new(&root_data[SdtHeader::SIZE..]);
        while entries.remaining().len() >= entry_size {
            let address = if entry_size == 8 {
                entries.read::<u64>().unwrap_or(0)
            } else {
                entries.read::<u32>().map_or(0, u64::from)
            };
            if address == 0 {
                continue;
            }

            // SAFETY: non-null root table entries point at mapped tables.
            let data = unsafe { context.table_bytes(address) };
            let Some(signature) = Signature::from_bytes(data) else {
                continue;
            };
            // A DSDT reached through the root tables shadows the real one
            // behind the FADT; some firmware also leaves stray RSDP
            // structures in the list.
            if signature == sig::DSDT || data.get(..8) == Some(sig::RSDP.as_slice()) {
                log::debug!("skipping stray {signature} entry at {address:#x}");
                continue;
            }

            let length = data.len() as u32;
            if address < LEGACY_REGION_END
                && context
                    .platform
                    .unlock_legacy_region(address as u32, length)
                    .is_err()
            {
                log::warn!("failed to unlock legacy region for table at {address:#x}");
            }

            log::debug!("found table {signature}, {length} bytes, at {address:#x}");
            context.tables.push(TableEntry::discovered(address));

            if signature == sig::FADT {
                context.fadt = Some(address);
                context.dsdt = dsdt_from_fadt(data).map(TableEntry::discovered);
            }
        }

        if let Some(entry) = context.dsdt {
            if entry.address < LEGACY_REGION_END {
                // SAFETY: the FADT's DSDT pointer refers to a mapped table.
                let length = unsafe { context.table_bytes(entry.address).len() } as u32;
                if context
                    .platform
                    .unlock_legacy_region(entry.address as u32, length)
                    .is_err()
                {
                    log::warn!("failed to unlock legacy region for the DSDT");
                }
            }
        } else {
            log::warn!("no DSDT found");
        }
        if context.fadt.is_none() {
            log::warn!("no FADT found");
        }

        log::debug!("found {} ACPI tables", context.tables.len());
        Ok(context)
    }

    /// Physical address of the RSDP.
    #[must_use]
    pub fn rsdp_address(&self) -> u64 {
        self.rsdp
    }

    /// Physical address of the RSDT, if one exists.
    #[must_use]
    pub fn rsdt_address(&self) -> Option<u64> {
        self.rsdt
    }

    /// Physical address of the XSDT, if one exists.
    #[must_use]
    pub fn xsdt_address(&self) -> Option<u64> {
        self.xsdt
    }

    /// Physical address of the FADT, if one was discovered.
    #[must_use]
    pub fn fadt_address(&self) -> Option<u64> {
        self.fadt
    }

    /// Physical address of the DSDT, if one was discovered.
    #[must_use]
    pub fn dsdt_address(&self) -> Option<u64> {
        self.dsdt.map(|entry| entry.address)
    }

    /// Number of tables in the working set.
    #[must_use]
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Physical addresses of the working set, in root table order.
    pub fn table_addresses(&self) -> impl Iterator<Item = u64> + '_ {
        self.tables.iter().map(|entry| entry.address)
    }

    /// The `OperationRegion` declarations collected by
    /// [`AcpiContext::load_regions`].
    #[must_use]
    pub fn regions(&self) -> &[AcpiRegion] {
        &self.regions
    }

    /// The platform backing this context.
    #[must_use]
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Map the table at `address` and return its bytes.
    ///
    /// The slice length is the table's declared length, clamped to at
    /// least the common header size so garbage lengths cannot produce an
    /// unreadable header.
    ///
    /// # Safety
    ///
    /// `address` must refer to a mapped ACPI table. The returned slice
    /// aliases physical memory; the caller must not hold it across a
    /// mutation of the same table.
    pub(crate) unsafe fn table_bytes(&self, address: u64) -> &'static [u8] {
        // SAFETY: per this function's contract.
        unsafe {
            let header_ptr = self.platform.map_physical(address, sdt::COMMON_HEADER_SIZE);
            let header = core::slice::from_raw_parts(header_ptr, sdt::COMMON_HEADER_SIZE);
            let length = u32::read_at(header, sdt::LENGTH_OFFSET)
                .map_or(0, |l| l as usize)
                .max(sdt::COMMON_HEADER_SIZE);
            let ptr = self.platform.map_physical(address, length);
            core::slice::from_raw_parts(ptr, length)
        }
    }

    /// Mutable variant of [`AcpiContext::table_bytes`].
    ///
    /// # Safety
    ///
    /// As for [`AcpiContext::table_bytes`]; additionally the table's
    /// backing memory must be writable and no other reference to it may
    /// be live.
    pub(crate) unsafe fn table_bytes_mut(&self, address: u64) -> &'static mut [u8] {
        // SAFETY: per this function's contract.
        unsafe {
            let header_ptr = self.platform.map_physical(address, sdt::COMMON_HEADER_SIZE);
            let header = core::slice::from_raw_parts(header_ptr, sdt::COMMON_HEADER_SIZE);
            let length = u32::read_at(header, sdt::LENGTH_OFFSET)
                .map_or(0, |l| l as usize)
                .max(sdt::COMMON_HEADER_SIZE);
            let ptr = self.platform.map_physical(address, length);
            core::slice::from_raw_parts_mut(ptr, length)
        }
    }

    /// Declared length of the table at `address`, clamped to at least the
    /// common header size.
    pub(crate) fn table_length(&self, address: u64) -> usize {
        // SAFETY: callers only pass addresses of discovered tables.
        unsafe { self.table_bytes(address).len() }
    }

    /// Remove tables matching `filter` from the working set.
    ///
    /// With `all` set every match is removed; otherwise removal stops
    /// after the first. The removal only detaches the table from the set
    /// committed by [`AcpiContext::apply`]; the table's memory is left in
    /// place.
    ///
    /// # Errors
    ///
    /// Returns [`AcpiError::NotFound`] when nothing matched.
    pub fn delete_tables(&mut self, filter: &TableFilter, all: bool) -> Result<(), AcpiError> {
        let mut removed = 0usize;
        let mut index = 0;
        while index < self.tables.len() {
            let address = self.tables[index].address;
            // SAFETY: working set entries are mapped tables.
            let data = unsafe { self.table_bytes(address) };
            if !filter.matches(data) {
                index += 1;
                continue;
            }

            if let Some(signature) = Signature::from_bytes(data) {
                log::debug!("deleting table {signature} at {address:#x}");
            }
            self.tables.remove(index);
            removed += 1;
            if !all {
                return Ok(());
            }
        }

        if removed > 0 {
            Ok(())
        } else {
            log::debug!("no table matched delete filter");
            Err(AcpiError::NotFound)
        }
    }

    /// Install a caller-supplied table into the working set.
    ///
    /// The table is copied into freshly allocated pages (zero-filled to
    /// the page boundary) and appended to the set. A table carrying the
    /// `DSDT` signature replaces the current DSDT instead of being
    /// appended.
    ///
    /// # Errors
    ///
    /// Returns [`AcpiError::InvalidParameter`] if `data` is shorter than
    /// a common header or its declared length disagrees with the byte
    /// count, and [`AcpiError::OutOfResources`] if allocation fails.
    pub fn insert_table(&mut self, data: &[u8]) -> Result<(), AcpiError> {
        if data.len() < sdt::COMMON_HEADER_SIZE {
            log::warn!("inserted table of {} bytes is too short", data.len());
            return Err(AcpiError::InvalidParameter);
        }
        let declared = u32::read_at(data, sdt::LENGTH_OFFSET).unwrap_or(0);
        if declared as usize != data.len() {
            log::warn!(
                "inserted table declares {declared} bytes but {} were supplied",
                data.len()
            );
            return Err(AcpiError::InvalidParameter);
        }

        let signature = Signature::from_bytes(data).ok_or(AcpiError::InvalidParameter)?;
        if signature == sig::DSDT {
            return self.allocate_copy_dsdt(Some(data));
        }

        let pages = size_to_pages(data.len());
        let address = self.platform.allocate_pages(pages).inspect_err(|_| {
            log::warn!("failed to allocate {pages} pages for inserted table");
        })?;
        // SAFETY: allocate_pages returned `pages` mapped, writable pages.
        unsafe {
            let ptr = self.platform.map_physical(address, pages * PAGE_SIZE);
            let copy = core::slice::from_raw_parts_mut(ptr, pages * PAGE_SIZE);
            copy[..data.len()].copy_from_slice(data);
            copy[data.len()..].fill(0);
        }

        log::debug!(
            "inserted table {signature}, {} bytes, at {address:#x}",
            data.len()
        );
        self.tables.push(TableEntry::owned(address));
        Ok(())
    }

    /// Commit the working set back to the platform.
    ///
    /// Builds replacement root tables (XSDT first, then RSDT, packed into
    /// one allocation) listing exactly the working set, refreshes their
    /// checksums, and re-points the RSDP at them. The RSDP's first
    /// checksum is always recomputed; the extended checksum is recomputed
    /// when an XSDT exists. RSDT entries hold the low 32 bits of each
    /// address.
    ///
    /// # Errors
    ///
    /// Returns [`AcpiError::OutOfResources`] if the root table allocation
    /// fails; the previous root tables then remain in effect.
    pub fn apply(&mut self) -> Result<(), AcpiError> {
        let count = self.tables.len();
        let xsdt_size = self
            .xsdt
            .map_or(0, |_| SdtHeader::SIZE + count * 8);
        let rsdt_size = self
            .rsdt
            .map_or(0, |_| SdtHeader::SIZE + count * 4);
        let total = align8(xsdt_size) + align8(rsdt_size);
        if total == 0 {
            return Ok(());
        }

        let pages = size_to_pages(total);
        let base = self.platform.allocate_pages(pages).inspect_err(|_| {
            log::warn!("failed to allocate {pages} pages for new root tables");
        })?;
        // SAFETY: allocate_pages returned `pages` mapped, writable pages.
        let area = unsafe {
            let ptr = self.platform.map_physical(base, pages * PAGE_SIZE);
            core::slice::from_raw_parts_mut(ptr, pages * PAGE_SIZE)
        };
        area.fill(0);

        let mut offset = 0usize;
        if let Some(old) = self.xsdt {
            let new = base + offset as u64;
            let table = &mut area[offset..offset + xsdt_size];
            self.build_root(old, table, 8);
            self.xsdt = Some(new);
            offset += align8(xsdt_size);
            log::debug!("XSDT moved to {new:#x}, {xsdt_size} bytes");
        }
        if let Some(old) = self.rsdt {
            let new = base + offset as u64;
            let table = &mut area[offset..offset + rsdt_size];
            self.build_root(old, table, 4);
            self.rsdt = Some(new);
            log::debug!("RSDT moved to {new:#x}, {rsdt_size} bytes");
        }

        self.update_rsdp();
        Ok(())
    }

    /// Fill `table` with a copy of the root table at `old`, re-listing
    /// the working set with `entry_size`-byte entries.
    fn build_root(&self, old: u64, table: &mut [u8], entry_size: usize) {
        // SAFETY: `old` is the previous root table.
        let old_header = unsafe { self.table_bytes(old) };
        let header_len = old_header.len().min(SdtHeader::SIZE);
        table[..header_len].copy_from_slice(&old_header[..header_len]);

        let _ = (table.len() as u32).write_at(table, sdt::LENGTH_OFFSET);
        for (index, entry) in self.tables.iter().enumerate() {
            let offset = SdtHeader::SIZE + index * entry_size;
            if entry_size == 8 {
                let _ = entry.address.write_at(table, offset);
            } else {
                let _ = (entry.address as u32).write_at(table, offset);
            }
        }
        sdt::update_checksum(table, sdt::CHECKSUM_OFFSET);
    }

    /// Rewrite the RSDP's root pointers and checksums.
    fn update_rsdp(&self) {
        let size = if self.rsdp_revision > 0 {
            rsdp::V2_SIZE
        } else {
            rsdp::V1_SIZE
        };
        // SAFETY: the RSDP was located by init and stays mapped; firmware
        // RSDPs live in writable ACPI memory.
        let data = unsafe {
            let ptr = self.platform.map_physical(self.rsdp, size);
            core::slice::from_raw_parts_mut(ptr, size)
        };

        if let Some(rsdt) = self.rsdt {
            let _ = (rsdt as u32).write_at(data, rsdp::RSDT_ADDRESS_OFFSET);
        }
        if let Some(xsdt) = self.xsdt {
            let _ = xsdt.write_at(data, rsdp::XSDT_ADDRESS_OFFSET);
        }

        sdt::update_checksum(&mut data[..rsdp::V1_SIZE], rsdp::CHECKSUM_OFFSET);
        if self.xsdt.is_some() && data.len() >= rsdp::V2_SIZE {
            let length = u32::read_at(data, rsdp::LENGTH_OFFSET)
                .map_or(rsdp::V2_SIZE, |l| l as usize)
                .clamp(rsdp::V2_SIZE, data.len());
            sdt::update_checksum(&mut data[..length], rsdp::EXTENDED_CHECKSUM_OFFSET);
        }
    }
}

/// Round `size` up to an 8-byte boundary.
fn align8(size: usize) -> usize {
    size.div_ceil(8) * 8
}

/// The DSDT address declared by the FADT in `data`.
///
/// The 64-bit `X_DSDT` field is used whenever the FADT is long enough to
/// carry it, the legacy 32-bit field otherwise.
fn dsdt_from_fadt(data: &[u8]) -> Option<u64> {
    let address = if data.len() >= fadt::X_DSDT_MIN_LENGTH {
        u64::read_at(data, fadt::X_DSDT_OFFSET)?
    } else {
        u32::read_at(data, fadt::DSDT_OFFSET).map(u64::from)?
    };
    (address != 0).then_some(address)
}

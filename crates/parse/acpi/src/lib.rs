//! `muon-acpi` --- boot-time ACPI table discovery, mutation and commit.
//!
//! This crate maintains a mutable working copy of a machine's ACPI table
//! set during early boot. It locates the RSDP through the firmware
//! configuration tables (falling back to the legacy low-memory scan),
//! enumerates the RSDT/XSDT entries into an [`AcpiContext`], and then lets
//! the caller mutate the set (masked binary patches, table insertion and
//! removal, AML `OperationRegion` relocation, and a handful of firmware
//! quirk fixups) before committing a consistent, re-checksummed table set
//! back to the platform.
//!
//! Tables are treated as copy-on-write: a write probe decides whether a
//! table can be patched in place, and read-only tables are copied into
//! freshly allocated ACPI/NVS memory with every cross-reference (RSDT/XSDT
//! entries, FADT → DSDT/FACS pointers) rewired to the copy. After any byte
//! mutation the affected table's checksum is refreshed before control
//! returns to the caller.
//!
//! Platform services are consumed through the [`AcpiPlatform`] trait, so
//! the engine itself is freestanding and testable on the host.
//!
//! # Usage
//!
//! ```ignore
//! let mut ctx = AcpiContext::init(platform)?;
//! ctx.load_regions();
//! ctx.apply_patch(&patch)?;
//! ctx.fadt_enable_reset()?;
//! ctx.apply()?;
//! ```

#![cfg_attr(not(test), no_std)]
// 64-bit addresses are deliberately truncated into 32-bit table fields.
#![allow(clippy::cast_possible_truncation)]

extern crate alloc;

pub mod context;
pub mod fadt;
pub mod ownership;
pub mod patch;
pub mod quirks;
pub mod region;
pub mod rsdp;
pub mod sdt;
pub mod sig;

pub use context::{AcpiContext, TableFilter};
pub use patch::AcpiPatch;
pub use region::AcpiRegion;
pub use sdt::SdtHeader;
pub use sig::Signature;

/// Errors reported by the table engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcpiError {
    /// The RSDP, RSDT/XSDT, or a requested table, region or anchor is
    /// absent. Recoverable: the caller proceeds without that feature.
    NotFound,
    /// Malformed caller input, e.g. an inserted table whose declared
    /// length disagrees with the supplied byte count, or a missing DSDT
    /// where one is required.
    InvalidParameter,
    /// Page allocation failed. The context remains in its previous,
    /// consistent state.
    OutOfResources,
}

/// Size in bytes of one physical memory page.
pub const PAGE_SIZE: usize = 4096;

/// Number of pages needed to hold `size` bytes.
#[must_use]
pub fn size_to_pages(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE)
}

/// A 128-bit GUID as used by the firmware configuration table.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Guid {
    /// The first 32 bits of the GUID.
    pub data1: u32,
    /// The next 16 bits of the GUID.
    pub data2: u16,
    /// The next 16 bits of the GUID.
    pub data3: u16,
    /// The remaining 64 bits of the GUID.
    pub data4: [u8; 8],
}

impl Guid {
    /// Creates a new GUID from its component parts.
    #[must_use]
    pub const fn new(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Self {
            data1,
            data2,
            data3,
            data4,
        }
    }

    /// ACPI 2.0+ root pointer configuration table GUID.
    pub const ACPI_20_TABLE: Self = Self::new(
        0x8868_e871,
        0xe4f1,
        0x11d3,
        [0xbc, 0x22, 0x00, 0x80, 0xc7, 0x3c, 0x88, 0x81],
    );

    /// ACPI 1.0 root pointer configuration table GUID.
    pub const ACPI_10_TABLE: Self = Self::new(
        0xeb9d_2d30,
        0x2d88,
        0x11d3,
        [0x9a, 0x16, 0x00, 0x90, 0x27, 0x3f, 0xc1, 0x4d],
    );
}

/// One `(vendor GUID, physical address)` entry of the firmware
/// configuration table list.
#[derive(Debug, Clone, Copy)]
pub struct ConfigurationTable {
    /// GUID identifying the table's producer.
    pub vendor_guid: Guid,
    /// Physical address of the vendor table.
    pub address: u64,
}

/// Platform services consumed by the table engine.
///
/// An implementation backs the engine with the firmware's configuration
/// table list, a physical page allocator, and the legacy low-memory
/// unlock service. On firmware, physical memory is identity mapped and
/// [`AcpiPlatform::map_physical`] is a cast; hosts running tests map
/// addresses onto heap buffers instead.
///
/// # Safety
///
/// Implementors must ensure that [`AcpiPlatform::map_physical`] returns a
/// pointer valid for reads of `size` bytes (and writes, for memory the
/// platform reports as conventional or ACPI memory), and that
/// [`AcpiPlatform::allocate_pages`] returns page-aligned memory below
/// 4 GiB that remains valid until freed.
pub unsafe trait AcpiPlatform {
    /// The firmware configuration table list.
    fn configuration_tables(&self) -> &[ConfigurationTable];

    /// Allocate `count` pages of ACPI/NVS-type memory below 4 GiB.
    ///
    /// # Errors
    ///
    /// Returns [`AcpiError::OutOfResources`] if no memory is available.
    fn allocate_pages(&self, count: usize) -> Result<u64, AcpiError>;

    /// Release pages previously obtained from
    /// [`AcpiPlatform::allocate_pages`].
    fn free_pages(&self, address: u64, count: usize);

    /// Make the legacy write-protected region covering `address` writable.
    ///
    /// Called only for tables physically located below 1 MiB.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform cannot unlock the region; the
    /// affected table is then treated as read-only.
    fn unlock_legacy_region(&self, address: u32, length: u32) -> Result<(), AcpiError>;

    /// Map a physical memory region and return a pointer to it.
    ///
    /// # Safety
    ///
    /// The caller guarantees `address` is a valid ACPI-related physical
    /// address and that accesses stay within `size` bytes.
    unsafe fn map_physical(&self, address: u64, size: usize) -> *mut u8;
}

//! Fixed ACPI Description Table (FADT) field layout.
//!
//! The mutation engine touches only a handful of FADT fields: the DSDT and
//! FACS pointers (32-bit and ACPI 2.0+ 64-bit variants), the fixed feature
//! flags, and the reset register block. Everything is addressed by byte
//! offset from the start of the table.

use bitflags::bitflags;

/// Byte offset of the 32-bit FACS pointer (`FIRMWARE_CTRL`).
pub const FIRMWARE_CTRL_OFFSET: usize = 36;
/// Byte offset of the 32-bit DSDT pointer.
pub const DSDT_OFFSET: usize = 40;
/// Byte offset of the fixed feature flags.
pub const FLAGS_OFFSET: usize = 112;
/// Byte offset of the reset register (a Generic Address Structure).
pub const RESET_REG_OFFSET: usize = 116;
/// Byte offset of the value written to the reset register to reset.
pub const RESET_VALUE_OFFSET: usize = 128;
/// Byte offset of the 64-bit FACS pointer (`X_FIRMWARE_CTRL`, ACPI 2.0+).
pub const X_FIRMWARE_CTRL_OFFSET: usize = 132;
/// Byte offset of the 64-bit DSDT pointer (`X_DSDT`, ACPI 2.0+).
pub const X_DSDT_OFFSET: usize = 140;

/// Minimum FADT length carrying the full reset register block
/// (`RESET_REG` plus `RESET_VALUE`).
pub const RESET_MIN_LENGTH: usize = RESET_VALUE_OFFSET + 1;

/// Minimum FADT length carrying the 64-bit DSDT pointer.
pub const X_DSDT_MIN_LENGTH: usize = X_DSDT_OFFSET + 8;

/// Minimum FADT length carrying the 64-bit FACS pointer.
pub const X_FIRMWARE_CTRL_MIN_LENGTH: usize = X_FIRMWARE_CTRL_OFFSET + 8;

bitflags! {
    /// FADT fixed feature flags touched by the reset quirk.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FadtFlags: u32 {
        /// A fixed-feature power button is not present.
        const PWR_BUTTON = 1 << 4;
        /// A fixed-feature sleep button is not present.
        const SLP_BUTTON = 1 << 5;
        /// The reset register block is supported.
        const RESET_REG_SUP = 1 << 10;
    }
}

/// Generic Address Structure byte layout, relative to the structure start.
pub mod gas {
    /// Byte offset of the address space id.
    pub const ADDRESS_SPACE_ID: usize = 0;
    /// Byte offset of the register bit width.
    pub const REGISTER_BIT_WIDTH: usize = 1;
    /// Byte offset of the register bit offset.
    pub const REGISTER_BIT_OFFSET: usize = 2;
    /// Byte offset of the access size.
    pub const ACCESS_SIZE: usize = 3;
    /// Byte offset of the 64-bit register address.
    pub const ADDRESS: usize = 4;
    /// Total size of a Generic Address Structure.
    pub const SIZE: usize = 12;

    /// Address space id for system I/O port space.
    pub const SPACE_SYSTEM_IO: u8 = 1;
    /// Access size encoding for byte access.
    pub const ACCESS_BYTE: u8 = 1;
}

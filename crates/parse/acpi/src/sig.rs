//! Table signatures and OEM identifier helpers.
//!
//! ACPI identifies tables by 4-byte ASCII signatures and OEM table ids by
//! 8-byte ASCII strings. Firmware does not always keep these printable, so
//! the formatting helpers here substitute `.` for anything outside the
//! printable ASCII range before the values reach a log line.

use core::fmt;

/// FADT (Fixed ACPI Description Table) signature.
pub const FADT: Signature = Signature(*b"FACP");
/// DSDT (Differentiated System Description Table) signature.
pub const DSDT: Signature = Signature(*b"DSDT");
/// SSDT (Secondary System Description Table) signature.
pub const SSDT: Signature = Signature(*b"SSDT");
/// RSDT (Root System Description Table) signature.
pub const RSDT: Signature = Signature(*b"RSDT");
/// XSDT (Extended System Description Table) signature.
pub const XSDT: Signature = Signature(*b"XSDT");
/// FACS (Firmware ACPI Control Structure) signature.
pub const FACS: Signature = Signature(*b"FACS");
/// BGRT (Boot Graphics Resource Table) signature.
pub const BGRT: Signature = Signature(*b"BGRT");
/// SLIC (Software Licensing table) signature.
pub const SLIC: Signature = Signature(*b"SLIC");

/// The 8-byte RSDP signature, `RSD PTR `.
pub const RSDP: [u8; 8] = *b"RSD PTR ";

/// A 4-byte ACPI table signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 4]);

impl Signature {
    /// Read a signature from the first four bytes of `data`.
    ///
    /// Returns `None` if `data` is shorter than four bytes.
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let bytes = data.get(..4)?;
        let mut sig = [0u8; 4];
        sig.copy_from_slice(bytes);
        Some(Self(sig))
    }

    /// The signature bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &byte in &self.0 {
            f.write_str(printable(byte))?;
        }
        Ok(())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature(\"{self}\")")
    }
}

/// An 8-byte OEM table identifier, formatted with non-printable bytes
/// sanitized.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct OemTableId(pub [u8; 8]);

impl OemTableId {
    /// The identifier as a little-endian integer, as used for wildcard
    /// matching against patch and delete filters.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        u64::from_le_bytes(self.0)
    }
}

impl fmt::Display for OemTableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &byte in &self.0 {
            f.write_str(printable(byte))?;
        }
        Ok(())
    }
}

impl fmt::Debug for OemTableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OemTableId(\"{self}\")")
    }
}

/// Map a byte to a printable one-character string, substituting `.` for
/// anything outside the printable ASCII range.
fn printable(byte: u8) -> &'static str {
    const TABLE: &str = " !\"#$%&'()*+,-./0123456789:;<=>?@ABCDEFGHIJKLMNOPQRSTUVWXYZ[\\]^_`abcdefghijklmnopqrstuvwxyz{|}~";
    if (0x20..0x7F).contains(&byte) {
        let start = usize::from(byte - 0x20);
        &TABLE[start..=start]
    } else {
        "."
    }
}

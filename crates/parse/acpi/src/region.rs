//! `OperationRegion` scanning and relocation.
//!
//! When a DSDT is replaced wholesale, any `OperationRegion` it declares
//! in SystemMemory may point at addresses the running firmware has
//! already decided on. [`AcpiContext::load_regions`] remembers the
//! regions the firmware's own tables declare, and
//! [`AcpiContext::relocate_regions`] rewrites matching declarations in
//! the (possibly replaced) tables back to those remembered addresses.
//!
//! The scanner is a byte-level walk, not a full AML parser: it matches
//! the fixed shape of an `OperationRegion (NAME, SystemMemory, <addr>,
//! <len>)` declaration whose address operand is a DWord or Word
//! constant, or a name reference to a `Name (NAME, <constant>)`
//! declaration elsewhere in the same table.

use alloc::vec::Vec;

use core::fmt;

use muon_binparse::{FromBytes, IntoBytes};

use crate::sdt::{self, SdtHeader};
use crate::sig::{self, Signature};
use crate::{AcpiContext, AcpiError, AcpiPlatform};

/// ExtOpPrefix, the first byte of an `OperationRegion` opcode.
const EXT_OP_PREFIX: u8 = 0x5B;
/// OpRegionOp, the second byte of an `OperationRegion` opcode.
const OP_REGION_OP: u8 = 0x80;
/// NameOp, introducing a `Name (...)` declaration.
const NAME_OP: u8 = 0x08;
/// RootChar, the optional `\` prefix on a name.
const ROOT_CHAR: u8 = 0x5C;
/// DWordPrefix, introducing a 32-bit integer constant.
const DWORD_PREFIX: u8 = 0x0C;
/// WordPrefix, introducing a 16-bit integer constant.
const WORD_PREFIX: u8 = 0x0B;
/// Region space byte for SystemMemory regions.
const SPACE_SYSTEM_MEMORY: u8 = 0x00;

/// Fewest bytes a SystemMemory `OperationRegion` declaration can occupy
/// past its first opcode byte: opcode pair, root prefix, name, region
/// space byte, DWord-prefixed address and a minimal region length.
const MIN_DECLARATION_LEN: usize = 2 + 1 + 4 + 1 + 1 + 4 + 2;

/// A remembered SystemMemory `OperationRegion` declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcpiRegion {
    /// The region's 4-character AML name segment.
    pub name: [u8; 4],
    /// The region's base address as declared by the firmware tables.
    pub address: u32,
}

impl fmt::Display for AcpiRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {:#x}", Signature(self.name), self.address)
    }
}

/// Where a region's address operand lives inside the table, and how
/// wide its encoding is.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AddressOperand {
    offset: usize,
    width: OperandWidth,
}

#[derive(Debug, Clone, Copy)]
enum OperandWidth {
    Word,
    Dword,
}

impl AddressOperand {
    /// The operand's current value, zero-extended for Word operands.
    fn read(&self, data: &[u8]) -> Option<u32> {
        match self.width {
            OperandWidth::Dword => u32::read_at(data, self.offset),
            OperandWidth::Word => u16::read_at(data, self.offset).map(u32::from),
        }
    }

    /// Write `address` over the operand, truncating for Word operands.
    ///
    /// Returns whether the bytes changed.
    fn write(&self, data: &mut [u8], address: u32) -> bool {
        match self.width {
            OperandWidth::Dword => {
                if u32::read_at(data, self.offset) == Some(address) {
                    return false;
                }
                address.write_at(data, self.offset).is_some()
            }
            OperandWidth::Word => {
                let address = address as u16;
                if u16::read_at(data, self.offset) == Some(address) {
                    return false;
                }
                address.write_at(data, self.offset).is_some()
            }
        }
    }
}

/// One `OperationRegion` declaration found in a table.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RegionDeclaration {
    pub name: [u8; 4],
    pub operand: AddressOperand,
}

/// Whether `byte` may start an AML name segment.
fn is_name_lead(byte: u8) -> bool {
    byte.is_ascii_uppercase() || byte == b'_'
}

/// Whether `byte` may continue an AML name segment.
fn is_name_char(byte: u8) -> bool {
    is_name_lead(byte) || byte.is_ascii_digit()
}

/// Walk `data` for SystemMemory `OperationRegion` declarations whose
/// address operand can be resolved.
pub(crate) fn collect_declarations(data: &[u8]) -> Vec<RegionDeclaration> {
    let mut found = Vec::new();
    if data.len() < SdtHeader::SIZE + MIN_DECLARATION_LEN {
        return found;
    }

    for index in SdtHeader::SIZE..data.len() - MIN_DECLARATION_LEN {
        if data[index] != EXT_OP_PREFIX || data[index + 1] != OP_REGION_OP {
            continue;
        }
        let mut pos = index + 2;
        if data[pos] == ROOT_CHAR {
            pos += 1;
        }
        if !is_name_lead(data[pos]) || !data[pos + 1..pos + 4].iter().copied().all(is_name_char) {
            continue;
        }
        let name = [data[pos], data[pos + 1], data[pos + 2], data[pos + 3]];
        if data[pos + 4] != SPACE_SYSTEM_MEMORY {
            continue;
        }
        let Some(operand) = resolve_operand(data, pos + 5) else {
            continue;
        };
        found.push(RegionDeclaration { name, operand });
    }
    found
}

/// Resolve the address operand starting at `offset`: an inline DWord or
/// Word constant, or a reference to a `Name (...)` constant declared
/// elsewhere in `data`.
fn resolve_operand(data: &[u8], offset: usize) -> Option<AddressOperand> {
    match *data.get(offset)? {
        DWORD_PREFIX => {
            data.get(offset + 1..offset + 5)?;
            Some(AddressOperand {
                offset: offset + 1,
                width: OperandWidth::Dword,
            })
        }
        WORD_PREFIX => {
            data.get(offset + 1..offset + 3)?;
            Some(AddressOperand {
                offset: offset + 1,
                width: OperandWidth::Word,
            })
        }
        _ => {
            let mut pos = offset;
            if *data.get(pos)? == ROOT_CHAR {
                pos += 1;
            }
            let name = data.get(pos..pos + 4)?;
            if !is_name_lead(name[0]) || !name[1..].iter().copied().all(is_name_char) {
                return None;
            }
            find_name(data, [name[0], name[1], name[2], name[3]])
        }
    }
}

/// Find a `Name (NAME, <Word or DWord constant>)` declaration for
/// `name` anywhere in `data`.
fn find_name(data: &[u8], name: [u8; 4]) -> Option<AddressOperand> {
    let mut index = 0;
    while index + 6 < data.len() {
        if data[index] == NAME_OP {
            let mut pos = index + 1;
            if data.get(pos) == Some(&ROOT_CHAR) {
                pos += 1;
            }
            if data.get(pos..pos + 4) == Some(name.as_slice()) {
                match data.get(pos + 4) {
                    Some(&DWORD_PREFIX) if data.get(pos + 5..pos + 9).is_some() => {
                        return Some(AddressOperand {
                            offset: pos + 5,
                            width: OperandWidth::Dword,
                        });
                    }
                    Some(&WORD_PREFIX) if data.get(pos + 5..pos + 7).is_some() => {
                        return Some(AddressOperand {
                            offset: pos + 5,
                            width: OperandWidth::Word,
                        });
                    }
                    _ => {}
                }
            }
        }
        index += 1;
    }
    None
}

/// Append newly seen regions declared in `data` to `regions`.
///
/// Declarations with a zero or unresolvable address, or a name already
/// collected, are ignored.
pub(crate) fn scan_table(data: &[u8], regions: &mut Vec<AcpiRegion>) {
    for declaration in collect_declarations(data) {
        let Some(address) = declaration.operand.read(data) else {
            continue;
        };
        if address == 0 {
            continue;
        }
        if regions.iter().any(|region| region.name == declaration.name) {
            continue;
        }
        log::debug!(
            "found region {} at {address:#x}",
            Signature(declaration.name)
        );
        regions.push(AcpiRegion {
            name: declaration.name,
            address,
        });
    }
}

/// Whether relocating `data` against `regions` would change any byte.
pub(crate) fn needs_relocation(data: &[u8], regions: &[AcpiRegion]) -> bool {
    collect_declarations(data).iter().any(|declaration| {
        regions
            .iter()
            .find(|region| region.name == declaration.name)
            .is_some_and(|region| declaration.operand.read(data) != Some(region.address))
    })
}

/// Rewrite region address operands in `data` to the remembered
/// addresses. Declarations whose name was never remembered stay
/// untouched. Returns whether any byte changed.
pub(crate) fn relocate_table(data: &mut [u8], regions: &[AcpiRegion]) -> bool {
    let mut modified = false;
    for declaration in collect_declarations(data) {
        let Some(region) = regions
            .iter()
            .find(|region| region.name == declaration.name)
        else {
            continue;
        };
        if declaration.operand.write(data, region.address) {
            log::debug!("relocated region {region}");
            modified = true;
        }
    }
    modified
}

impl<P: AcpiPlatform> AcpiContext<P> {
    /// Remember the SystemMemory `OperationRegion` declarations of the
    /// DSDT and every SSDT in the working set.
    ///
    /// First declaration of a name wins; later duplicates are ignored.
    /// Safe to call more than once, new names only accumulate.
    pub fn load_regions(&mut self) {
        if let Some(entry) = self.dsdt {
            // SAFETY: the DSDT entry refers to a discovered table.
            let data = unsafe { self.table_bytes(entry.address) };
            scan_table(data, &mut self.regions);
        }
        for index in 0..self.tables.len() {
            let address = self.tables[index].address;
            // SAFETY: working set entries are mapped tables.
            let data = unsafe { self.table_bytes(address) };
            if Signature::from_bytes(data) != Some(sig::SSDT) {
                continue;
            }
            scan_table(data, &mut self.regions);
        }
        log::debug!("loaded {} ACPI regions", self.regions.len());
    }

    /// Rewrite region declarations in the DSDT and SSDTs back to the
    /// addresses remembered by [`AcpiContext::load_regions`].
    ///
    /// Tables are copied on write only when a declaration actually needs
    /// rewriting, and their checksums are refreshed afterwards.
    ///
    /// # Errors
    ///
    /// Returns an allocation error if a needed table copy fails.
    pub fn relocate_regions(&mut self) -> Result<(), AcpiError> {
        if self.regions.is_empty() {
            return Ok(());
        }

        if let Some(entry) = self.dsdt {
            // SAFETY: the DSDT entry refers to a discovered table.
            let data = unsafe { self.table_bytes(entry.address) };
            if needs_relocation(data, &self.regions) {
                self.ensure_dsdt_writable()?;
                let address = self.dsdt.ok_or(AcpiError::NotFound)?.address;
                // SAFETY: ensure_dsdt_writable left the DSDT writable.
                let data = unsafe { self.table_bytes_mut(address) };
                if relocate_table(data, &self.regions) {
                    sdt::update_checksum(data, sdt::CHECKSUM_OFFSET);
                }
            }
        }

        for index in 0..self.tables.len() {
            let address = self.tables[index].address;
            // SAFETY: working set entries are mapped tables.
            let data = unsafe { self.table_bytes(address) };
            if Signature::from_bytes(data) != Some(sig::SSDT)
                || !needs_relocation(data, &self.regions)
            {
                continue;
            }
            self.ensure_table_writable(index)?;
            // SAFETY: ensure_table_writable left the table writable.
            let data = unsafe { self.table_bytes_mut(self.tables[index].address) };
            if relocate_table(data, &self.regions) {
                sdt::update_checksum(data, sdt::CHECKSUM_OFFSET);
            }
        }
        Ok(())
    }
}

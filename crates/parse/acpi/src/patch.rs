//! Masked binary patching of ACPI tables.
//!
//! A patch carries a find/replace pattern pair with optional bit masks,
//! a table filter, occurrence controls and an optional base anchor that
//! narrows the replace window. The byte-level find/replace engine lives
//! in [`muon_binparse::pattern`]; this module selects the tables, makes
//! them writable and keeps their checksums valid.

use muon_binparse::pattern;

use crate::context::TableFilter;
use crate::sdt::{self, SdtHeader};
use crate::sig::Signature;
use crate::{AcpiContext, AcpiError, AcpiPlatform};

/// A masked find/replace operation over the working table set.
///
/// `find`, `replace` and the masks (when present) must share one
/// length. With no `base` the whole table is the window; otherwise the
/// window starts at the `base_skip`-th occurrence of `base`, and
/// `limit` (when nonzero) caps the window length. `count` caps the
/// number of replacements, zero meaning unlimited, and `skip` ignores
/// that many leading matches.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcpiPatch<'a> {
    /// Pattern to search for.
    pub find: &'a [u8],
    /// Bit mask applied when comparing `find`, all-ones when `None`.
    pub mask: Option<&'a [u8]>,
    /// Replacement bytes.
    pub replace: &'a [u8],
    /// Bit mask selecting which replacement bits are written, all-ones
    /// when `None`.
    pub replace_mask: Option<&'a [u8]>,
    /// Maximum number of replacements, `0` for unlimited.
    pub count: u32,
    /// Number of leading matches to leave untouched.
    pub skip: u32,
    /// Maximum window length in bytes, `0` for unlimited.
    pub limit: u32,
    /// Anchor pattern the window starts at, searched without a mask.
    pub base: Option<&'a [u8]>,
    /// Number of anchor occurrences to skip before the window starts.
    pub base_skip: u32,
    /// Which tables the patch applies to. The DSDT participates through
    /// its own pointer and matches the `DSDT` signature.
    pub filter: TableFilter,
}

impl AcpiPatch<'_> {
    /// Whether the pattern, replacement and mask lengths agree.
    fn is_well_formed(&self) -> bool {
        !self.find.is_empty()
            && self.replace.len() == self.find.len()
            && self.mask.is_none_or(|m| m.len() == self.find.len())
            && self
                .replace_mask
                .is_none_or(|m| m.len() == self.find.len())
    }
}

impl<P: AcpiPlatform> AcpiContext<P> {
    /// Apply `patch` to every matching table.
    ///
    /// Matching tables are made writable (copy-on-write) before any byte
    /// changes, and their checksums are refreshed after. A table in
    /// which the base anchor cannot be found is skipped. Finding no
    /// match anywhere is not an error; the patch simply does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`AcpiError::InvalidParameter`] for mismatched pattern
    /// and mask lengths, and allocation errors from copy-on-write.
    pub fn apply_patch(&mut self, patch: &AcpiPatch<'_>) -> Result<(), AcpiError> {
        if !patch.is_well_formed() {
            log::warn!("malformed patch of {} find bytes", patch.find.len());
            return Err(AcpiError::InvalidParameter);
        }
        log::debug!(
            "applying {}-byte patch, count {}, skip {}",
            patch.find.len(),
            patch.count,
            patch.skip
        );

        // The DSDT is reached through its own pointer, not the set.
        if let Some(entry) = self.dsdt {
            // SAFETY: the DSDT entry refers to a discovered table.
            let data = unsafe { self.table_bytes(entry.address) };
            if patch.filter.matches(data) {
                if let Some((start, end)) = patch_window(data, patch) {
                    self.ensure_dsdt_writable()?;
                    let address = self.dsdt.ok_or(AcpiError::NotFound)?.address;
                    // SAFETY: ensure_dsdt_writable left the DSDT writable.
                    let data = unsafe { self.table_bytes_mut(address) };
                    let replaced = pattern::replace_masked(
                        patch.find,
                        patch.mask,
                        patch.replace,
                        patch.replace_mask,
                        &mut data[start..end],
                        patch.count,
                        patch.skip,
                    );
                    log::debug!("patched DSDT, {replaced} replacements");
                    if replaced > 0 {
                        sdt::update_checksum(data, sdt::CHECKSUM_OFFSET);
                    }
                } else {
                    log::debug!("patch base not found in DSDT, skipping");
                }
            }
        }

        for index in 0..self.tables.len() {
            let address = self.tables[index].address;
            // SAFETY: working set entries are mapped tables.
            let data = unsafe { self.table_bytes(address) };
            if !patch.filter.matches(data) {
                continue;
            }
            let signature = Signature::from_bytes(data);
            let Some((start, end)) = patch_window(data, patch) else {
                if let Some(signature) = signature {
                    log::debug!("patch base not found in {signature}, skipping");
                }
                continue;
            };

            self.ensure_table_writable(index)?;
            // SAFETY: ensure_table_writable left the table writable.
            let data = unsafe { self.table_bytes_mut(self.tables[index].address) };
            let replaced = pattern::replace_masked(
                patch.find,
                patch.mask,
                patch.replace,
                patch.replace_mask,
                &mut data[start..end],
                patch.count,
                patch.skip,
            );
            if let Some(signature) = signature {
                log::debug!("patched {signature}, {replaced} replacements");
            }
            if replaced > 0 && data.len() >= SdtHeader::SIZE {
                sdt::update_checksum(data, sdt::CHECKSUM_OFFSET);
            }
        }
        Ok(())
    }
}

/// The `[start, end)` window `patch` operates on inside `data`, or
/// `None` when the base anchor does not occur often enough.
fn patch_window(data: &[u8], patch: &AcpiPatch<'_>) -> Option<(usize, usize)> {
    let start = match patch.base {
        Some(base) if !base.is_empty() => find_nth(data, base, patch.base_skip)?,
        _ => 0,
    };
    let mut end = data.len();
    if patch.limit != 0 {
        end = end.min(start.saturating_add(patch.limit as usize));
    }
    Some((start, end))
}

/// Offset of the occurrence of `pattern` in `data` after skipping
/// `skip` earlier ones. Matches do not overlap.
fn find_nth(data: &[u8], pattern: &[u8], skip: u32) -> Option<usize> {
    let mut remaining = skip;
    let mut index = 0;
    while index + pattern.len() <= data.len() {
        if &data[index..index + pattern.len()] == pattern {
            if remaining == 0 {
                return Some(index);
            }
            remaining -= 1;
            index += pattern.len();
        } else {
            index += 1;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::{
        build_machine, leak_bytes, make_fadt, make_table, read_back, standard_machine,
    };
    use crate::sig;

    fn table_with_body(signature: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut data = make_table(signature, SdtHeader::SIZE + body.len(), b"PATCHTBL");
        data[SdtHeader::SIZE..].copy_from_slice(body);
        sdt::update_checksum(&mut data, sdt::CHECKSUM_OFFSET);
        data
    }

    #[test]
    fn window_respects_base_and_limit() {
        let data = b"....ANCHOR....ANCHOR........";
        let patch = AcpiPatch {
            find: b"XX",
            replace: b"YY",
            base: Some(b"ANCHOR"),
            base_skip: 1,
            limit: 8,
            ..AcpiPatch::default()
        };
        assert_eq!(patch_window(data, &patch), Some((14, 22)));

        let missing = AcpiPatch {
            base: Some(b"ANCHOR"),
            base_skip: 2,
            ..patch
        };
        assert_eq!(patch_window(data, &missing), None);
    }

    #[test]
    fn rejects_mismatched_lengths() {
        let (machine, _) = standard_machine();
        let mut context = AcpiContext::init(machine.platform).unwrap();
        let patch = AcpiPatch {
            find: b"ABCD",
            replace: b"AB",
            ..AcpiPatch::default()
        };
        assert_eq!(context.apply_patch(&patch), Err(AcpiError::InvalidParameter));
    }

    #[test]
    fn patches_dsdt_and_refreshes_checksum() {
        let dsdt = table_with_body(b"DSDT", b"_OSI_OSI_OSI");
        let dsdt_addr = leak_bytes(&dsdt);
        let machine = build_machine(&[make_fadt(dsdt_addr)]);
        let mut context = AcpiContext::init(machine.platform).unwrap();

        let patch = AcpiPatch {
            find: b"_OSI",
            replace: b"XOSI",
            filter: TableFilter::with_signature(sig::DSDT),
            count: 2,
            skip: 1,
            ..AcpiPatch::default()
        };
        context.apply_patch(&patch).unwrap();

        let data = read_back(dsdt_addr, dsdt.len());
        assert!(sdt::validate_checksum(&data));
        assert_eq!(&data[SdtHeader::SIZE..], b"_OSIXOSIXOSI");
    }

    #[test]
    fn patches_matching_set_tables_only() {
        let tables = vec![
            table_with_body(b"SSDT", b"MARKER--"),
            table_with_body(b"APIC", b"MARKER--"),
        ];
        let machine = build_machine(&tables);
        let addresses = machine.table_addresses.clone();
        let mut context = AcpiContext::init(machine.platform).unwrap();

        let patch = AcpiPatch {
            find: b"MARKER",
            replace: b"marker",
            filter: TableFilter::with_signature(sig::SSDT),
            ..AcpiPatch::default()
        };
        context.apply_patch(&patch).unwrap();

        let ssdt = read_back(addresses[0], tables[0].len());
        assert_eq!(&ssdt[SdtHeader::SIZE..], b"marker--");
        assert!(sdt::validate_checksum(&ssdt));
        let apic = read_back(addresses[1], tables[1].len());
        assert_eq!(&apic[SdtHeader::SIZE..], b"MARKER--");
    }

    #[test]
    fn masked_patch_touches_selected_bits_only() {
        let table = table_with_body(b"SSDT", &[0b0010_0001, 0xFF]);
        let machine = build_machine(&[table.clone()]);
        let address = machine.table_addresses[0];
        let mut context = AcpiContext::init(machine.platform).unwrap();

        // Anchor on the body, match any byte whose low bit is set, and
        // set only its high bit.
        let patch = AcpiPatch {
            find: &[0b0000_0001],
            mask: Some(&[0b0000_0001]),
            replace: &[0b1000_0000],
            replace_mask: Some(&[0b1000_0000]),
            count: 1,
            base: Some(&[0b0010_0001, 0xFF]),
            filter: TableFilter::with_signature(sig::SSDT),
            ..AcpiPatch::default()
        };
        context.apply_patch(&patch).unwrap();

        let data = read_back(address, table.len());
        assert_eq!(data[SdtHeader::SIZE], 0b1010_0001);
        assert_eq!(data[SdtHeader::SIZE + 1], 0xFF);
        assert!(sdt::validate_checksum(&data));
    }

    #[test]
    fn missing_anchor_skips_table_without_error() {
        let table = table_with_body(b"SSDT", b"MARKER--");
        let machine = build_machine(&[table.clone()]);
        let address = machine.table_addresses[0];
        let mut context = AcpiContext::init(machine.platform).unwrap();

        let patch = AcpiPatch {
            find: b"MARKER",
            replace: b"marker",
            base: Some(b"NOSUCH"),
            ..AcpiPatch::default()
        };
        context.apply_patch(&patch).unwrap();
        assert_eq!(read_back(address, table.len()), table);
    }

    #[test]
    fn no_match_anywhere_is_ok() {
        let (machine, _) = standard_machine();
        let mut context = AcpiContext::init(machine.platform).unwrap();
        let patch = AcpiPatch {
            find: b"\xDE\xAD\xBE\xEF",
            replace: b"\x00\x00\x00\x00",
            ..AcpiPatch::default()
        };
        assert_eq!(context.apply_patch(&patch), Ok(()));
    }
}

//! Masked byte-pattern find and replace.
//!
//! A match compares `buffer` bytes against `find` under a bit mask: byte `j`
//! matches when `buffer[i + j] & mask[j] == find[j] & mask[j]`. A `None`
//! mask compares all bits. Replacement writes `replace` under
//! `replace_mask`, preserving the masked-out bits of the original byte.
//!
//! The cursor advances by the full pattern size over every match (replaced
//! or skipped) and by a single byte otherwise, so overlapping occurrences
//! are not re-matched.

/// Apply a masked find/replace over `buffer`.
///
/// - `max_count` limits the number of replacements; `0` means unlimited.
/// - `skip` matches are passed over before the first replacement.
///
/// Returns the number of replacements performed. `find`, `mask` and
/// `replace_mask` (when present) must all have the length of `replace`;
/// mismatched lengths perform no replacements.
#[must_use]
pub fn replace_masked(
    find: &[u8],
    mask: Option<&[u8]>,
    replace: &[u8],
    replace_mask: Option<&[u8]>,
    buffer: &mut [u8],
    max_count: u32,
    skip: u32,
) -> u32 {
    let size = find.len();
    if size == 0
        || replace.len() != size
        || mask.is_some_and(|m| m.len() != size)
        || replace_mask.is_some_and(|m| m.len() != size)
    {
        return 0;
    }

    let mut replaced = 0u32;
    let mut to_skip = skip;
    let mut index = 0usize;

    while index + size <= buffer.len() {
        let window = &buffer[index..index + size];
        let matched = match mask {
            Some(mask) => window
                .iter()
                .zip(find)
                .zip(mask)
                .all(|((&b, &f), &m)| b & m == f & m),
            None => window == find,
        };

        if !matched {
            index += 1;
            continue;
        }

        if to_skip > 0 {
            to_skip -= 1;
            index += size;
            continue;
        }

        let window = &mut buffer[index..index + size];
        match replace_mask {
            Some(rmask) => {
                for ((b, &r), &m) in window.iter_mut().zip(replace).zip(rmask) {
                    *b = (*b & !m) | (r & m);
                }
            }
            None => window.copy_from_slice(replace),
        }

        replaced += 1;
        index += size;

        if max_count != 0 && replaced == max_count {
            break;
        }
    }

    replaced
}

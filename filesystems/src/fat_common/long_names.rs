// VFAT long-file-name machinery: 8.3 short-name derivation from a long
// name, and the 32-byte LFN records that precede the short record.
//
// Each LFN record carries 13 UTF-16 units split into 5+6+2 fragments.
// Records are stored highest ordinal first; the topmost record has the
// 0x40 terminal bit set and its unused name slots hold a 0x0000
// terminator followed by 0xFFFF fill.

use super::{attributes, short_name_checksum};

/// UTF-16 units per LFN record.
pub const LFN_CHARS: usize = 13;

/// Derive the 8.3 short-name field from a UTF-16 long name.
///
/// Upper-case ASCII letters and digits pass through; lower-case letters
/// are upper-cased; anything else becomes '_'. Any substitution, a
/// non-8.3 shape, or an over-long extension makes the name lossy, which
/// appends the "~1" numeric tail and calls for companion LFN records.
pub fn make_short_name(longname: &[u16]) -> ([u8; 11], bool) {
    let mut short = [b' '; 11];
    let mut lossy = false;
    let mut j = 0usize;

    for i in 0..8 {
        match longname.get(j) {
            None | Some(&0) => return with_numeric_tail(short, lossy),
            Some(&u) if u == b'.' as u16 => break,
            Some(&u) => {
                let (ch, sub) = short_char(u);
                short[i] = ch;
                lossy |= sub;
                j += 1;
            }
        }
    }

    if longname.get(j).copied() != Some(b'.' as u16) {
        // Base name longer than eight units.
        return with_numeric_tail(short, true);
    }
    j += 1;

    for i in 8..11 {
        match longname.get(j) {
            None | Some(&0) => return with_numeric_tail(short, lossy),
            Some(&u) => {
                let (ch, sub) = short_char(u);
                short[i] = ch;
                lossy |= sub;
                j += 1;
            }
        }
    }
    if matches!(longname.get(j), Some(&u) if u != 0) {
        // Extension longer than three units.
        lossy = true;
    }

    with_numeric_tail(short, lossy)
}

fn with_numeric_tail(mut short: [u8; 11], lossy: bool) -> ([u8; 11], bool) {
    if lossy {
        short[6] = b'~';
        short[7] = b'1';
    }
    (short, lossy)
}

fn short_char(u: u16) -> (u8, bool) {
    if u < 0x80 {
        let b = u as u8;
        if b.is_ascii_uppercase() || b.is_ascii_digit() {
            (b, false)
        } else if b.is_ascii_lowercase() {
            (b.to_ascii_uppercase(), true)
        } else {
            (b'_', true)
        }
    } else {
        (b'_', true)
    }
}

/// Number of 32-byte records a name occupies: the short record plus its
/// LFN companions, if any.
pub fn records_needed(longname_len: usize, lossy: bool) -> usize {
    if lossy {
        1 + longname_len.div_ceil(LFN_CHARS)
    } else {
        1
    }
}

/// Byte offset of UTF-16 unit `k` inside an LFN record (the 5+6+2
/// fragment split).
fn lfn_unit_offset(k: usize) -> usize {
    match k {
        0..=4 => 1 + 2 * k,
        5..=10 => 14 + 2 * (k - 5),
        _ => 28 + 2 * (k - 11),
    }
}

/// Extract the 13 name units carried by one LFN record.
pub fn lfn_fragment(record: &[u8]) -> [u16; LFN_CHARS] {
    let mut units = [0u16; LFN_CHARS];
    for (k, unit) in units.iter_mut().enumerate() {
        let off = lfn_unit_offset(k);
        *unit = u16::from_le_bytes([record[off], record[off + 1]]);
    }
    units
}

/// Build the LFN records for `longname`, in on-disk order (highest
/// ordinal first), stamped with the companion short name's checksum.
pub fn build_lfn_records(longname: &[u16], short: &[u8; 11]) -> Vec<[u8; 32]> {
    let checksum = short_name_checksum(short);
    let count = longname.len().div_ceil(LFN_CHARS);
    let mut records = Vec::with_capacity(count);

    for ord in (1..=count).rev() {
        let mut rec = [0xFFu8; 32];
        rec[0] = ord as u8 | if ord == count { LAST_LONG_ENTRY } else { 0 };
        rec[11] = attributes::ATTR_LONG_FILE_NAME;
        rec[12] = 0;
        rec[13] = checksum;
        rec[26] = 0;
        rec[27] = 0;

        let start = (ord - 1) * LFN_CHARS;
        let chunk = &longname[start..longname.len().min(start + LFN_CHARS)];
        for (k, &u) in chunk.iter().enumerate() {
            let off = lfn_unit_offset(k);
            rec[off..off + 2].copy_from_slice(&u.to_le_bytes());
        }
        if chunk.len() < LFN_CHARS {
            let off = lfn_unit_offset(chunk.len());
            rec[off..off + 2].copy_from_slice(&[0, 0]);
        }

        records.push(rec);
    }

    records
}

/// Terminal-ordinal marker on the topmost LFN record.
pub const LAST_LONG_ENTRY: u8 = 0x40;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nls::utf8_to_utf16;

    #[test]
    fn pure_short_name_is_lossless() {
        let (short, lossy) = make_short_name(&utf8_to_utf16(b"README.TXT"));
        assert_eq!(&short, b"README  TXT");
        assert!(!lossy);
    }

    #[test]
    fn no_extension_short_name() {
        let (short, lossy) = make_short_name(&utf8_to_utf16(b"ALPHA"));
        assert_eq!(&short, b"ALPHA      ");
        assert!(!lossy);
    }

    #[test]
    fn lower_case_gets_numeric_tail() {
        let (short, lossy) = make_short_name(&utf8_to_utf16(b"file.txt"));
        assert!(lossy);
        assert_eq!(&short[..4], b"FILE");
        assert_eq!(&short[6..8], b"~1");
        assert_eq!(&short[8..11], b"TXT");
    }

    #[test]
    fn long_base_name_gets_numeric_tail() {
        let (short, lossy) = make_short_name(&utf8_to_utf16(b"LONGFILENAME.TXT"));
        assert!(lossy);
        assert_eq!(&short[6..8], b"~1");
    }

    #[test]
    fn records_needed_counts() {
        assert_eq!(records_needed(8, false), 1);
        assert_eq!(records_needed(13, true), 2);
        assert_eq!(records_needed(14, true), 3);
    }

    #[test]
    fn lfn_records_fragment_and_order() {
        let name = utf8_to_utf16(b"file with a long name.txt"); // 25 units
        let (short, lossy) = make_short_name(&name);
        assert!(lossy);

        let records = build_lfn_records(&name, &short);
        assert_eq!(records.len(), 2);

        // Topmost record: highest ordinal with the terminal bit.
        assert_eq!(records[0][0], 2 | LAST_LONG_ENTRY);
        assert_eq!(records[1][0], 1);

        // Every record carries the companion checksum and the LFN
        // attribute marker.
        let checksum = short_name_checksum(&short);
        for rec in &records {
            assert_eq!(rec[11], attributes::ATTR_LONG_FILE_NAME);
            assert_eq!(rec[13], checksum);
        }

        // Reassemble the name from the fragments, lowest ordinal first.
        let mut units = Vec::new();
        units.extend_from_slice(&lfn_fragment(&records[1]));
        units.extend_from_slice(&lfn_fragment(&records[0]));
        let reassembled: Vec<u16> =
            units.into_iter().take_while(|&u| u != 0).collect();
        assert_eq!(reassembled, name);
    }

    #[test]
    fn exact_multiple_has_no_terminator() {
        let name = utf8_to_utf16(b"exactly13char"); // 13 units
        let (short, _) = make_short_name(&name);
        let records = build_lfn_records(&name, &short);
        assert_eq!(records.len(), 1);
        let frag = lfn_fragment(&records[0]);
        assert_eq!(&frag[..], &name[..]);
    }
}

// UTF-8 <-> UTF-16 conversion
// Pure functions, no volume state. Directory names on disk are UTF-16LE
// code units; everything user-facing is UTF-8.
//
// Encoding generates surrogate pairs for U+10000..=U+10FFFF. Decoding
// drops surrogate-range code units instead of pairing them back up, so
// supplementary-plane names do not round-trip; BMP names do.

const SURROGATE_HIGH: u16 = 0xD800;
const SURROGATE_LOW: u16 = 0xDC00;
const SURROGATE_MASK: u16 = 0xFC00;

/// Decode one UTF-8 sequence. Returns the scalar value and the number
/// of bytes consumed; malformed input consumes one byte and yields
/// U+FFFD.
pub fn utf8_to_utf32(bytes: &[u8]) -> (u32, usize) {
    let c = bytes[0];
    if c & 0x80 == 0x00 {
        (c as u32, 1)
    } else if c & 0xE0 == 0xC0 && bytes.len() >= 2 {
        let v = ((c as u32 & 0x1F) << 6) | (bytes[1] as u32 & 0x3F);
        (v, 2)
    } else if c & 0xF0 == 0xE0 && bytes.len() >= 3 {
        let v = ((c as u32 & 0x0F) << 12)
            | ((bytes[1] as u32 & 0x3F) << 6)
            | (bytes[2] as u32 & 0x3F);
        (v, 3)
    } else if c & 0xF8 == 0xF0 && bytes.len() >= 4 {
        let v = ((c as u32 & 0x07) << 18)
            | ((bytes[1] as u32 & 0x3F) << 12)
            | ((bytes[2] as u32 & 0x3F) << 6)
            | (bytes[3] as u32 & 0x3F);
        (v, 4)
    } else {
        (0xFFFD, 1)
    }
}

/// Encode one scalar value as UTF-8. Returns the number of bytes
/// written; values beyond U+10FFFF write nothing.
pub fn utf32_to_utf8(u: u32, out: &mut Vec<u8>) -> usize {
    if u < 0x80 {
        out.push(u as u8);
        1
    } else if u < 0x800 {
        out.push(0xC0 | (u >> 6) as u8);
        out.push(0x80 | (u & 0x3F) as u8);
        2
    } else if u < 0x10000 {
        out.push(0xE0 | (u >> 12) as u8);
        out.push(0x80 | ((u >> 6) & 0x3F) as u8);
        out.push(0x80 | (u & 0x3F) as u8);
        3
    } else if u <= 0x10FFFF {
        out.push(0xF0 | (u >> 18) as u8);
        out.push(0x80 | ((u >> 12) & 0x3F) as u8);
        out.push(0x80 | ((u >> 6) & 0x3F) as u8);
        out.push(0x80 | (u & 0x3F) as u8);
        4
    } else {
        0
    }
}

/// Convert a UTF-8 byte sequence to UTF-16 code units. Supplementary
/// planes become surrogate pairs.
pub fn utf8_to_utf16(src: &[u8]) -> Vec<u16> {
    let mut out = Vec::with_capacity(src.len());
    let mut pos = 0;
    while pos < src.len() {
        let (w, consumed) = utf8_to_utf32(&src[pos..]);
        pos += consumed;
        if w < 0x10000 {
            out.push(w as u16);
        } else {
            let v = w - 0x10000;
            out.push(SURROGATE_HIGH | (v >> 10) as u16);
            out.push(SURROGATE_LOW | (v & 0x3FF) as u16);
        }
    }
    out
}

/// Convert UTF-16 code units to a UTF-8 byte sequence. Surrogate-range
/// units yield no output.
pub fn utf16_to_utf8(src: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len() * 3);
    for &u in src {
        if u & SURROGATE_MASK == SURROGATE_HIGH || u & SURROGATE_MASK == SURROGATE_LOW {
            continue;
        }
        utf32_to_utf8(u as u32, &mut out);
    }
    out
}

/// UTF-16 code units to a displayable string.
pub fn utf16_to_string(src: &[u16]) -> String {
    String::from_utf8_lossy(&utf16_to_utf8(src)).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_round_trip() {
        let units = utf8_to_utf16(b"README.TXT");
        assert_eq!(units.len(), 10);
        assert_eq!(utf16_to_utf8(&units), b"README.TXT");
    }

    #[test]
    fn bmp_round_trip() {
        let name = "r\u{e9}sum\u{e9}.txt";
        let units = utf8_to_utf16(name.as_bytes());
        assert_eq!(units.len(), name.chars().count());
        assert_eq!(utf16_to_utf8(&units), name.as_bytes());
    }

    #[test]
    fn supplementary_plane_encodes_as_pair() {
        // U+1F600 -> D83D DE00
        let units = utf8_to_utf16("\u{1F600}".as_bytes());
        assert_eq!(units, vec![0xD83D, 0xDE00]);
    }

    #[test]
    fn surrogates_dropped_on_decode() {
        assert_eq!(utf16_to_utf8(&[0xD83D, 0xDE00]), b"");
        assert_eq!(utf16_to_utf8(&[b'a' as u16, 0xD800, b'b' as u16]), b"ab");
    }

    #[test]
    fn single_scalar_conversions() {
        let (v, n) = utf8_to_utf32("\u{e9}".as_bytes());
        assert_eq!((v, n), (0xE9, 2));

        let mut buf = Vec::new();
        assert_eq!(utf32_to_utf8(0xE9, &mut buf), 2);
        assert_eq!(buf, "\u{e9}".as_bytes());
    }
}

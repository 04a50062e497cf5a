// Up-case table and name hashing
// The table maps each UTF-16 code unit to its upper-case form; a zero
// slot means the unit maps to itself. The name hash runs over the
// upper-cased name's little-endian bytes.

use log::warn;

/// The volume's up-case table; empty until loaded from its directory
/// entry.
#[derive(Debug, Default)]
pub struct UpcaseTable {
    table: Vec<u16>,
    /// Byte length recorded by the directory entry.
    pub byte_len: u64,
}

impl UpcaseTable {
    pub fn is_loaded(&self) -> bool {
        !self.table.is_empty()
    }

    /// Install raw table bytes and verify them against the directory
    /// entry's checksum; a mismatch is reported but not fatal.
    pub fn load(&mut self, raw: &[u8], byte_len: u64, expected_checksum: u32) {
        let len = (byte_len as usize).min(raw.len());
        let checksum = table_checksum(&raw[..len]);
        if checksum != expected_checksum {
            warn!(
                "up-case table checksum mismatch (entry {:#x}, calculated {:#x})",
                expected_checksum, checksum
            );
        }
        self.table = raw[..len]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        self.byte_len = byte_len;
    }

    /// Upper-case one code unit; units beyond the table (or mapped to
    /// zero) pass through unchanged.
    pub fn upper(&self, unit: u16) -> u16 {
        match self.table.get(unit as usize) {
            Some(&mapped) if mapped != 0 => mapped,
            _ => unit,
        }
    }

    pub fn upper_all(&self, units: &[u16]) -> Vec<u16> {
        units.iter().map(|&u| self.upper(u)).collect()
    }

    pub fn entries(&self) -> &[u16] {
        &self.table
    }
}

/// 32-bit rotate-add checksum over the raw table bytes.
pub fn table_checksum(raw: &[u8]) -> u32 {
    let mut checksum: u32 = 0;
    for &b in raw {
        checksum = (if checksum & 1 != 0 { 0x8000_0000u32 } else { 0 })
            .wrapping_add(checksum >> 1)
            .wrapping_add(b as u32);
    }
    checksum
}

/// 16-bit rotate-add hash over an upper-cased UTF-16 name's
/// little-endian bytes.
pub fn name_hash(upper: &[u16]) -> u16 {
    let mut hash: u16 = 0;
    for &unit in upper {
        for b in unit.to_le_bytes() {
            hash = (if hash & 1 != 0 { 0x8000u16 } else { 0 })
                .wrapping_add(hash >> 1)
                .wrapping_add(b as u16);
        }
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_table_is_identity() {
        let table = UpcaseTable::default();
        assert_eq!(table.upper(b'a' as u16), b'a' as u16);
        assert_eq!(table.upper(0x00E9), 0x00E9);
    }

    #[test]
    fn loaded_table_maps_units() {
        let mut table = UpcaseTable::default();
        // Identity for 'a'..'c' except 'a' -> 'A'.
        let mut raw = vec![0u8; 0x62 * 2];
        raw[0x61 * 2] = b'A';
        let checksum = table_checksum(&raw);
        table.load(&raw, raw.len() as u64, checksum);

        assert_eq!(table.upper(b'a' as u16), b'A' as u16);
        // Zero slot: falls through to identity.
        assert_eq!(table.upper(b'b' as u16), b'b' as u16);
        // Beyond the table: identity.
        assert_eq!(table.upper(0x4E00), 0x4E00);
    }

    #[test]
    fn name_hash_of_empty_is_zero() {
        assert_eq!(name_hash(&[]), 0);
    }

    #[test]
    fn name_hash_covers_both_bytes() {
        let a = name_hash(&[0x0041]);
        let b = name_hash(&[0x4100]);
        assert_ne!(a, b);
    }

    #[test]
    fn table_checksum_of_empty_is_zero() {
        assert_eq!(table_checksum(&[]), 0);
    }
}

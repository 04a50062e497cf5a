// Hex dump with zero-run collapsing
// Sixteen bytes per line; a run of repeated all-zero lines prints once
// followed by "*".

use std::io::{self, Write};

pub fn hexdump(out: &mut dyn Write, data: &[u8]) -> io::Result<()> {
    let mut skipping = 0usize;
    let lines = data.len() / 0x10;

    for line in 0..lines {
        let chunk = &data[line * 0x10..(line + 1) * 0x10];
        if line != lines - 1 && chunk.iter().all(|&b| b == 0) {
            skipping += 1;
            match skipping {
                1 => {}
                2 => {
                    writeln!(out, "*")?;
                    continue;
                }
                _ => continue,
            }
        } else {
            skipping = 0;
        }

        write!(out, "{:08X}:  ", line * 0x10)?;
        for b in chunk {
            write!(out, "{:02X} ", b)?;
        }
        write!(out, " ")?;
        for &b in chunk {
            let ch = if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            };
            write!(out, "{}", ch)?;
        }
        writeln!(out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_zero_runs() {
        let mut data = vec![0u8; 0x40];
        data[0] = 0xAB;
        let mut out = Vec::new();
        hexdump(&mut out, &data).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("AB"));
        assert!(text.contains("*\n"));
        // First line, one printed zero line, the star, the final line.
        assert_eq!(text.lines().count(), 4);
    }

    #[test]
    fn prints_ascii_gutter() {
        let mut data = vec![0u8; 0x10];
        data[..5].copy_from_slice(b"hello");
        let mut out = Vec::new();
        hexdump(&mut out, &data).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("hello"));
    }
}

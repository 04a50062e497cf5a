// Backing device access
// A filesystem image held in a regular file or block device, addressed
// by byte offset. Sector and cluster arithmetic lives above this layer.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::error::FatscopeError;

/// An open filesystem image. The byte length is captured at open time.
pub struct Device {
    path: PathBuf,
    file: File,
    read_only: bool,
    size: u64,
}

impl Device {
    /// Open a file or block device for inspection.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self, FatscopeError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)?;
        let size = file.metadata()?.len();

        info!(
            "Opened image {} ({} bytes, {})",
            path.display(),
            size,
            if read_only { "read-only" } else { "read-write" }
        );

        Ok(Self {
            path,
            file,
            read_only,
            size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Positional read. A short read is an error.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), FatscopeError> {
        debug!("read {:#x}..{:#x}", offset, offset + buf.len() as u64);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    /// Positional write. Refused on a read-only open.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), FatscopeError> {
        if self.read_only {
            return Err(FatscopeError::ReadOnly);
        }
        debug!("write {:#x}..{:#x}", offset, offset + data.len() as u64);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn read_back_written_bytes() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[0u8; 1024]).unwrap();

        let mut dev = Device::open(tmp.path(), false).unwrap();
        assert_eq!(dev.size(), 1024);

        dev.write_at(512, b"hello").unwrap();
        let mut buf = [0u8; 5];
        dev.read_at(512, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn write_refused_when_read_only() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[0u8; 512]).unwrap();

        let mut dev = Device::open(tmp.path(), true).unwrap();
        assert!(matches!(
            dev.write_at(0, b"x"),
            Err(FatscopeError::ReadOnly)
        ));
    }

    #[test]
    fn short_read_is_an_error() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[0u8; 100]).unwrap();

        let mut dev = Device::open(tmp.path(), true).unwrap();
        let mut buf = [0u8; 64];
        assert!(dev.read_at(90, &mut buf).is_err());
    }
}

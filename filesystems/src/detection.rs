// Dialect detection
// Sector 0 decides everything: an exFAT name field selects the exFAT
// implementation, otherwise the sector must validate as a FAT12/16/32
// boot sector and the cluster count classifies the dialect.

use std::path::Path;

use log::info;

use fatscope_core::{Device, FatscopeError};

use crate::exfat::{self, ExFatFilesystem};
use crate::fat::{self, FatFilesystem};
use crate::ops::FilesystemOps;

/// Open a filesystem image and return the matching dialect behind the
/// operation facade.
pub fn open_image<P: AsRef<Path>>(
    path: P,
    read_only: bool,
) -> Result<Box<dyn FilesystemOps>, FatscopeError> {
    let mut device = Device::open(path, read_only)?;

    let mut sector = [0u8; 512];
    device.read_at(0, &mut sector)?;

    if exfat::is_exfat(&sector) {
        info!("image detected as exFAT");
        return Ok(Box::new(ExFatFilesystem::new(device, &sector)?));
    }

    if let Some(geometry) = fat::probe(&sector) {
        info!("image detected as {}", geometry.fat_type.name());
        return Ok(Box::new(FatFilesystem::new(device, geometry)));
    }

    Err(FatscopeError::UnsupportedImage(
        device.path().display().to_string(),
    ))
}

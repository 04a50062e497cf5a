// Filesystem object layer: a polymorphic facade over FAT12/16/32 and
// exFAT images, plus the pieces it is built from.

pub mod detection;
pub mod dircache;
pub mod fat;
pub mod fat_common;
pub mod exfat;
pub mod nls;
pub mod ops;
pub mod volume;

pub use detection::open_image;
pub use fat::FatFilesystem;
pub use exfat::ExFatFilesystem;
pub use ops::{CreateOptions, DirEntryInfo, FileStat, FilesystemOps};
pub use volume::Volume;

/// How many trailing lines `contents` prints.
pub const TAIL_COUNT: usize = 10;

/// Directory entries are 32 bytes in every dialect handled here.
pub const DENTRY_SIZE: usize = 32;

/// Longest file name, in UTF-16 code units.
pub const MAX_NAME_LENGTH: usize = 255;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FatscopeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported filesystem image: {0}")]
    UnsupportedImage(String),

    #[error("Invalid cluster index: {0}")]
    InvalidCluster(u32),

    #[error("Invalid FAT entry for cluster {cluster}: {value:#x}")]
    InvalidFatEntry { cluster: u32, value: u32 },

    #[error("No such file or directory: {0}")]
    NotFound(String),

    #[error("File exists: {0}")]
    Exists(String),

    #[error("No free cluster available")]
    Exhausted,

    #[error("Corrupt filesystem structure: {0}")]
    Corrupt(String),

    #[error("Operation not implemented: {0}")]
    Unimplemented(&'static str),

    #[error("Image was opened read-only")]
    ReadOnly,
}

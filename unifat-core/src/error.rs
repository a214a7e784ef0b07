use std::io;
use std::path::PathBuf;

use crate::CpuIdentity;

/// Everything that can go wrong while opening, matching or loading a universal binary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no such file: {}", .0.display())]
    NotFound(PathBuf),

    #[error("not a universal binary: {0}")]
    InvalidFormat(String),

    #[error("unsupported container variant: {0}")]
    UnsupportedVariant(String),

    /// The container header parsed, but no architecture record held a usable image.
    #[error("no valid architectures found in {}", .0.display())]
    NoValidArchitectures(PathBuf),

    #[error("no architecture compatible with host {host}")]
    NoMatchingArchitecture { host: CpuIdentity },

    #[error("failed to load image: {0}")]
    LoadFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

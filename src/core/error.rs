//! Error types for the volume store

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Main error type for the store
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open {path}: {reason}")]
    OpenFailed { path: PathBuf, reason: String },

    #[error("invalid format in {path}: {reason}")]
    FormatInvalid { path: PathBuf, reason: String },

    #[error("short {op}: got {got} of {expected} bytes")]
    IoShort {
        op: &'static str,
        expected: u64,
        got: u64,
    },

    #[error("brick out of range: {0}")]
    OutOfRange(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("checksum mismatch in {path}")]
    ChecksumMismatch { path: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn open_failed(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        Error::OpenFailed {
            path: path.as_ref().to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn format_invalid(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        Error::FormatInvalid {
            path: path.as_ref().to_path_buf(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

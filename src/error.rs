//! Error types for unpacking operations.

use thiserror::Error;

/// Errors that can occur while unpacking a container.
///
/// Only [`Error::InvalidFormat`], [`Error::UnsupportedCompression`] and
/// [`Error::Encrypted`] abort a run; resource-level failures are logged
/// and the offending asset skipped.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("invalid container: {0}")]
    InvalidFormat(String),

    #[error("invalid compression type: 0x{0:04x}")]
    UnsupportedCompression(u16),

    #[error("book is encrypted")]
    Encrypted,
}

pub type Result<T> = std::result::Result<T, Error>;

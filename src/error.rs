use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    /// Lookup miss. Ordinary control flow for callers, never fatal.
    NotFound,
    /// Strict insert hit an existing key.
    DuplicateKey,
    /// Bad magic, checksum mismatch, out-of-order sequence, invalid range
    /// endpoints, zero-address descriptor. Fatal to the affected subsystem.
    Corruption(String),
    /// No free segment and the allocator cannot extend the log, or a
    /// group-commit waiter timed out. Fatal.
    ResourceExhausted(String),
    /// Write attempted against a frozen/read-only view, or an operation that
    /// needs a different engine state. Recoverable.
    InvalidState(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::NotFound => write!(f, "Key not found"),
            Error::DuplicateKey => write!(f, "Duplicate key"),
            Error::Corruption(msg) => write!(f, "Corruption: {}", msg),
            Error::ResourceExhausted(msg) => write!(f, "Resource exhausted: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

//! The crate's error type and result alias.
//!
//! Kept as a flat, hand-rolled enum rather than pulling in `thiserror`, in
//! keeping with how this storage engine's upstream error handling is built.

use std::fmt;
use std::io;

/// Errors returned by the storage engine.
#[derive(Debug)]
pub enum Error {
    /// Any underlying filesystem error.
    Io(io::Error),
    /// A file in the database directory has a name that isn't a 32-bit
    /// decimal segment id.
    CorruptDirectory(String),
    /// A positional read returned fewer bytes than the index entry
    /// promised, at a location that is not an ordinary torn write tail.
    ShortRead { expected: usize, actual: usize },
    /// The caller passed a reserved sentinel value to `put`.
    ValueReserved,
    /// An operation that is declared but intentionally unimplemented.
    NotImplemented(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "I/O error: {err}"),
            Error::CorruptDirectory(name) => {
                write!(f, "corrupt database directory: entry {name:?} is not a segment id")
            }
            Error::ShortRead { expected, actual } => {
                write!(f, "short read: expected {expected} bytes, got {actual}")
            }
            Error::ValueReserved => write!(f, "value is a reserved sentinel and cannot be stored"),
            Error::NotImplemented(op) => write!(f, "{op} is not implemented"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

/// A specialized `Result` for storage engine operations.
pub type Result<T> = std::result::Result<T, Error>;

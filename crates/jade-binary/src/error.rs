use std::io;
use std::string::FromUtf8Error;
use thiserror::Error;

/// Errors that can occur during binary reads and writes.
#[derive(Error, Debug)]
pub enum BinaryError {
    /// Not enough bytes remaining in the buffer for the requested operation.
    #[error("not enough bytes in buffer: needed {needed}, remaining {remaining}")]
    UnexpectedEof { needed: usize, remaining: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid UTF-8 string data: {0}")]
    InvalidUtf8(#[from] FromUtf8Error),

    #[error("invalid data: {0}")]
    InvalidData(String),
}

pub type Result<T> = std::result::Result<T, BinaryError>;

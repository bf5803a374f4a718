//! Tape image error types.

use thiserror::Error;

/// Errors raised by tape image I/O.
#[derive(Debug, Error)]
pub enum TapeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record too large: {size} bytes (max {max})")]
    RecordTooLarge { size: usize, max: usize },

    #[error("tape image corrupted at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    #[error("tape image is not writable")]
    NotWritable,
}

impl TapeError {
    /// Returns whether the error came from the operating system rather than
    /// from the image contents.
    pub fn is_io(&self) -> bool {
        matches!(self, TapeError::Io(_))
    }
}

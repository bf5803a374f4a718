//! # chaosnet-tape
//!
//! Tape images for the RTAPE server.
//!
//! A tape image is a plain file holding a sequence of records:
//! - Data records framed by their length before and after the data
//! - File marks (a zero length word)
//! - An end-of-medium word after the last record written

pub mod error;
pub mod tape;

pub use error::TapeError;
pub use tape::{Record, RecordReader, TapeImage};

/// Largest record a tape image may hold: what one RTAPE reply's 16-bit
/// length field can describe.
pub const MAX_RECORD: usize = u16::MAX as usize;

/// Size of a record length word.
pub const LENGTH_WORD_SIZE: usize = 4;

/// Length word of a file mark.
pub const MARK_WORD: u32 = 0;

/// Length word marking the end of the recorded medium.
pub const EOM_WORD: u32 = 0xFFFF_FFFF;

/// Bit flagging a record the drive could not read.
pub const ERROR_BIT: u32 = 0x8000_0000;

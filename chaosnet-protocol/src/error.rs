//! Protocol error types.

use thiserror::Error;

/// Errors raised while encoding or decoding Chaosnet packets and the
/// RTAPE record stream.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("packet too large: {size} bytes (max {max})")]
    PacketTooLarge { size: usize, max: usize },

    #[error("truncated packet: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("bad CHUDP envelope: version {version}, type {kind}")]
    BadEnvelope { version: u8, kind: u8 },

    #[error("checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    #[error("unexpected packet opcode {0:#o}")]
    UnknownOpcode(u8),

    #[error("unknown RTAPE command: {0}")]
    UnknownCommand(u8),

    #[error("bad record stream version: {0:?}")]
    BadVersion(String),

    #[error("bad mount request: {0}")]
    BadMount(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Returns whether this error ends the session it was raised on.
    ///
    /// Packet-level errors only spoil the packet; record-stream errors
    /// leave the deframer without a way to resynchronise.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::BadVersion(_) | ProtocolError::UnknownCommand(_) | ProtocolError::Io(_)
        )
    }
}

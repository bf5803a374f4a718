//! Transport error types.

use chaosnet_protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

/// Reasons an RFC handshake did not open a connection.
#[derive(Debug, Error)]
pub enum RfcError {
    #[error("connection refused: {0}")]
    Refused(String),

    #[error("connection closed during handshake")]
    Closed,
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot connect to {}: {source}", .path.display())]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("cannot resolve {0}")]
    Resolve(String),

    #[error("RFC failed: {0}")]
    Rfc(#[from] RfcError),

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Returns whether the error means the other end went away.
    pub fn is_closed(&self) -> bool {
        match self {
            TransportError::PeerClosed | TransportError::Rfc(RfcError::Closed) => true,
            TransportError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

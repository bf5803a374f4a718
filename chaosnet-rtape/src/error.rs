//! Server error types.
//!
//! Tape faults the client can recover from are not errors here: the engine
//! reports them in status replies. These are the failures that end a
//! session or the whole server.

use crate::config::ConfigError;
use chaosnet_client::TransportError;
use chaosnet_protocol::ProtocolError;
use chaosnet_tape::TapeError;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("framing error: {0}")]
    Framing(#[from] ProtocolError),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("peer closed: {0}")]
    PeerClosed(String),

    #[error("tape error: {0}")]
    Tape(#[from] TapeError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("no version line within {0} seconds")]
    VersionTimeout(u64),
}

impl ServerError {
    /// Returns whether the error should stop the server rather than just the
    /// session it happened on.
    pub fn is_fatal_to_process(&self) -> bool {
        matches!(self, ServerError::ProtocolViolation(_) | ServerError::Config(_))
    }

    /// Returns whether the session ended because the peer went away.
    pub fn is_peer_closed(&self) -> bool {
        match self {
            ServerError::PeerClosed(_) => true,
            ServerError::Transport(e) => e.is_closed(),
            _ => false,
        }
    }
}

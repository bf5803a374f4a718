//! # chaosnet-rtape
//!
//! RTAPE remote tape server.
//!
//! This crate provides:
//! - The RTAPE engine: mount, read, write, space, rewind and status
//!   commands against tape images
//! - Per-connection session state
//! - The connection supervisor that listens through the local NCP and runs
//!   one worker task per connection
//! - Configuration from YAML and environment variables

pub mod config;
pub mod error;
pub mod handler;
pub mod server;
pub mod session;

pub use config::{Config, ConfigError, NcpConfig, RtapeConfig};
pub use error::ServerError;
pub use handler::{CommandHandler, Outcome};
pub use server::{Server, ServerStats};
pub use session::Session;

//! # chaosnet-client
//!
//! Transport to the Chaosnet NCP.
//!
//! This crate provides:
//! - Local stream connections with the RFC/OPN handshake
//! - Local packet-channel connections with whole-packet send and receive
//! - UDP-direct and CHUDP endpoints with packet and ack numbering
//! - The [`PacketLink`] seam the RTAPE engine drives

pub mod connection;
pub mod error;
pub mod link;
pub mod udp;

pub use connection::{
    open_local_packet, open_local_stream, PacketConnection, StreamConnection, PACKET_SOCKET,
    STREAM_SOCKET,
};
pub use error::{RfcError, TransportError};
pub use link::PacketLink;
pub use udp::{open_udp, UdpConnection};

//! # chaosnet-protocol
//!
//! Wire formats for Chaosnet access and the RTAPE record stream.
//!
//! This crate provides:
//! - The in-memory [`Packet`] and Chaosnet [`Opcode`] values
//! - The local NCP packet-channel framing (4-byte header + payload)
//! - The UDP-direct and CHUDP encapsulations, including the legacy
//!   word-swapped payload and the ones'-complement checksum
//! - RTAPE commands, replies, status blocks and the record-stream deframer
//!
//! Nothing in here performs I/O.

pub mod codec;
pub mod deframer;
pub mod error;
pub mod message;
pub mod packet;
pub mod udp;

pub use codec::{encode_local_packet, Decoder, LOCAL_HEADER_SIZE};
pub use deframer::{Deframed, Deframer, DeframerState};
pub use error::ProtocolError;
pub use message::{
    encode_reply, parse_count, Command, CommandOp, MountMode, MountRequest, ReplyOp, StatusBlock,
    StatusFlags, RECORD_STREAM_VERSION,
};
pub use packet::{Address, Opcode, Packet};
pub use udp::{checksum, Encapsulation, CHAOS_HEADER_SIZE, CHUDP_ENVELOPE_SIZE};

/// Largest Chaosnet packet including control fields, per the legacy MTU.
pub const MAX_PACKET: usize = 492;

/// Largest packet payload in octets.
pub const MAX_DATA: usize = 488;

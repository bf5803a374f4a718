//! The packet seam between a connection and the RTAPE engine.

use crate::error::TransportError;
use async_trait::async_trait;
use chaosnet_protocol::Packet;

/// A connection that moves whole Chaosnet packets.
#[async_trait]
pub trait PacketLink: Send {
    /// Sends one packet.
    async fn send_packet(&mut self, packet: &Packet) -> Result<(), TransportError>;

    /// Waits for the next packet.
    async fn recv_packet(&mut self) -> Result<Packet, TransportError>;

    /// Returns whether input from the peer is waiting, without blocking.
    fn input_pending(&mut self) -> bool;
}

//! Chaosnet over UDP, for hosts without an NCP.

use crate::error::TransportError;
use crate::link::PacketLink;
use async_trait::async_trait;
use bytes::Bytes;
use chaosnet_protocol::{Address, Encapsulation, Opcode, Packet};
use futures::FutureExt;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::debug;

/// Receive buffer size; comfortably above the largest encapsulated packet.
const DATAGRAM_BUFFER_SIZE: usize = 1024;

/// Sequence numbers closer than this are "newer" modulo 2^16.
const SEQUENCE_HALF_RANGE: u16 = 0o100000;

/// Binds a local UDP port and associates it with one peer.
pub async fn open_udp(
    local_port: u16,
    peer_host: &str,
    peer_port: u16,
    encapsulation: Encapsulation,
) -> Result<UdpConnection, TransportError> {
    let peer = tokio::net::lookup_host((peer_host, peer_port))
        .await
        .map_err(|_| TransportError::Resolve(peer_host.to_string()))?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| TransportError::Resolve(peer_host.to_string()))?;

    let bind_addr = SocketAddr::from(([0, 0, 0, 0], local_port));
    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|source| TransportError::Bind {
            addr: bind_addr.to_string(),
            source,
        })?;
    socket.connect(peer).await?;

    debug!(
        "UDP endpoint {} associated with {} ({:?})",
        socket.local_addr()?,
        peer,
        encapsulation
    );

    Ok(UdpConnection {
        socket,
        peer,
        encapsulation,
        local: Address::default(),
        remote: Address::default(),
        packet_number: 0,
        ack_number: 0,
        remote_window: 0,
    })
}

/// A Chaosnet connection carried in UDP datagrams.
pub struct UdpConnection {
    socket: UdpSocket,
    peer: SocketAddr,
    encapsulation: Encapsulation,
    local: Address,
    remote: Address,
    packet_number: u16,
    ack_number: u16,
    remote_window: u16,
}

impl UdpConnection {
    /// Sets the Chaosnet addresses of both ends.
    pub fn with_addresses(mut self, local: Address, remote: Address) -> Self {
        self.local = local;
        self.remote = remote;
        self
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn local(&self) -> Address {
        self.local
    }

    pub fn remote(&self) -> Address {
        self.remote
    }

    /// Number of the last packet sent.
    pub fn packet_number(&self) -> u16 {
        self.packet_number
    }

    /// Number of the newest packet received.
    pub fn ack_number(&self) -> u16 {
        self.ack_number
    }

    /// Window size the remote end last advertised.
    pub fn remote_window(&self) -> u16 {
        self.remote_window
    }

    /// Starts over as a new connection between `local` and `remote`:
    /// numbering restarts and the remote window is forgotten.
    pub fn restart(&mut self, local: Address, remote: Address) {
        self.local = local;
        self.remote = remote;
        self.packet_number = 0;
        self.ack_number = 0;
        self.remote_window = 0;
    }

    /// Sends a packet with the next packet number and the current ack.
    /// Returns the packet as it went out.
    pub async fn send(
        &mut self,
        opcode: Opcode,
        data: impl Into<Bytes>,
    ) -> Result<Packet, TransportError> {
        self.packet_number = self.packet_number.wrapping_add(1);
        let packet = Packet::new(opcode, data)
            .with_addresses(self.remote, self.local)
            .with_numbers(self.packet_number, self.ack_number);

        let datagram = self.encapsulation.encode(&packet)?;
        self.socket.send(&datagram).await?;
        debug!("Sent {}", packet);
        Ok(packet)
    }

    /// Receives one packet and updates the connection bookkeeping.
    ///
    /// UDP has no end of stream: an empty or malformed datagram is a
    /// protocol error for that datagram only, and the connection stays
    /// usable.
    pub async fn receive(&mut self) -> Result<Packet, TransportError> {
        let mut buf = [0u8; DATAGRAM_BUFFER_SIZE];
        let n = self.socket.recv(&mut buf).await?;
        if n == 0 {
            debug!("Empty datagram from {}", self.peer);
        }

        let packet = self.encapsulation.decode(&buf[..n])?;
        debug!("Received {}", packet);
        self.track(&packet);
        Ok(packet)
    }

    fn track(&mut self, packet: &Packet) {
        if packet.packet_number.wrapping_sub(self.ack_number) < SEQUENCE_HALF_RANGE {
            self.ack_number = packet.packet_number;
        }

        if packet.opcode == Opcode::OPN {
            self.remote = packet.source;
            self.learn_window(packet);
        } else if packet.opcode == Opcode::STS {
            self.learn_window(packet);
        }
    }

    fn learn_window(&mut self, packet: &Packet) {
        if packet.data.len() >= 4 {
            self.remote_window = u16::from_be_bytes([packet.data[2], packet.data[3]]);
        }
    }
}

#[async_trait]
impl PacketLink for UdpConnection {
    async fn send_packet(&mut self, packet: &Packet) -> Result<(), TransportError> {
        self.send(packet.opcode, packet.data.clone()).await?;
        Ok(())
    }

    async fn recv_packet(&mut self) -> Result<Packet, TransportError> {
        self.receive().await
    }

    fn input_pending(&mut self) -> bool {
        let mut probe = [0u8; 1];
        self.socket.peek_from(&mut probe).now_or_never().is_some()
    }
}

//! Connections to the local NCP.
//!
//! The NCP listens on two Unix sockets in its socket directory: one
//! carrying a byte stream after an RFC handshake, one carrying whole
//! packets in the local packet framing.

use crate::error::{RfcError, TransportError};
use crate::link::PacketLink;
use async_trait::async_trait;
use chaosnet_protocol::{encode_local_packet, Decoder, Packet};
use futures::FutureExt;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

/// Name of the NCP stream socket.
pub const STREAM_SOCKET: &str = "chaos_stream";

/// Name of the NCP packet socket.
pub const PACKET_SOCKET: &str = "chaos_packet";

/// Size of the buffer the RFC reply is read into.
const RFC_REPLY_SIZE: usize = 500;

async fn connect_named(socket_dir: &Path, name: &str) -> Result<UnixStream, TransportError> {
    let path = socket_dir.join(name);
    debug!("Connecting to {}", path.display());
    UnixStream::connect(&path)
        .await
        .map_err(|source| TransportError::Connect { path, source })
}

/// Opens a stream connection to the NCP.
pub async fn open_local_stream(
    socket_dir: impl AsRef<Path>,
) -> Result<StreamConnection, TransportError> {
    let stream = connect_named(socket_dir.as_ref(), STREAM_SOCKET).await?;
    Ok(StreamConnection::new(stream))
}

/// Opens a packet-channel connection to the NCP.
pub async fn open_local_packet(
    socket_dir: impl AsRef<Path>,
) -> Result<PacketConnection, TransportError> {
    let stream = connect_named(socket_dir.as_ref(), PACKET_SOCKET).await?;
    Ok(PacketConnection::new(stream))
}

/// A byte-stream connection through the NCP.
pub struct StreamConnection<S = UnixStream> {
    stream: S,
}

impl<S> StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Asks the NCP to open a connection to `contact` on `host`.
    ///
    /// Succeeds only if the NCP answers with `OPN `; the rest of the reply
    /// is ignored. The connection is handed back only when it opened.
    pub async fn handshake_rfc(
        mut self,
        host: &str,
        contact: &str,
        args: Option<&[u8]>,
    ) -> Result<Self, TransportError> {
        let mut request = format!("RFC {} {}", host, contact).into_bytes();
        if let Some(args) = args.filter(|a| !a.is_empty()) {
            request.push(b' ');
            request.extend_from_slice(args);
        }
        request.extend_from_slice(b"\r\n");

        self.stream.write_all(&request).await?;
        self.stream.flush().await?;

        let mut reply = [0u8; RFC_REPLY_SIZE];
        let n = self.stream.read(&mut reply).await?;
        if n == 0 {
            return Err(RfcError::Closed.into());
        }
        if n < 4 || &reply[..4] != b"OPN " {
            let text = String::from_utf8_lossy(&reply[..n]).trim_end().to_string();
            debug!("RFC {} {} refused: {}", host, contact, text);
            return Err(RfcError::Refused(text).into());
        }

        debug!("RFC {} {} opened", host, contact);
        Ok(self)
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

/// A packet-channel connection to the NCP.
pub struct PacketConnection<S = UnixStream> {
    stream: S,
    decoder: Decoder,
}

impl<S> PacketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            decoder: Decoder::new(),
        }
    }

    /// Sends one packet.
    pub async fn send(&mut self, packet: &Packet) -> Result<(), TransportError> {
        let encoded = encode_local_packet(packet.opcode, &packet.data)?;
        self.stream.write_all(&encoded).await?;
        Ok(())
    }

    /// Receives one whole packet.
    ///
    /// A zero-byte read before the packet is complete means the NCP closed
    /// the channel.
    pub async fn receive(&mut self) -> Result<Packet, TransportError> {
        loop {
            if let Some(packet) = self.decoder.decode_packet()? {
                return Ok(packet);
            }

            let n = self.stream.read_buf(self.decoder.buffer_mut()).await?;
            if n == 0 {
                if self.decoder.buffered() > 0 {
                    debug!(
                        "Channel closed with {} bytes of a partial packet buffered",
                        self.decoder.buffered()
                    );
                }
                return Err(TransportError::PeerClosed);
            }
        }
    }

    /// Returns whether the peer has sent anything not yet received.
    ///
    /// Polls the socket once; whatever is read stays buffered for the next
    /// [`receive`](Self::receive). End of stream and read errors count as
    /// pending so that the next receive reports them.
    pub fn input_pending(&mut self) -> bool {
        if self.decoder.buffered() > 0 {
            return true;
        }
        self.stream
            .read_buf(self.decoder.buffer_mut())
            .now_or_never()
            .is_some()
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }
}

#[async_trait]
impl<S> PacketLink for PacketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_packet(&mut self, packet: &Packet) -> Result<(), TransportError> {
        self.send(packet).await
    }

    async fn recv_packet(&mut self) -> Result<Packet, TransportError> {
        self.receive().await
    }

    fn input_pending(&mut self) -> bool {
        PacketConnection::input_pending(self)
    }
}

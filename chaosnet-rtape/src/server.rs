//! Connection supervisor.
//!
//! Listens for RTAPE requests through the local NCP. Each RFC hands the
//! packet channel it arrived on to a new worker task, and the listener
//! immediately opens a fresh channel and listens again.

use crate::config::Config;
use crate::error::ServerError;
use crate::handler::{CommandHandler, Outcome};
use crate::session::Session;
use chaosnet_client::{open_local_packet, PacketConnection, PacketLink, TransportError};
use chaosnet_protocol::{Opcode, Packet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Pause before listening again after the listener's channel failed.
const RELISTEN_DELAY: Duration = Duration::from_secs(1);

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub errors_total: AtomicU64,
}

/// What woke a worker up.
enum Event {
    Packet(Result<Packet, TransportError>),
    VersionTimeout,
    Shutdown,
}

/// RTAPE server.
pub struct Server {
    config: Arc<Config>,
    handler: Arc<CommandHandler>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server.
    pub fn new(config: Config) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let handler = CommandHandler::new(Arc::new(config.rtape.clone()));
        Self {
            config: Arc::new(config),
            handler: Arc::new(handler),
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Runs the listener until shutdown.
    ///
    /// Fails only if the NCP cannot be reached.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            "Server listening for {} via {}",
            self.config.rtape.contact,
            self.config.ncp.socket_dir.display()
        );

        let mut shutdown_rx = self.shutdown.subscribe();
        let result = self.listen(&mut shutdown_rx).await;

        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn listen(&self, shutdown_rx: &mut broadcast::Receiver<()>) -> Result<(), ServerError> {
        let listen_args = self.config.rtape.listen_args();

        loop {
            let mut listener = open_local_packet(&self.config.ncp.socket_dir).await?;
            listener
                .send(&Packet::new(Opcode::LSN, listen_args.clone().into_bytes()))
                .await?;
            tracing::debug!("Sent LSN {}", listen_args);

            tokio::select! {
                result = listener.receive() => {
                    match result {
                        Ok(packet) if packet.opcode == Opcode::RFC => {
                            self.spawn_worker(listener, packet.text());
                        }
                        Ok(packet) => {
                            tracing::warn!("Listener got {} instead of RFC: {}", packet.opcode, packet.text());
                        }
                        Err(e) => {
                            tracing::warn!("Listener channel failed: {}", e);
                            tokio::time::sleep(RELISTEN_DELAY).await;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    return Ok(());
                }
            }
        }
    }

    fn spawn_worker(&self, connection: PacketConnection, peer: String) {
        self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

        let handler = self.handler.clone();
        let stats = self.stats.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut connection = connection;
            tracing::info!("[{}] Open connection", peer);

            let result =
                Self::serve_connection(&mut connection, &peer, &handler, &mut shutdown_rx).await;

            match result {
                Ok(()) => tracing::info!("[{}] Session closed", peer),
                Err(e) if e.is_peer_closed() => tracing::info!("[{}] {}", peer, e),
                Err(e) => {
                    if e.is_fatal_to_process() {
                        tracing::error!("[{}] {}", peer, e);
                    } else {
                        tracing::warn!("[{}] {}", peer, e);
                    }
                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                }
            }

            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        });
    }

    /// Runs one RTAPE session: answers OPN, then feeds DAT packets to the
    /// handler until the session closes.
    pub async fn serve_connection<L>(
        link: &mut L,
        peer: &str,
        handler: &CommandHandler,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError>
    where
        L: PacketLink + ?Sized,
    {
        let mut session = Session::new(peer);
        link.send_packet(&Packet::control(Opcode::OPN)).await?;

        let version_timeout = handler.config().version_timeout();
        let deadline = version_timeout.map(|timeout| Instant::now() + timeout);

        loop {
            let awaiting_version = session.awaiting_version();
            let event = tokio::select! {
                result = link.recv_packet() => Event::Packet(result),
                _ = version_deadline(deadline, awaiting_version) => Event::VersionTimeout,
                _ = shutdown_rx.recv() => Event::Shutdown,
            };

            let packet = match event {
                Event::Packet(result) => result?,
                Event::VersionTimeout => {
                    link.send_packet(&Packet::control(Opcode::CLS)).await?;
                    let secs = version_timeout.map(|t| t.as_secs()).unwrap_or_default();
                    return Err(ServerError::VersionTimeout(secs));
                }
                Event::Shutdown => {
                    tracing::debug!("[{}] Shutdown signal received", peer);
                    link.send_packet(&Packet::new(Opcode::CLS, &b"Server shutting down"[..]))
                        .await?;
                    return Ok(());
                }
            };

            match packet.opcode {
                Opcode::DAT => {
                    tracing::debug!("[{}] Received {} bytes", peer, packet.data.len());
                    if handler.handle_data(&mut session, link, &packet.data).await?
                        == Outcome::Close
                    {
                        return Ok(());
                    }
                }
                Opcode::LOS | Opcode::CLS => {
                    return Err(ServerError::PeerClosed(format!(
                        "got {}: {}",
                        packet.opcode,
                        packet.text()
                    )));
                }
                _ => {
                    return Err(ServerError::ProtocolViolation(format!(
                        "unexpected packet {}",
                        packet
                    )));
                }
            }
        }
    }

    /// Signals the server and every worker to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}

/// Resolves at the deadline while the version line is still outstanding;
/// otherwise never.
async fn version_deadline(deadline: Option<Instant>, awaiting_version: bool) {
    match deadline {
        Some(deadline) if awaiting_version => tokio::time::sleep_until(deadline).await,
        _ => std::future::pending().await,
    }
}

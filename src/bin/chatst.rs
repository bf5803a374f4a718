//! chatst - Chaosnet packet console
//!
//! Sends hand-typed control packets through the local NCP packet channel,
//! or straight to a peer over UDP, and prints every packet that comes back.
//! Useful for poking at a listener such as rtape by hand.
//!
//! Commands: `lsn ARGS`, `rfc ARGS`, `opn [DATA]`, `ans [DATA]`, `sts`,
//! `sns`, `los [TEXT]`, `cls [TEXT]`, `quit`.

use chaosnet_client::{open_local_packet, open_udp, PacketConnection, TransportError, UdpConnection};
use chaosnet_protocol::{Address, Encapsulation, Opcode, Packet};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Window size this console advertises in STS.
const LOCAL_WINDOW: u16 = 3;

/// Addresses a UDP RFC starts a fresh connection with.
const RFC_LOCAL: Address = Address::new(0o177001, 1);
const RFC_REMOTE: Address = Address::new(0o177002, 0);

#[derive(Parser)]
#[command(name = "chatst")]
#[command(about = "Send Chaosnet control packets by hand and show the replies")]
#[command(version)]
#[command(group(clap::ArgGroup::new("transport").required(true).args(["ncp", "udp"])))]
struct Cli {
    /// Connect through the local NCP
    #[arg(short = 'n', long)]
    ncp: bool,

    /// Connect straight to PEER over UDP
    #[arg(short = 'u', long, value_name = "PEER")]
    udp: Option<String>,

    /// Local UDP port
    #[arg(long, default_value_t = 44041)]
    local_port: u16,

    /// Peer UDP port
    #[arg(long, default_value_t = 44042)]
    peer_port: u16,

    /// Speak CHUDP instead of plain Chaosnet-over-UDP
    #[arg(long, requires = "udp")]
    chudp: bool,

    /// Directory holding the NCP sockets
    #[arg(long, env = "CHAOS_SOCKET_DIR", default_value = "/tmp")]
    socket_dir: PathBuf,

    /// Verbose operation: log packet traffic
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// One console command.
#[derive(Debug, PartialEq, Eq)]
enum Action {
    Quit,
    Nothing,
    Send(Opcode, Vec<u8>),
    Rfc(Vec<u8>),
    Status,
    Unknown(String),
}

fn parse_command(line: &str) -> Action {
    let line = line.trim_end_matches(&['\r', '\n'][..]);
    let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
    let data = rest.as_bytes().to_vec();

    match word {
        "" if rest.is_empty() => Action::Nothing,
        "quit" => Action::Quit,
        "lsn" => Action::Send(Opcode::LSN, data),
        "rfc" => Action::Rfc(data),
        "opn" => Action::Send(Opcode::OPN, data),
        "ans" => Action::Send(Opcode::ANS, data),
        "sts" => Action::Status,
        "sns" => Action::Send(Opcode::SNS, Vec::new()),
        "los" => Action::Send(Opcode::LOS, data),
        "cls" => Action::Send(Opcode::CLS, data),
        _ => Action::Unknown(line.to_string()),
    }
}

/// STS data: the receipt (last packet number seen) and our window.
fn status_data(receipt: u16, window: u16) -> Vec<u8> {
    let mut data = receipt.to_be_bytes().to_vec();
    data.extend_from_slice(&window.to_be_bytes());
    data
}

/// Where packets go.
enum Endpoint {
    Ncp(PacketConnection),
    Udp(UdpConnection),
}

impl Endpoint {
    async fn send(&mut self, opcode: Opcode, data: Vec<u8>) -> Result<(), TransportError> {
        match self {
            Endpoint::Ncp(conn) => conn.send(&Packet::new(opcode, data)).await,
            Endpoint::Udp(conn) => {
                let sent = conn.send(opcode, data).await?;
                println!("{}", describe(&sent, true));
                Ok(())
            }
        }
    }

    async fn receive(&mut self) -> Result<Packet, TransportError> {
        match self {
            Endpoint::Ncp(conn) => conn.receive().await,
            Endpoint::Udp(conn) => conn.receive().await,
        }
    }

    /// An RFC over UDP starts a new connection.
    fn restart(&mut self) {
        if let Endpoint::Udp(conn) = self {
            conn.restart(RFC_LOCAL, RFC_REMOTE);
        }
    }

    fn is_udp(&self) -> bool {
        matches!(self, Endpoint::Udp(_))
    }
}

/// Formats a packet for the console. The NCP channel carries no
/// addressing, so only UDP packets show the full header.
fn describe(packet: &Packet, full: bool) -> String {
    if full {
        return packet.to_string();
    }
    if packet.data.is_empty() {
        packet.opcode.to_string()
    } else if packet.opcode.is_data() {
        format!("{} L{:03o}", packet.opcode, packet.data.len())
    } else {
        format!("{}: {}", packet.opcode, packet.text())
    }
}

enum Event {
    Line(Option<String>),
    Packet(Result<Packet, TransportError>),
}

fn prompt() {
    print!(">");
    std::io::stdout().flush().ok();
}

async fn console(mut endpoint: Endpoint) -> Result<(), Box<dyn std::error::Error>> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut receipt = 0u16;

    loop {
        prompt();
        let event = tokio::select! {
            line = lines.next_line() => Event::Line(line?),
            packet = endpoint.receive() => Event::Packet(packet),
        };

        let action = match event {
            Event::Line(None) => return Ok(()),
            Event::Line(Some(line)) => parse_command(&line),
            Event::Packet(Ok(packet)) => {
                receipt = packet.packet_number;
                println!("\x08{}", describe(&packet, endpoint.is_udp()));
                continue;
            }
            Event::Packet(Err(e)) if e.is_closed() => {
                println!("\x08Connection closed");
                return Ok(());
            }
            Event::Packet(Err(e)) => {
                warn!("Receive error: {}", e);
                continue;
            }
        };

        let sent = match action {
            Action::Quit => return Ok(()),
            Action::Nothing => continue,
            Action::Unknown(command) => {
                println!("Unknown command: {}", command);
                continue;
            }
            Action::Rfc(data) => {
                endpoint.restart();
                endpoint.send(Opcode::RFC, data).await
            }
            Action::Status => {
                endpoint
                    .send(Opcode::STS, status_data(receipt, LOCAL_WINDOW))
                    .await
            }
            Action::Send(opcode, data) => endpoint.send(opcode, data).await,
        };
        if let Err(e) = sent {
            warn!("Send error: {}", e);
        }
    }
}

async fn connect(cli: &Cli) -> Result<Endpoint, TransportError> {
    match &cli.udp {
        Some(peer) => {
            let encapsulation = if cli.chudp {
                Encapsulation::Chudp
            } else {
                Encapsulation::Direct
            };
            let conn = open_udp(cli.local_port, peer, cli.peer_port, encapsulation).await?;
            eprintln!("Listen to {}", conn.local_addr()?);
            Ok(Endpoint::Udp(conn))
        }
        None => Ok(Endpoint::Ncp(open_local_packet(&cli.socket_dir).await?)),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    let endpoint = match connect(&cli).await {
        Ok(endpoint) => endpoint,
        Err(e) => {
            eprintln!("chatst: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match console(endpoint).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("chatst: {}", e);
            ExitCode::FAILURE
        }
    }
}

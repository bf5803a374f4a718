//! shutdown - ask a Chaosnet host to shut down
//!
//! Connects to the SHUTDOWN contact of a host through the local NCP,
//! passing optional contact data (typically a reason or a delay) along
//! with the RFC.

use chaosnet_client::{open_local_stream, StreamConnection, TransportError};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing_subscriber::EnvFilter;

/// Contact name the request is sent to.
const CONTACT: &str = "SHUTDOWN";

#[derive(Parser)]
#[command(name = "shutdown")]
#[command(about = "Ask a Chaosnet host to shut down")]
#[command(version)]
struct Cli {
    /// Host name or octal address
    host: String,

    /// Contact data sent with the request
    data: Option<String>,

    /// Directory holding the NCP sockets
    #[arg(long, env = "CHAOS_SOCKET_DIR", default_value = "/tmp")]
    socket_dir: PathBuf,

    /// Verbose operation: log the handshake
    #[arg(short, long)]
    verbose: bool,
}

/// Sends the RFC. The connection comes back only if the host opened it.
async fn request_shutdown<S>(
    conn: StreamConnection<S>,
    host: &str,
    data: Option<&str>,
) -> Result<StreamConnection<S>, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let conn = conn
        .handshake_rfc(host, CONTACT, data.map(str::as_bytes))
        .await?;
    tracing::info!("{} accepted the shutdown request", host);
    Ok(conn)
}

async fn run(cli: &Cli) -> Result<(), TransportError> {
    let conn = open_local_stream(&cli.socket_dir).await?;
    request_shutdown(conn, &cli.host, cli.data.as_deref()).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("shutdown: {}: {}", cli.host, e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaosnet_client::RfcError;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_request_without_data() {
        let mock = Builder::new()
            .write(b"RFC mit-ai SHUTDOWN\r\n")
            .read(b"OPN Connection to host mit-ai opened\r\n")
            .build();
        request_shutdown(StreamConnection::new(mock), "mit-ai", None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_request_with_data() {
        let mock = Builder::new()
            .write(b"RFC 3040 SHUTDOWN 5 Going down for maintenance\r\n")
            .read(b"OPN ok\r\n")
            .build();
        request_shutdown(
            StreamConnection::new(mock),
            "3040",
            Some("5 Going down for maintenance"),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_request_refused() {
        let mock = Builder::new()
            .write(b"RFC mit-ai SHUTDOWN\r\n")
            .read(b"CLS Permission denied\r\n")
            .build();
        match request_shutdown(StreamConnection::new(mock), "mit-ai", None).await {
            Err(TransportError::Rfc(RfcError::Refused(text))) => {
                assert_eq!(text, "CLS Permission denied");
            }
            Err(other) => panic!("expected refusal, got {:?}", other),
            Ok(_) => panic!("refused request returned a connection"),
        }
    }

    #[test]
    fn test_cli_arguments() {
        let cli = Cli::parse_from(["shutdown", "mit-ai", "5 reason"]);
        assert_eq!(cli.host, "mit-ai");
        assert_eq!(cli.data.as_deref(), Some("5 reason"));

        assert!(Cli::try_parse_from(["shutdown"]).is_err());
        assert!(Cli::try_parse_from(["shutdown", "a", "b", "c"]).is_err());
    }
}

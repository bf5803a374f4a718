//! rtape - RTAPE remote tape server
//!
//! Serves tape images to Chaosnet hosts through the local NCP.

use chaosnet_rtape::{Config, Server};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rtape")]
#[command(about = "RTAPE remote tape server for Chaosnet")]
#[command(version)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "RTAPE_CONFIG")]
    config: Option<PathBuf>,

    /// Allow slashes in mount drive names
    #[arg(short = 'a', long)]
    allow_slash: bool,

    /// Only allow read-only mounts
    #[arg(short = 'r', long)]
    read_only: bool,

    /// Receive window size advertised to the NCP
    #[arg(short = 'w', long, value_parser = clap::value_parser!(u16).range(1..))]
    window_size: Option<u16>,

    /// Directory holding the NCP sockets
    #[arg(long)]
    socket_dir: Option<PathBuf>,

    /// Directory drive names are resolved against
    #[arg(long)]
    tape_dir: Option<PathBuf>,

    /// Quiet operation: errors only
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Verbose operation: detailed logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn log_level(&self) -> &'static str {
        match (self.quiet, self.verbose) {
            (true, _) => "warn",
            (false, 0) => "info",
            (false, 1) => "debug",
            _ => "trace",
        }
    }

    /// Command-line flags override the file and the environment.
    fn apply(&self, config: &mut Config) {
        if self.allow_slash {
            config.rtape.allow_slash = true;
        }
        if self.read_only {
            config.rtape.read_only = true;
        }
        if let Some(size) = self.window_size {
            config.rtape.window_size = size;
        }
        if let Some(dir) = &self.socket_dir {
            config.ncp.socket_dir = dir.clone();
        }
        if let Some(dir) = &self.tape_dir {
            config.rtape.tape_dir = dir.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level())),
        )
        .init();

    let mut config = match Config::load_from(cli.config.as_deref()) {
        Ok(config) => {
            if let Some(path) = &cli.config {
                tracing::info!("Loaded config from {}", path.display());
            }
            config
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };
    cli.apply(&mut config);

    if let Err(e) = config.validate() {
        tracing::error!("{}", e);
        return Err(e.into());
    }

    tracing::info!("Starting rtape server");
    tracing::info!("  NCP socket directory: {}", config.ncp.socket_dir.display());
    tracing::info!(
        "  Contact: {} (window {})",
        config.rtape.contact,
        config.rtape.window_size
    );
    tracing::info!("  Tape directory: {}", config.rtape.tape_dir.display());
    tracing::info!(
        "  Mounts: {}",
        if config.rtape.read_only {
            "read-only"
        } else {
            "read-write"
        }
    );
    if config.rtape.allow_slash {
        tracing::info!("  Slashes allowed in drive names");
    }

    let server = Arc::new(Server::new(config));

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    tracing::info!("Server stopped");
    Ok(())
}

//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via RTAPE_CONFIG or --config)
//! 3. Environment variables
//!
//! The result is fixed at startup and shared read-only by every worker.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Connection to the local NCP.
    pub ncp: NcpConfig,
    /// RTAPE service settings.
    pub rtape: RtapeConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var_os("RTAPE_CONFIG").map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    /// Loads `path` if given, then applies environment variable overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.ncp.apply_env_overrides();
        self.rtape.apply_env_overrides();
    }

    /// Checks values that cannot be expressed in the types.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rtape.validate()
    }
}

/// Local NCP configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NcpConfig {
    /// Directory holding the NCP's `chaos_stream` and `chaos_packet` sockets.
    pub socket_dir: PathBuf,
}

impl Default for NcpConfig {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from("/tmp"),
        }
    }
}

impl NcpConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("CHAOS_SOCKET_DIR") {
            self.socket_dir = PathBuf::from(dir);
        }
    }
}

/// RTAPE service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtapeConfig {
    /// Contact name the listener advertises.
    pub contact: String,
    /// Receive window advertised to the NCP.
    pub window_size: u16,
    /// Only allow read-only mounts.
    pub read_only: bool,
    /// Allow `/` in drive names.
    pub allow_slash: bool,
    /// Directory drive names are resolved against.
    pub tape_dir: PathBuf,
    /// Pause after each record sent by a read, in milliseconds.
    pub record_delay_ms: u64,
    /// Time allowed for the peer's version line, in seconds (0 = unbounded).
    pub version_timeout_secs: u64,
}

impl Default for RtapeConfig {
    fn default() -> Self {
        Self {
            contact: "RTAPE".to_string(),
            window_size: 15,
            read_only: false,
            allow_slash: false,
            tape_dir: PathBuf::from("."),
            record_delay_ms: 100,
            version_timeout_secs: 60,
        }
    }
}

impl RtapeConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(contact) = std::env::var("RTAPE_CONTACT") {
            if !contact.is_empty() {
                self.contact = contact;
            }
        }

        if let Ok(size) = std::env::var("RTAPE_WINDOW_SIZE") {
            if let Ok(n) = size.parse() {
                self.window_size = n;
            }
        }

        if let Ok(read_only) = std::env::var("RTAPE_READ_ONLY") {
            self.read_only = read_only == "1" || read_only.to_lowercase() == "true";
        }

        if let Ok(allow) = std::env::var("RTAPE_ALLOW_SLASH") {
            self.allow_slash = allow == "1" || allow.to_lowercase() == "true";
        }

        if let Ok(dir) = std::env::var("RTAPE_TAPE_DIR") {
            self.tape_dir = PathBuf::from(dir);
        }

        if let Ok(delay) = std::env::var("RTAPE_RECORD_DELAY_MS") {
            if let Ok(ms) = delay.parse() {
                self.record_delay_ms = ms;
            }
        }

        if let Ok(timeout) = std::env::var("RTAPE_VERSION_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.version_timeout_secs = secs;
            }
        }
    }

    /// Validates RTAPE configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size == 0 {
            return Err(ConfigError::ValidationError(
                "window_size must be at least 1".to_string(),
            ));
        }
        if self.contact.is_empty() {
            return Err(ConfigError::ValidationError(
                "contact name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the listen argument sent to the NCP.
    pub fn listen_args(&self) -> String {
        format!("[winsize={}] {}", self.window_size, self.contact)
    }

    /// Returns the per-record read delay as Duration.
    pub fn record_delay(&self) -> Duration {
        Duration::from_millis(self.record_delay_ms)
    }

    /// Returns the version handshake bound, if any.
    pub fn version_timeout(&self) -> Option<Duration> {
        match self.version_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Resolves a drive name to the tape image path.
    pub fn tape_path(&self, drive: &str) -> PathBuf {
        self.tape_dir.join(drive)
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

//! # Configuration Management
//!
//! Centralized configuration for endpoints, the transport, the type gate and
//! the P2P layer.
//!
//! ## Configuration Sources
//! - TOML files via [`NetworkConfig::from_file`] / [`NetworkConfig::from_toml`]
//! - Direct instantiation with defaults
//! - `PEERWIRE_*` environment overrides via [`NetworkConfig::from_env`]
//!
//! ## Security Considerations
//! - `max_buffer_size` bounds unframed accumulation per connection
//! - The type gate is fail-closed: an empty `allowed_types` admits only the
//!   built-in control-plane keys
//! - P2P listeners are off unless `p2p.enabled` is set

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Hard ceiling on a single frame payload (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Default connection (liveness) timeout
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_millis(3000);

/// Default listen backlog
pub const DEFAULT_BACKLOG: u32 = 128;

/// Default size of one socket read
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Default ephemeral port range for P2P listeners
pub const DEFAULT_P2P_PORT_RANGE: (u16, u16) = (40000, 40100);

/// Default time an ephemeral listener waits for its one peer
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub p2p: P2pConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Defaults with `PEERWIRE_*` environment overrides applied
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (environment-style names).
    ///
    /// Unparseable numeric values are reported rather than ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
            raw.trim()
                .parse::<T>()
                .map_err(|_| ProtocolError::ConfigError(format!("Invalid value for {key}: '{raw}'")))
        }

        if let Some(addr) = lookup("PEERWIRE_SERVER_ADDRESS") {
            self.server.address = addr;
        }
        if let Some(addr) = lookup("PEERWIRE_CLIENT_ADDRESS") {
            self.client.address = addr;
        }
        if let Some(raw) = lookup("PEERWIRE_CONNECTION_TIMEOUT_MS") {
            self.transport.connection_timeout =
                Duration::from_millis(parse("PEERWIRE_CONNECTION_TIMEOUT_MS", &raw)?);
        }
        if let Some(raw) = lookup("PEERWIRE_MAX_BUFFER_SIZE") {
            self.transport.max_buffer_size = parse("PEERWIRE_MAX_BUFFER_SIZE", &raw)?;
        }
        if let Some(raw) = lookup("PEERWIRE_UPLOAD_LIMIT") {
            self.transport.upload_limit_bytes_per_sec = parse("PEERWIRE_UPLOAD_LIMIT", &raw)?;
        }
        if let Some(raw) = lookup("PEERWIRE_DOWNLOAD_LIMIT") {
            self.transport.download_limit_bytes_per_sec = parse("PEERWIRE_DOWNLOAD_LIMIT", &raw)?;
        }
        if let Some(format) = lookup("PEERWIRE_SERIALIZATION") {
            self.transport.serialization = format;
        }
        if let Some(compression) = lookup("PEERWIRE_COMPRESSION") {
            self.transport.compression = compression;
        }
        if let Some(types) = lookup("PEERWIRE_ALLOWED_TYPES") {
            self.security.allowed_types = split_list(&types);
        }
        if let Some(types) = lookup("PEERWIRE_DENIED_TYPES") {
            self.security.denied_types = split_list(&types);
        }
        if let Some(raw) = lookup("PEERWIRE_P2P_ENABLED") {
            self.p2p.enabled = parse("PEERWIRE_P2P_ENABLED", &raw)?;
        }
        if let Some(raw) = lookup("PEERWIRE_P2P_PORT_RANGE") {
            let (start, end) = raw.split_once('-').ok_or_else(|| {
                ProtocolError::ConfigError(format!(
                    "Invalid value for PEERWIRE_P2P_PORT_RANGE: '{raw}' (expected 'start-end')"
                ))
            })?;
            self.p2p.port_range_start = parse("PEERWIRE_P2P_PORT_RANGE", start)?;
            self.p2p.port_range_end = parse("PEERWIRE_P2P_PORT_RANGE", end)?;
        }

        Ok(())
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.security.validate());
        errors.extend(self.p2p.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result; `WARNING:` entries do not fail it.
    pub fn validate_strict(&self) -> Result<()> {
        let errors: Vec<String> = self
            .validate()
            .into_iter()
            .filter(|e| !e.starts_with("WARNING:"))
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Listening side (hub or plain server)
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g., "127.0.0.1:9000")
    pub address: String,

    /// Listen backlog
    pub backlog: u32,

    /// Accepted connections beyond this are dropped immediately
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9000"),
            backlog: DEFAULT_BACKLOG,
            max_connections: 1000,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:8080')",
                self.address
            ));
        }

        if self.backlog == 0 {
            errors.push("Backlog must be greater than 0".to_string());
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        errors
    }
}

/// Dialing side
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Target address; `ws://` URLs select the WebSocket transport
    pub address: String,

    /// Timeout for connection attempts
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9000"),
            connect_timeout: DEFAULT_CONNECTION_TIMEOUT,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Client address cannot be empty".to_string());
        } else if !self.address.starts_with("ws://")
            && !self.address.starts_with("wss://")
            && self.address.parse::<std::net::SocketAddr>().is_err()
        {
            errors.push(format!(
                "Invalid client address format: '{}' (expected 'host:port' or 'ws://host:port')",
                self.address
            ));
        }

        if self.connect_timeout.as_millis() < 100 {
            errors.push("Connect timeout too short (minimum: 100ms)".to_string());
        }

        errors
    }
}

/// Per-connection transport settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Liveness interval; a silent peer is dropped after twice this
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Cap on unframed bytes buffered per connection (and on one frame)
    pub max_buffer_size: usize,

    /// Size of one socket read
    pub read_buffer_size: usize,

    /// Upload cap in bytes per second, 0 = unlimited
    pub upload_limit_bytes_per_sec: u64,

    /// Download cap in bytes per second, 0 = unlimited
    pub download_limit_bytes_per_sec: u64,

    /// "json", "bincode" or "msgpack"
    pub serialization: String,

    /// "none", "lz4" or "zstd"
    pub compression: String,

    /// Bodies smaller than this go out uncompressed
    pub compression_threshold_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            max_buffer_size: MAX_FRAME_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            upload_limit_bytes_per_sec: 0,
            download_limit_bytes_per_sec: 0,
            serialization: String::from("json"),
            compression: String::from("none"),
            compression_threshold_bytes: 512,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.connection_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        } else if self.connection_timeout.as_secs() > 300 {
            errors.push("Connection timeout too long (maximum: 300s)".to_string());
        }

        if self.max_buffer_size < 1024 {
            errors.push("Max buffer size too small (minimum: 1 KB)".to_string());
        } else if self.max_buffer_size > MAX_FRAME_SIZE {
            errors.push(format!(
                "Max buffer size too large: {} bytes (maximum: {MAX_FRAME_SIZE})",
                self.max_buffer_size
            ));
        }

        if self.read_buffer_size == 0 {
            errors.push("Read buffer size must be greater than 0".to_string());
        } else if self.read_buffer_size > self.max_buffer_size {
            errors.push("Read buffer size cannot exceed max buffer size".to_string());
        }

        if crate::core::serialization::SerializationFormat::from_name(&self.serialization).is_err()
        {
            errors.push(format!(
                "Unknown serialization format: '{}' (valid: json, bincode, msgpack)",
                self.serialization
            ));
        }

        match crate::utils::compression::CompressionKind::from_name(&self.compression) {
            Err(_) => errors.push(format!(
                "Unknown compression: '{}' (valid: none, lz4, zstd)",
                self.compression
            )),
            Ok(Some(_)) if self.compression_threshold_bytes > self.max_buffer_size => {
                errors.push(
                    "Compression threshold cannot be larger than max buffer size".to_string(),
                );
            }
            Ok(_) => {}
        }

        errors
    }
}

/// Type gate lists
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Type keys that may be reconstructed
    pub allowed_types: Vec<String>,

    /// Type keys that are always rejected, even if allowed
    pub denied_types: Vec<String>,
}

impl SecurityConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self
            .allowed_types
            .iter()
            .chain(&self.denied_types)
            .any(|t| t.trim().is_empty())
        {
            errors.push("Type keys cannot be empty".to_string());
        }

        let denied: HashSet<&str> = self.denied_types.iter().map(String::as_str).collect();
        for key in &self.allowed_types {
            if denied.contains(key.as_str()) {
                errors.push(format!(
                    "WARNING: '{key}' is both allowed and denied (deny wins)"
                ));
            }
        }

        errors
    }
}

/// Direct peer-to-peer negotiation
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct P2pConfig {
    /// Whether `start_server` may open ephemeral listeners
    pub enabled: bool,

    /// Interface ephemeral listeners bind to
    pub bind_host: String,

    /// Host written into negotiation offers; empty lets the hub fill in the
    /// address it sees for this peer
    pub advertise_host: String,

    pub port_range_start: u16,

    pub port_range_end: u16,

    /// How long an ephemeral listener waits for its peer
    #[serde(with = "duration_serde")]
    pub negotiation_timeout: Duration,

    /// Dial incoming offers immediately instead of queueing them
    pub auto_accept: bool,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_host: String::from("0.0.0.0"),
            advertise_host: String::new(),
            port_range_start: DEFAULT_P2P_PORT_RANGE.0,
            port_range_end: DEFAULT_P2P_PORT_RANGE.1,
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            auto_accept: true,
        }
    }
}

impl P2pConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if !self.enabled {
            return errors;
        }

        if self.bind_host.parse::<std::net::IpAddr>().is_err() {
            errors.push(format!("Invalid P2P bind host: '{}'", self.bind_host));
        }

        if self.port_range_start == 0 {
            errors.push("P2P port range cannot start at 0".to_string());
        }
        if self.port_range_start > self.port_range_end {
            errors.push(format!(
                "Invalid P2P port range: {}-{} (start must not exceed end)",
                self.port_range_start, self.port_range_end
            ));
        }

        if self.negotiation_timeout.as_millis() < 100 {
            errors.push("Negotiation timeout too short (minimum: 100ms)".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("peerwire"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Durations are stored as milliseconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Levels are stored as lowercase names
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}

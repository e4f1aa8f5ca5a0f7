//! Integration tests for configuration validation

#![allow(clippy::expect_used, clippy::unwrap_used)]

use peerwire::config::{
    ClientConfig, LoggingConfig, NetworkConfig, P2pConfig, SecurityConfig, ServerConfig,
    TransportConfig,
};
use peerwire::transport::ConnectionOptions;
use std::time::Duration;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = NetworkConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
}

#[test]
fn test_invalid_server_address() {
    let mut config = NetworkConfig::default();
    config.server.address = "invalid_address".to_string();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Invalid server address")));
}

#[test]
fn test_empty_server_address() {
    let mut config = NetworkConfig::default();
    config.server.address = String::new();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("cannot be empty")));
}

#[test]
fn test_zero_backlog() {
    let mut config = NetworkConfig::default();
    config.server.backlog = 0;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Backlog must be greater than 0")));
}

#[test]
fn test_zero_max_connections() {
    let mut config = NetworkConfig::default();
    config.server.max_connections = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max connections must be greater than 0")));
}

#[test]
fn test_websocket_client_address_accepted() {
    let mut config = NetworkConfig::default();
    config.client.address = "ws://127.0.0.1:9000/hub".to_string();
    assert!(config.validate().is_empty());

    config.client.address = "not:a:valid:address".to_string();
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Invalid client address")));
}

#[test]
fn test_short_connection_timeout() {
    let mut config = NetworkConfig::default();
    config.transport.connection_timeout = Duration::from_millis(50);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Connection timeout too short")));
}

#[test]
fn test_long_connection_timeout() {
    let mut config = NetworkConfig::default();
    config.transport.connection_timeout = Duration::from_secs(400);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Connection timeout too long")));
}

#[test]
fn test_buffer_size_bounds() {
    let mut config = NetworkConfig::default();
    config.transport.max_buffer_size = 512;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Max buffer size too small")));

    config.transport.max_buffer_size = 64 * 1024 * 1024;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Max buffer size too large")));
}

#[test]
fn test_read_buffer_larger_than_max_buffer() {
    let mut config = NetworkConfig::default();
    config.transport.max_buffer_size = 4096;
    config.transport.read_buffer_size = 8192;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Read buffer size cannot exceed")));
}

#[test]
fn test_unknown_serialization_and_compression() {
    let mut config = NetworkConfig::default();
    config.transport.serialization = "xml".to_string();
    config.transport.compression = "brotli".to_string();

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Unknown serialization format")));
    assert!(errors.iter().any(|e| e.contains("Unknown compression")));
}

#[test]
fn test_compression_threshold_larger_than_buffer() {
    let mut config = NetworkConfig::default();
    config.transport.compression = "lz4".to_string();
    config.transport.max_buffer_size = 4096;
    config.transport.read_buffer_size = 1024;
    config.transport.compression_threshold_bytes = 8192;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Compression threshold cannot be larger")));
}

#[test]
fn test_overlapping_type_lists_only_warn() {
    let mut config = NetworkConfig::default();
    config.security.allowed_types = vec!["app.Chat".to_string()];
    config.security.denied_types = vec!["app.Chat".to_string()];

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.starts_with("WARNING:")));
    assert!(config.validate_strict().is_ok());
}

#[test]
fn test_empty_type_key_rejected() {
    let mut config = NetworkConfig::default();
    config.security.allowed_types = vec!["  ".to_string()];

    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Type keys cannot be empty")));
}

#[test]
fn test_p2p_checked_only_when_enabled() {
    let mut config = NetworkConfig::default();
    config.p2p.port_range_start = 50000;
    config.p2p.port_range_end = 40000;
    assert!(config.validate().is_empty());

    config.p2p.enabled = true;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Invalid P2P port range")));

    config.p2p.port_range_end = 50010;
    config.p2p.bind_host = "localhost".to_string();
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Invalid P2P bind host")));
}

#[test]
fn test_log_to_file_without_path() {
    let mut config = NetworkConfig::default();
    config.logging.log_to_file = true;
    config.logging.log_file_path = None;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("log_file_path must be specified")));
}

#[test]
fn test_no_logging_outputs() {
    let mut config = NetworkConfig::default();
    config.logging.log_to_console = false;
    config.logging.log_to_file = false;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("At least one logging output")));
}

#[test]
fn test_validate_strict_with_invalid_config() {
    let mut config = NetworkConfig::default();
    config.server.address = String::new();

    let err = config.validate_strict().unwrap_err();
    assert!(err.to_string().contains("Configuration validation failed"));
}

#[test]
fn test_multiple_validation_errors() {
    let mut config = NetworkConfig::default();
    config.server.address = String::new();
    config.server.backlog = 0;
    config.client.address = String::new();
    config.transport.max_buffer_size = 0;
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(
        errors.len() >= 5,
        "Expected at least 5 errors, got {}: {:?}",
        errors.len(),
        errors
    );
}

#[test]
fn test_toml_roundtrip_through_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("peerwire.toml");

    let mut config = NetworkConfig::default();
    config.transport.serialization = "msgpack".to_string();
    config.transport.upload_limit_bytes_per_sec = 4096;
    config.p2p.enabled = true;
    config.save_to_file(&path).expect("save");

    let loaded = NetworkConfig::from_file(&path).expect("load");
    assert_eq!(loaded.transport.serialization, "msgpack");
    assert_eq!(loaded.transport.upload_limit_bytes_per_sec, 4096);
    assert!(loaded.p2p.enabled);
    assert_eq!(loaded.transport.connection_timeout, config.transport.connection_timeout);
}

#[test]
fn test_example_config_parses() {
    let text = NetworkConfig::example_config();
    let parsed = NetworkConfig::from_toml(&text).expect("example parses");
    assert!(parsed.validate_strict().is_ok());
}

#[test]
fn test_options_resolved_from_config() {
    let mut config = NetworkConfig::default();
    config.transport.serialization = "bincode".to_string();
    config.transport.compression = "zstd".to_string();
    config.transport.download_limit_bytes_per_sec = 1000;
    config.security.allowed_types = vec!["app.Chat".to_string()];
    config.security.denied_types = vec!["app.Secret".to_string()];

    let options = ConnectionOptions::from_config(&config).expect("options");
    assert_eq!(options.codec.serializer_name(), "bincode");
    assert_eq!(options.upload_limit, None);
    assert_eq!(options.download_limit, Some(1000));
    assert!(options.gate.is_allowed("app.Chat"));
    assert!(!options.gate.is_allowed("app.Secret"));
    assert!(options.gate.is_allowed("peer.Identifier"));
}

#[test]
fn test_valid_production_config() {
    let config = NetworkConfig {
        server: ServerConfig {
            address: "0.0.0.0:8443".to_string(),
            backlog: 512,
            max_connections: 10000,
        },
        client: ClientConfig {
            address: "ws://127.0.0.1:8443".to_string(),
            connect_timeout: Duration::from_secs(10),
        },
        transport: TransportConfig {
            connection_timeout: Duration::from_secs(5),
            max_buffer_size: 4 * 1024 * 1024,
            read_buffer_size: 16 * 1024,
            upload_limit_bytes_per_sec: 1024 * 1024,
            download_limit_bytes_per_sec: 0,
            serialization: "json".to_string(),
            compression: "lz4".to_string(),
            compression_threshold_bytes: 1024,
        },
        security: SecurityConfig {
            allowed_types: vec!["app.Chat".to_string()],
            denied_types: vec![],
        },
        p2p: P2pConfig {
            enabled: true,
            bind_host: "0.0.0.0".to_string(),
            ..P2pConfig::default()
        },
        logging: LoggingConfig {
            app_name: "production-hub".to_string(),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: true,
        },
    };

    let errors = config.validate();
    assert!(errors.is_empty(), "Production config should be valid, got: {:?}", errors);
}

//! # Error Types
//!
//! Error handling for the transport, the wire envelope and the peer layer.
//!
//! ## Error Scopes
//! Every variant is either **message-scoped** or **connection-scoped**:
//! - **Message-scoped** (`TypeNotAllowed`, `SerializationError`,
//!   `FieldWidthMismatch`, `RoutingError`, `UnexpectedMessage`, compression
//!   failures): the single message is dropped, the error is reported on the
//!   connection's error channel and the connection stays usable.
//! - **Connection-scoped** (`Io`, `FrameTooLarge`, `ConnectionTimeout`,
//!   `TransportError`, `ConnectionClosed`): the connection is closed and
//!   unregistered.
//!
//! See [`ProtocolError::is_connection_scoped`].
//!
//! ## Example Usage
//! ```rust
//! use peerwire::error::{ProtocolError, Result};
//!
//! fn check(type_key: &str) -> Result<()> {
//!     Err(ProtocolError::TypeNotAllowed {
//!         type_key: type_key.to_string(),
//!         blacklisted: false,
//!     })
//! }
//!
//! let err = check("app.Unknown").unwrap_err();
//! assert!(!err.is_connection_scoped());
//! ```

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_CONNECTION_TIMEOUT: &str = "Connection timed out (no activity)";
    pub const ERR_SCHEDULER_RUNTIME: &str = "Scheduler requires a running tokio runtime";

    /// Envelope errors
    pub const ERR_EMPTY_FRAME: &str = "Empty frame payload";
    pub const ERR_UNKNOWN_FRAME_FLAGS: &str = "Unknown frame flags";
    pub const ERR_NO_COMPRESSOR: &str = "Compressed frame received but no compressor is configured";
    pub const ERR_NESTING_TOO_DEEP: &str = "Object nesting exceeds maximum depth";

    /// Peer errors
    pub const ERR_IDENTITY_PENDING: &str = "Local identity has not been assigned by the hub yet";
    pub const ERR_P2P_DISABLED: &str = "Peer-to-peer negotiation is disabled";
    pub const ERR_NO_FREE_PORT: &str = "No free port in the configured P2P range";
    pub const ERR_LINK_TOKEN: &str = "Direct dial presented the wrong link token";
}

// ProtocolError is the primary error type for all operations
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    #[serde(skip_serializing, skip_deserializing)]
    Io(#[from] io::Error),

    /// The payload type key is denied, or absent from the allow-set.
    #[error("Type '{type_key}' not allowed (blacklisted: {blacklisted})")]
    TypeNotAllowed { type_key: String, blacklisted: bool },

    /// The receive buffer budget was exceeded before a full frame arrived.
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A wire number does not fit the target field; the field takes its default.
    #[error("Field '{field}' cannot hold {value} as {target}")]
    FieldWidthMismatch {
        field: String,
        target: String,
        value: String,
    },

    #[error("Routing error: {0}")]
    RoutingError(String),

    #[error("Connection timed out (no activity)")]
    ConnectionTimeout,

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Compression failed")]
    CompressionFailure,

    #[error("Decompression failed")]
    DecompressionFailure,

    /// An allowed type key arrived but no handler is registered for it.
    #[error("No handler registered for type '{0}'")]
    UnexpectedMessage(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Whether this error tears the connection down rather than dropping one message.
    pub fn is_connection_scoped(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_)
                | ProtocolError::FrameTooLarge(_)
                | ProtocolError::ConnectionTimeout
                | ProtocolError::TransportError(_)
                | ProtocolError::ConnectionClosed
        )
    }

    pub(crate) fn width_mismatch(target: &str, value: impl ToString) -> Self {
        ProtocolError::FieldWidthMismatch {
            field: String::new(),
            target: target.to_string(),
            value: value.to_string(),
        }
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

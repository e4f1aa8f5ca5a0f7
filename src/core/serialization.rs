//! # Serialization Formats
//!
//! The [`Serializer`] collaborator turns an [`Envelope`] into frame body
//! bytes and back. Three formats ship with the crate:
//!
//! - **JSON** (default): UTF-8 text, readable on the wire and easy to interop with
//! - **Bincode**: fastest binary form, decoded with a size limit
//! - **MessagePack**: compact binary form
//!
//! Both peers of a connection must use the same format; the P2P negotiation
//! carries the format name as its serializer descriptor for that reason.
//!
//! ## Usage
//! ```rust
//! use peerwire::core::envelope::Envelope;
//! use peerwire::core::serialization::{SerializationFormat, Serializer};
//!
//! let format = SerializationFormat::from_name("msgpack").unwrap();
//! let bytes = format.serialize(&Envelope::heartbeat()).unwrap();
//! assert!(format.deserialize(&bytes).unwrap().is_heartbeat());
//! ```

use bincode::Options;

use crate::config::MAX_FRAME_SIZE;
use crate::core::envelope::Envelope;
use crate::error::{ProtocolError, Result};

/// Byte-level serializer for envelopes.
pub trait Serializer: Send + Sync {
    /// Stable name both sides compare before talking.
    fn descriptor(&self) -> &'static str;

    fn serialize(&self, envelope: &Envelope) -> Result<Vec<u8>>;

    fn deserialize(&self, bytes: &[u8]) -> Result<Envelope>;
}

/// Supported serialization formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerializationFormat {
    /// Structured UTF-8 text (default)
    #[default]
    Json,
    /// Binary, fastest
    Bincode,
    /// Binary, compact
    MessagePack,
}

impl SerializationFormat {
    /// Parse a configured or negotiated format name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "json" => Ok(SerializationFormat::Json),
            "bincode" => Ok(SerializationFormat::Bincode),
            "msgpack" | "messagepack" => Ok(SerializationFormat::MessagePack),
            other => Err(ProtocolError::ConfigError(format!(
                "unknown serialization format '{other}'"
            ))),
        }
    }

    fn bincode() -> impl Options {
        bincode::options()
            .with_limit(MAX_FRAME_SIZE as u64)
            .with_fixint_encoding()
    }
}

fn serialize_error(e: impl ToString) -> ProtocolError {
    ProtocolError::SerializationError(e.to_string())
}

impl Serializer for SerializationFormat {
    fn descriptor(&self) -> &'static str {
        match self {
            SerializationFormat::Json => "json",
            SerializationFormat::Bincode => "bincode",
            SerializationFormat::MessagePack => "msgpack",
        }
    }

    fn serialize(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        match self {
            SerializationFormat::Json => serde_json::to_vec(envelope).map_err(serialize_error),
            SerializationFormat::Bincode => {
                Self::bincode().serialize(envelope).map_err(serialize_error)
            }
            SerializationFormat::MessagePack => {
                rmp_serde::to_vec_named(envelope).map_err(serialize_error)
            }
        }
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Envelope> {
        match self {
            SerializationFormat::Json => serde_json::from_slice(bytes).map_err(serialize_error),
            SerializationFormat::Bincode => {
                Self::bincode().deserialize(bytes).map_err(serialize_error)
            }
            SerializationFormat::MessagePack => {
                rmp_serde::from_slice(bytes).map_err(serialize_error)
            }
        }
    }
}

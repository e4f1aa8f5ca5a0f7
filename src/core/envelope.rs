//! # Wire Envelope
//!
//! Every object travels as `{type_key, value}`. The envelope is the unit the
//! serializer turns into bytes; the typed payload is only rebuilt by
//! [`Envelope::unwrap`] after the [`TypeGate`] approves the key.

use serde::{Deserialize, Serialize};

use crate::core::gate::TypeGate;
use crate::core::value::Value;
use crate::core::wire::{DecodeContext, Wire};
use crate::error::{ProtocolError, Result};

/// Reserved liveness probe key.
pub const HEARTBEAT: &str = "sys.Heartbeat";
/// Reserved liveness reply key.
pub const HEARTBEAT_ACK: &str = "sys.HeartbeatAck";

/// Self-describing wire unit pairing a type key with an inert payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub type_key: String,
    pub value: Value,
}

impl Envelope {
    pub fn new(type_key: impl Into<String>, value: Value) -> Self {
        Self {
            type_key: type_key.into(),
            value,
        }
    }

    /// Wrap a typed object under its declared type key.
    pub fn wrap<T: Wire>(object: &T) -> Self {
        Self {
            type_key: T::TYPE_KEY.to_string(),
            value: object.to_record(),
        }
    }

    /// Gate-check and rebuild the typed payload.
    ///
    /// Returns the object together with any recoverable per-field errors
    /// (numeric width mismatches) hit along the way.
    pub fn unwrap<T: Wire>(self, gate: &TypeGate) -> Result<(T, Vec<ProtocolError>)> {
        let mut cx = DecodeContext::new(gate);
        let object = cx.decode::<T>(self)?;
        Ok((object, cx.into_field_errors()))
    }

    pub fn heartbeat() -> Self {
        Self::new(HEARTBEAT, Value::Null)
    }

    pub fn heartbeat_ack() -> Self {
        Self::new(HEARTBEAT_ACK, Value::Null)
    }

    #[inline]
    pub fn is_heartbeat(&self) -> bool {
        self.type_key == HEARTBEAT
    }

    #[inline]
    pub fn is_heartbeat_ack(&self) -> bool {
        self.type_key == HEARTBEAT_ACK
    }
}

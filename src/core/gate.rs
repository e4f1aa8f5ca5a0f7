//! # Type Gate
//!
//! Allow/deny enforcement on type keys, performed before any payload is
//! reconstructed. Deny always wins; a key missing from the allow-set is
//! rejected (fail-closed).

use std::collections::HashSet;

use crate::config::SecurityConfig;
use crate::core::wire::Wire;
use crate::error::{ProtocolError, Result};
use crate::protocol::negotiation::CONTROL_PLANE_TYPES;

/// Allow-set and deny-set of type keys.
#[derive(Debug, Clone, Default)]
pub struct TypeGate {
    allow: HashSet<String>,
    deny: HashSet<String>,
}

impl TypeGate {
    /// An empty gate: every key is rejected.
    pub fn new() -> Self {
        Self::default()
    }

    /// A gate that admits the built-in control-plane keys.
    pub fn with_control_plane() -> Self {
        CONTROL_PLANE_TYPES
            .iter()
            .fold(Self::new(), |gate, key| gate.allow(*key))
    }

    /// Build from configuration; the control-plane keys are always allowed
    /// unless the deny list names them.
    pub fn from_config(config: &SecurityConfig) -> Self {
        let mut gate = Self::with_control_plane();
        gate.allow.extend(config.allowed_types.iter().cloned());
        gate.deny.extend(config.denied_types.iter().cloned());
        gate
    }

    pub fn allow(mut self, type_key: impl Into<String>) -> Self {
        self.allow.insert(type_key.into());
        self
    }

    pub fn allow_type<T: Wire>(self) -> Self {
        self.allow(T::TYPE_KEY)
    }

    pub fn deny(mut self, type_key: impl Into<String>) -> Self {
        self.deny.insert(type_key.into());
        self
    }

    pub fn deny_type<T: Wire>(self) -> Self {
        self.deny(T::TYPE_KEY)
    }

    /// Deny first, then allow.
    pub fn check(&self, type_key: &str) -> Result<()> {
        if self.deny.contains(type_key) {
            return Err(ProtocolError::TypeNotAllowed {
                type_key: type_key.to_string(),
                blacklisted: true,
            });
        }
        if !self.allow.contains(type_key) {
            return Err(ProtocolError::TypeNotAllowed {
                type_key: type_key.to_string(),
                blacklisted: false,
            });
        }
        Ok(())
    }

    pub fn is_allowed(&self, type_key: &str) -> bool {
        self.check(type_key).is_ok()
    }
}

//! # Peer Identity
//!
//! A peer's id equals the id of its connection on the hub. The hub owns the
//! authoritative [`PeerDirectory`]; peers keep read-only mirrors that only
//! `Identifier` messages from the hub may change.
//!
//! Visibility rules:
//! - the IP address travels only on the owner's own copy
//! - public metadata is broadcast on every change
//! - private metadata never leaves the hub

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::core::value::{type_mismatch, FieldValue, Value};
use crate::core::wire::DecodeContext;
use crate::error::{ProtocolError, Result};
use crate::wire_struct;

/// Identity of one peer, assigned by the hub.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

impl From<u64> for PeerId {
    fn from(id: u64) -> Self {
        PeerId(id)
    }
}

impl FieldValue for PeerId {
    fn to_value(&self) -> Value {
        Value::UInt(self.0)
    }

    fn from_value(value: Value, cx: &mut DecodeContext<'_>) -> Result<Self> {
        u64::from_value(value, cx).map(PeerId)
    }
}

/// What an `Identifier` message means to its receiver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum IdentityAction {
    /// The receiver's own identity.
    #[default]
    LocalIdentity,
    /// Another peer joined (or was already present).
    RemoteIdentity,
    /// Public metadata of the named peer changed.
    MetadataUpdate,
    /// The named peer left.
    Dispose,
}

impl IdentityAction {
    pub fn as_str(self) -> &'static str {
        match self {
            IdentityAction::LocalIdentity => "local",
            IdentityAction::RemoteIdentity => "remote",
            IdentityAction::MetadataUpdate => "metadata",
            IdentityAction::Dispose => "dispose",
        }
    }
}

impl FieldValue for IdentityAction {
    fn to_value(&self) -> Value {
        Value::Text(self.as_str().to_string())
    }

    fn from_value(value: Value, _cx: &mut DecodeContext<'_>) -> Result<Self> {
        match value {
            Value::Text(tag) => match tag.as_str() {
                "local" => Ok(IdentityAction::LocalIdentity),
                "remote" => Ok(IdentityAction::RemoteIdentity),
                "metadata" => Ok(IdentityAction::MetadataUpdate),
                "dispose" => Ok(IdentityAction::Dispose),
                other => Err(ProtocolError::SerializationError(format!(
                    "unknown identity action '{other}'"
                ))),
            },
            other => Err(type_mismatch("identity action", &other)),
        }
    }
}

wire_struct! {
    /// Wire form of a [`PeerIdentity`].
    #[derive(Debug, Clone, PartialEq, Default)]
    pub struct Identifier = "peer.Identifier" {
        pub id: PeerId,
        /// Present only on the owner's own copy.
        pub ip: Option<String>,
        pub metadata: BTreeMap<String, String>,
        pub action: IdentityAction,
    }
}

/// Hub-side record of one peer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PeerIdentity {
    pub id: PeerId,
    pub ip: Option<IpAddr>,
    pub public_metadata: BTreeMap<String, String>,
    pub private_metadata: BTreeMap<String, String>,
}

impl PeerIdentity {
    pub fn new(id: PeerId, ip: Option<IpAddr>) -> Self {
        Self {
            id,
            ip,
            ..Self::default()
        }
    }

    /// Wire copy; private metadata is never included.
    pub fn identifier(&self, action: IdentityAction, include_ip: bool) -> Identifier {
        Identifier {
            id: self.id,
            ip: if include_ip {
                self.ip.map(|ip| ip.to_string())
            } else {
                None
            },
            metadata: self.public_metadata.clone(),
            action,
        }
    }

    /// Mirror built from a received identifier.
    pub fn from_identifier(identifier: &Identifier) -> Self {
        Self {
            id: identifier.id,
            ip: identifier.ip.as_deref().and_then(|ip| ip.parse().ok()),
            public_metadata: identifier.metadata.clone(),
            private_metadata: BTreeMap::new(),
        }
    }
}

/// Set or remove `key`; `None` or an empty value removes it.
pub(crate) fn apply_metadata(map: &mut BTreeMap<String, String>, key: &str, value: Option<String>) {
    match value {
        Some(v) if !v.is_empty() => {
            map.insert(key.to_string(), v);
        }
        _ => {
            map.remove(key);
        }
    }
}

/// Concurrent `PeerId -> PeerIdentity` map.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: DashMap<PeerId, PeerIdentity>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, identity: PeerIdentity) -> Option<PeerIdentity> {
        self.peers.insert(identity.id, identity)
    }

    pub fn remove(&self, id: PeerId) -> Option<PeerIdentity> {
        self.peers.remove(&id).map(|(_, identity)| identity)
    }

    pub fn get(&self, id: PeerId) -> Option<PeerIdentity> {
        self.peers.get(&id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Ids in ascending order.
    pub fn ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn snapshot(&self) -> Vec<PeerIdentity> {
        let mut all: Vec<PeerIdentity> = self.peers.iter().map(|e| e.value().clone()).collect();
        all.sort_unstable_by_key(|identity| identity.id);
        all
    }

    /// Mutate one entry in place and return the updated copy.
    pub fn update<F>(&self, id: PeerId, f: F) -> Option<PeerIdentity>
    where
        F: FnOnce(&mut PeerIdentity),
    {
        let mut entry = self.peers.get_mut(&id)?;
        f(entry.value_mut());
        Some(entry.value().clone())
    }
}

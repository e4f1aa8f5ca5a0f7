//! # P2P Negotiation & Relay Messages
//!
//! Control-plane objects exchanged between peers and the hub:
//!
//! - [`PeerServerNegotiation`]: a requester offers a direct listener to a target
//! - [`LinkToken`]: first frame a dialer writes on a direct listener
//! - [`RedirectEnvelope`]: an object relayed through the hub
//! - [`RoutingFailure`]: the hub could not deliver a relay or an offer
//!
//! The inner payload of a redirect stays an inert [`Value`] at the hub; only
//! the recipient reconstructs it, after its own gate approves the inner key.

use crate::core::envelope::{Envelope, HEARTBEAT, HEARTBEAT_ACK};
use crate::core::value::Value;
use crate::core::wire::Wire;
use crate::protocol::identity::PeerId;
use crate::wire_struct;

pub const IDENTIFIER: &str = "peer.Identifier";
pub const PEER_SERVER_NEGOTIATION: &str = "peer.PeerServerNegotiation";
pub const REDIRECT_ENVELOPE: &str = "peer.RedirectEnvelope";
pub const ROUTING_FAILURE: &str = "peer.RoutingFailure";
pub const LINK_TOKEN: &str = "peer.LinkToken";

/// Keys that may never be carried inside a [`RedirectEnvelope`].
pub const CONTROL_PLANE_TYPES: &[&str] = &[
    IDENTIFIER,
    PEER_SERVER_NEGOTIATION,
    REDIRECT_ENVELOPE,
    ROUTING_FAILURE,
    LINK_TOKEN,
    HEARTBEAT,
    HEARTBEAT_ACK,
];

pub fn is_control_plane(type_key: &str) -> bool {
    CONTROL_PLANE_TYPES.contains(&type_key)
}

wire_struct! {
    /// Offer of a direct listener from `requester` to `target`.
    #[derive(Debug, Clone, PartialEq, Default)]
    pub struct PeerServerNegotiation = "peer.PeerServerNegotiation" {
        /// Empty until the hub fills in the requester's address.
        pub host: String,
        pub port: u16,
        pub requester: PeerId,
        pub target: PeerId,
        /// Format name of the requester's serializer.
        pub serializer: String,
        /// Set when the listener has retired.
        pub shutdown: bool,
        /// One-time secret; only the target learns it from the hub.
        pub token: u64,
    }
}

wire_struct! {
    /// Proof that a dialer is the peer an offer was forwarded to.
    #[derive(Debug, Clone, PartialEq, Default)]
    pub struct LinkToken = "peer.LinkToken" {
        pub token: u64,
    }
}

impl PeerServerNegotiation {
    /// Copy announcing that the listener is gone.
    pub fn retired(&self) -> Self {
        Self {
            shutdown: true,
            ..self.clone()
        }
    }
}

wire_struct! {
    #[derive(Debug, Clone, PartialEq, Default)]
    pub struct RedirectEnvelope = "peer.RedirectEnvelope" {
        /// Overwritten by the hub with the real sender.
        pub sender: PeerId,
        pub recipient: PeerId,
        pub inner_type_key: String,
        pub inner_payload: Value,
    }
}

impl RedirectEnvelope {
    pub fn wrap<T: Wire>(recipient: PeerId, object: &T) -> Self {
        Self {
            sender: PeerId::default(),
            recipient,
            inner_type_key: T::TYPE_KEY.to_string(),
            inner_payload: object.to_record(),
        }
    }

    /// The relayed envelope, still unreconstructed.
    pub fn into_inner(self) -> Envelope {
        Envelope::new(self.inner_type_key, self.inner_payload)
    }
}

wire_struct! {
    #[derive(Debug, Clone, PartialEq, Default)]
    pub struct RoutingFailure = "peer.RoutingFailure" {
        pub recipient: PeerId,
        pub type_key: String,
        pub reason: String,
    }
}

//! # Protocol Layer
//!
//! What travels over a connection once bytes have become envelopes.
//!
//! ## Components
//! - **Dispatcher**: type-key handler table plus connect/disconnect/error callbacks
//! - **Identity**: peer ids, the `Identifier` message and the hub directory
//! - **Negotiation**: direct-link offers, hub relay and routing failures

pub mod dispatcher;
pub mod identity;
pub mod negotiation;

pub use dispatcher::{Dispatcher, MessageContext};
pub use identity::{IdentityAction, Identifier, PeerDirectory, PeerId, PeerIdentity};
pub use negotiation::{LinkToken, PeerServerNegotiation, RedirectEnvelope, RoutingFailure};

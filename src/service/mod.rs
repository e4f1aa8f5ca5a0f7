//! # Peer Services
//!
//! - [`hub::Hub`]: identity exchange, metadata, relay and offer forwarding
//! - [`peer::PeerClient`]: hub link, identity mirrors and direct P2P links

pub mod hub;
pub mod peer;

pub use hub::Hub;
pub use peer::{PeerClient, Route};

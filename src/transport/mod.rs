//! # Transport Layer
//!
//! Connections over TCP and WebSocket, serviced by a shared scheduler.
//!
//! ## Components
//! - **Stream**: socket halves and the per-connection reader task
//! - **Connection**: send queue, receive buffer, bandwidth meters, close path
//! - **Registry**: client/server maps plus the five scheduler workers
//! - **Endpoint**: dial, listen and adopt established streams
//! - **Options**: codec, gate and caps shared by an endpoint's connections
//!
//! ## Failure Scoping
//! - Socket, framing and timeout failures close the connection
//! - Gate rejections and decode failures drop only the message

pub mod connection;
pub mod endpoint;
pub mod options;
pub mod registry;
pub mod stream;

pub use connection::{Connection, ConnectionId, ConnectionState, ConnectionStats, Role};
pub use endpoint::{Endpoint, Listener};
pub use options::ConnectionOptions;
pub use registry::{Registry, Worker};
pub use stream::{TransportKind, TransportStream};

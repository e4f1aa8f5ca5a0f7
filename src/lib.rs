//! # peerwire
//!
//! Typed TCP and WebSocket transport with a type-gated wire envelope and a
//! hub-mediated peer layer.
//!
//! ## Layers
//! - [`core`]: values, typed wire objects, envelope, type gate, framing and codecs
//! - [`transport`]: connections, the registry and its five scheduler workers, endpoints
//! - [`protocol`]: dispatch table, peer identity and negotiation messages
//! - [`service`]: the hub and the peer client
//! - [`utils`]: compression, bandwidth meters, port probing, logging, metrics
//!
//! ## Quick Start
//! ```rust,no_run
//! use std::sync::Arc;
//! use peerwire::core::gate::TypeGate;
//! use peerwire::protocol::Dispatcher;
//! use peerwire::transport::{ConnectionOptions, Endpoint, Registry};
//! use peerwire::wire_struct;
//!
//! wire_struct! {
//!     #[derive(Debug, Clone, Default, PartialEq)]
//!     pub struct Chat = "app.Chat" {
//!         pub text: String,
//!     }
//! }
//!
//! # async fn run() -> peerwire::error::Result<()> {
//! let dispatcher = Arc::new(Dispatcher::new());
//! dispatcher.register::<Chat, _>(|ctx, chat| {
//!     println!("{} says {}", ctx.connection().remote_addr(), chat.text);
//!     Ok(())
//! });
//!
//! let options = ConnectionOptions::default()
//!     .with_gate(TypeGate::with_control_plane().allow_type::<Chat>());
//! let endpoint = Endpoint::new(Registry::new(), options, dispatcher);
//! let listener = endpoint.listen("127.0.0.1:0").await?;
//!
//! let conn = endpoint.connect(&listener.local_addr().to_string()).await?;
//! conn.send(&Chat { text: "hello".into() })?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::core::envelope::Envelope;
pub use crate::core::gate::TypeGate;
pub use crate::core::value::{FieldValue, Value};
pub use crate::core::wire::Wire;
pub use crate::error::{ProtocolError, Result};

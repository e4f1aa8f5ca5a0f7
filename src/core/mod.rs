//! # Core Wire Components
//!
//! Everything between a typed object and the bytes on the socket.
//!
//! ## Components
//! - **Value / Wire**: inert document tree and explicit per-type encode/decode
//! - **Envelope**: `{type_key, value}` unit plus the reserved heartbeat keys
//! - **Gate**: allow/deny check applied before any reconstruction
//! - **Frame**: `[u32 BE length][payload]` tokio codec
//! - **Codec**: flags byte, optional compression and the pluggable serializer
//!
//! ## Wire Format
//! ```text
//! [Length(4, BE)] [Flags(1)] [Serialized Envelope(N)]
//! ```
//!
//! ## Security
//! - Declared frame length is checked against the buffer cap before buffering
//! - Type keys are gated before any field is decoded, nested objects included
//! - Object nesting is bounded

pub mod codec;
pub mod envelope;
pub mod frame;
pub mod gate;
pub mod serialization;
pub mod value;
pub mod wire;

//! # Utility Modules
//!
//! Supporting pieces used by the transport and the peer layer.
//!
//! ## Components
//! - **Compression**: LZ4 and Zstd behind the [`Compressor`](compression::Compressor) trait
//! - **Bandwidth**: per-direction byte windows and caps
//! - **Ports**: random-offset probing of a bounded port range
//! - **Logging**: `tracing-subscriber` setup from configuration
//! - **Metrics**: atomic counters owned by a registry
//!
//! ## Security
//! - Decompression bomb protection (capped at the frame size limit)

pub mod bandwidth;
pub mod compression;
pub mod logging;
pub mod metrics;
pub mod ports;

pub use bandwidth::BandwidthMeter;
pub use metrics::{Metrics, MetricsSnapshot};

//! Options shared by every connection an endpoint creates.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{
    NetworkConfig, DEFAULT_BACKLOG, DEFAULT_CONNECTION_TIMEOUT, DEFAULT_READ_BUFFER_SIZE,
    MAX_FRAME_SIZE,
};
use crate::core::codec::EnvelopeCodec;
use crate::core::gate::TypeGate;
use crate::core::serialization::{SerializationFormat, Serializer};
use crate::error::Result;
use crate::utils::compression::{CompressionKind, Compressor};

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Liveness interval and per-frame write bound
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub backlog: u32,
    pub max_connections: usize,
    /// Cap on one frame and on unframed buffered bytes
    pub max_buffer_size: usize,
    pub read_buffer_size: usize,
    pub upload_limit: Option<u64>,
    pub download_limit: Option<u64>,
    pub codec: EnvelopeCodec,
    pub gate: Arc<TypeGate>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CONNECTION_TIMEOUT,
            connect_timeout: DEFAULT_CONNECTION_TIMEOUT,
            backlog: DEFAULT_BACKLOG,
            max_connections: 1000,
            max_buffer_size: MAX_FRAME_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            upload_limit: None,
            download_limit: None,
            codec: EnvelopeCodec::default(),
            gate: Arc::new(TypeGate::with_control_plane()),
        }
    }
}

fn cap(limit: u64) -> Option<u64> {
    (limit > 0).then_some(limit)
}

impl ConnectionOptions {
    /// Resolve serializer, compressor, gate and caps from configuration.
    pub fn from_config(config: &NetworkConfig) -> Result<Self> {
        let transport = &config.transport;
        let format = SerializationFormat::from_name(&transport.serialization)?;
        let mut codec =
            EnvelopeCodec::new(Arc::new(format)).with_max_frame_size(transport.max_buffer_size);
        if let Some(kind) = CompressionKind::from_name(&transport.compression)? {
            codec = codec.with_compressor(Arc::new(kind), transport.compression_threshold_bytes);
        }

        Ok(Self {
            timeout: transport.connection_timeout,
            connect_timeout: config.client.connect_timeout,
            backlog: config.server.backlog,
            max_connections: config.server.max_connections,
            max_buffer_size: transport.max_buffer_size,
            read_buffer_size: transport.read_buffer_size,
            upload_limit: cap(transport.upload_limit_bytes_per_sec),
            download_limit: cap(transport.download_limit_bytes_per_sec),
            codec,
            gate: Arc::new(TypeGate::from_config(&config.security)),
        })
    }

    pub fn with_gate(mut self, gate: TypeGate) -> Self {
        self.gate = Arc::new(gate);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_upload_limit(mut self, bytes_per_sec: u64) -> Self {
        self.upload_limit = cap(bytes_per_sec);
        self
    }

    pub fn with_download_limit(mut self, bytes_per_sec: u64) -> Self {
        self.download_limit = cap(bytes_per_sec);
        self
    }

    pub fn with_max_buffer_size(mut self, bytes: usize) -> Self {
        self.max_buffer_size = bytes;
        self.codec = self.codec.with_max_frame_size(bytes);
        self
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        let max = self.codec.max_frame_size();
        self.codec = EnvelopeCodec::new(serializer).with_max_frame_size(max);
        self
    }

    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>, threshold: usize) -> Self {
        self.codec = self.codec.with_compressor(compressor, threshold);
        self
    }
}

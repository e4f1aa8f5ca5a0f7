//! # Envelope Codec
//!
//! Turns envelopes into complete wire frames and frame payloads back into
//! envelopes. The payload carries a flags byte ahead of the serialized body:
//!
//! ```text
//! [length: u32 BE] [flags: u8] [body]
//! ```
//!
//! Flag bit 0 marks a compressed body. Any other set bit is rejected.

use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::config::MAX_FRAME_SIZE;
use crate::core::envelope::Envelope;
use crate::core::frame::HEADER_LEN;
use crate::core::serialization::{SerializationFormat, Serializer};
use crate::error::{constants, ProtocolError, Result};
use crate::utils::compression::Compressor;

pub const FLAG_COMPRESSED: u8 = 0x01;

/// Default body size below which compression is not attempted.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 512;

#[derive(Clone)]
pub struct EnvelopeCodec {
    serializer: Arc<dyn Serializer>,
    compressor: Option<Arc<dyn Compressor>>,
    compression_threshold: usize,
    max_frame_size: usize,
}

impl fmt::Debug for EnvelopeCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvelopeCodec")
            .field("serializer", &self.serializer.descriptor())
            .field("compressor", &self.compressor.as_ref().map(|c| c.name()))
            .field("compression_threshold", &self.compression_threshold)
            .field("max_frame_size", &self.max_frame_size)
            .finish()
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(Arc::new(SerializationFormat::default()))
    }
}

impl EnvelopeCodec {
    pub fn new(serializer: Arc<dyn Serializer>) -> Self {
        Self {
            serializer,
            compressor: None,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>, threshold: usize) -> Self {
        self.compressor = Some(compressor);
        self.compression_threshold = threshold;
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn serializer_name(&self) -> &'static str {
        self.serializer.descriptor()
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Serialize, maybe compress, and frame `envelope`.
    pub fn encode(&self, envelope: &Envelope) -> Result<Bytes> {
        let body = self.serializer.serialize(envelope)?;
        let (body, flags) = match &self.compressor {
            Some(compressor) => {
                let (out, packed) =
                    compressor.compress_adaptive(&body, self.compression_threshold)?;
                (out, if packed { FLAG_COMPRESSED } else { 0 })
            }
            None => (body, 0),
        };

        let payload_len = body.len() + 1;
        if payload_len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge(payload_len));
        }

        let mut frame = BytesMut::with_capacity(HEADER_LEN + payload_len);
        frame.put_u32(payload_len as u32);
        frame.put_u8(flags);
        frame.extend_from_slice(&body);
        Ok(frame.freeze())
    }

    /// Decode one frame payload (length header already stripped).
    pub fn decode(&self, payload: &[u8]) -> Result<Envelope> {
        let (&flags, body) = payload.split_first().ok_or_else(|| {
            ProtocolError::SerializationError(constants::ERR_EMPTY_FRAME.to_string())
        })?;
        if flags & !FLAG_COMPRESSED != 0 {
            return Err(ProtocolError::SerializationError(
                constants::ERR_UNKNOWN_FRAME_FLAGS.to_string(),
            ));
        }

        if flags & FLAG_COMPRESSED != 0 {
            let compressor = self.compressor.as_ref().ok_or_else(|| {
                ProtocolError::SerializationError(constants::ERR_NO_COMPRESSOR.to_string())
            })?;
            let body = compressor.decompress(body)?;
            self.serializer.deserialize(&body)
        } else {
            self.serializer.deserialize(body)
        }
    }
}

#![no_main]

use std::sync::Arc;

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use peerwire::core::codec::EnvelopeCodec;
use peerwire::core::frame::FrameCodec;
use peerwire::core::gate::TypeGate;
use peerwire::core::serialization::SerializationFormat;
use peerwire::protocol::{Identifier, RedirectEnvelope};
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Framing over arbitrary bytes
    let mut frames = FrameCodec::new(64 * 1024);
    let mut buffer = BytesMut::from(data);
    while let Ok(Some(_)) = frames.decode(&mut buffer) {}

    // Envelope decode plus gated reconstruction for every serializer
    let gate = TypeGate::with_control_plane();
    for format in [
        SerializationFormat::Json,
        SerializationFormat::Bincode,
        SerializationFormat::MessagePack,
    ] {
        let codec = EnvelopeCodec::new(Arc::new(format));
        if let Ok(envelope) = codec.decode(data) {
            let _ = envelope.clone().unwrap::<Identifier>(&gate);
            let _ = envelope.unwrap::<RedirectEnvelope>(&gate);
        }
    }
});

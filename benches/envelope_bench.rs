#![allow(clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use peerwire::core::codec::EnvelopeCodec;
use peerwire::core::envelope::Envelope;
use peerwire::core::frame::HEADER_LEN;
use peerwire::core::gate::TypeGate;
use peerwire::core::serialization::SerializationFormat;
use peerwire::utils::compression::CompressionKind;
use peerwire::wire_struct;

wire_struct! {
    #[derive(Debug, Clone, PartialEq, Default)]
    pub struct Reading = "bench.Reading" {
        pub sensor: String,
        pub value: f64,
        pub samples: Vec<u32>,
    }
}

wire_struct! {
    #[derive(Debug, Clone, PartialEq, Default)]
    pub struct Batch = "bench.Batch" {
        pub station: u64,
        pub readings: Vec<Reading>,
        pub labels: BTreeMap<String, String>,
    }
}

fn batch() -> Batch {
    let readings = (0..32i32)
        .map(|i| Reading {
            sensor: format!("sensor-{i}"),
            value: f64::from(i) * 0.5,
            samples: (0..16).collect(),
        })
        .collect();
    let mut labels = BTreeMap::new();
    labels.insert("site".to_string(), "north".to_string());
    Batch {
        station: 42,
        readings,
        labels,
    }
}

fn bench_envelope_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_codec");
    let gate = TypeGate::new().allow_type::<Batch>().allow_type::<Reading>();
    let sample = batch();

    for format in [
        SerializationFormat::Json,
        SerializationFormat::Bincode,
        SerializationFormat::MessagePack,
    ] {
        let codec = EnvelopeCodec::new(Arc::new(format));
        let name = codec.serializer_name();

        group.bench_function(format!("encode_{name}"), |b| {
            b.iter(|| codec.encode(&Envelope::wrap(&sample)).unwrap())
        });

        let frame = codec.encode(&Envelope::wrap(&sample)).unwrap();
        group.bench_function(format!("decode_unwrap_{name}"), |b| {
            b.iter_batched(
                || frame.clone(),
                |frame| {
                    let envelope = codec.decode(&frame[HEADER_LEN..]).unwrap();
                    let (decoded, _) = envelope.unwrap::<Batch>(&gate).unwrap();
                    assert_eq!(decoded.station, 42);
                },
                BatchSize::SmallInput,
            )
        });
    }

    let packed = EnvelopeCodec::default().with_compressor(Arc::new(CompressionKind::Lz4), 512);
    group.bench_function("encode_json_lz4", |b| {
        b.iter(|| packed.encode(&Envelope::wrap(&sample)).unwrap())
    });

    group.finish();
}

fn bench_gate_rejection(c: &mut Criterion) {
    let gate = TypeGate::new().allow_type::<Reading>();
    let envelope = Envelope::wrap(&batch());
    c.bench_function("gate_reject_unlisted", |b| {
        b.iter_batched(
            || envelope.clone(),
            |envelope| assert!(envelope.unwrap::<Batch>(&gate).is_err()),
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_envelope_codec, bench_gate_rejection);
criterion_main!(benches);

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use node_comm::codec;
use node_comm::transmitter::Transmitter;
use node_comm::{payload, DispatchTable, Envelope, MessageKind, Payload, Priority};
use serde_json::json;
use std::net::SocketAddr;

fn sample_envelope() -> Envelope {
    Envelope::new(
        MessageKind::Data,
        "nav_node",
        "master_core",
        payload(json!({
            "position": {"lat": 59.3293, "lon": 18.0686, "alt": 120.5},
            "heading": 271.0,
            "battery": 83,
            "sensors": ["gps", "imu", "baro"],
        })),
    )
    .with_priority(Priority::High)
    .with_requires_ack(true)
}

fn benchmark_encode(c: &mut Criterion) {
    let envelope = sample_envelope();

    c.bench_function("encode_envelope", |b| {
        b.iter(|| Transmitter::serialize_envelope(black_box(&envelope)));
    });
}

fn benchmark_decode(c: &mut Criterion) {
    let bytes = codec::encode(&sample_envelope()).unwrap();

    c.bench_function("decode_envelope", |b| {
        b.iter(|| codec::decode(black_box(&bytes)));
    });
}

fn benchmark_dispatch(c: &mut Criterion) {
    let table: DispatchTable<()> = DispatchTable::new();
    table.register(MessageKind::Data, |_: &(), _: &Envelope, _| Ok(()));
    table.register("calibrate", |_: &(), _: &Envelope, _| Ok(()));
    let from: SocketAddr = "127.0.0.1:14551".parse().unwrap();

    let data = sample_envelope();
    let command = Envelope::new(
        MessageKind::Command,
        "master_core",
        "nav_node",
        payload(json!({"command": "calibrate"})),
    );
    let unhandled = Envelope::new(MessageKind::Status, "master_core", "nav_node", Payload::new());

    c.bench_function("dispatch_mixed_kinds", |b| {
        b.iter(|| {
            for envelope in [&data, &command, &unhandled] {
                table.dispatch(&(), black_box(envelope), from);
            }
        });
    });
}

criterion_group!(benches, benchmark_encode, benchmark_decode, benchmark_dispatch);
criterion_main!(benches);

//! Latency benchmarks for Aurora.
//!
//! These benchmarks drive the messenger the way a socket task does and
//! measure the time per frame.

use aurora_bench::{connect, message, messenger, session};
use aurora_core::session::{SessionValidator, StoredSessions};
use aurora_core::storage::MemoryStorage;
use aurora_protocol::{codec, Frame};
use axum::http::{header, HeaderMap, HeaderValue};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Runtime;

/// Benchmark round-trip encode/decode latency.
fn bench_codec_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec_roundtrip");

    let frame = Frame::Send(message(256));

    group.bench_function("256B", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&frame)).unwrap();
            codec::decode(black_box(&encoded)).unwrap()
        });
    });

    group.finish();
}

/// Benchmark the send path end to end.
fn bench_send(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("send");

    group.bench_function("offline_recipient", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let messenger = messenger();
                let (alice, _rx) = connect(&messenger, "alice");

                let start = Instant::now();
                for _ in 0..iters {
                    let replies = messenger.handle_frame(&alice, Frame::Send(message(64))).await;
                    black_box(replies);
                }
                start.elapsed()
            })
        });
    });

    group.bench_function("online_recipient", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let messenger = messenger();
                let (alice, _alice_rx) = connect(&messenger, "alice");
                let (bob, mut bob_rx) = connect(&messenger, "bob");

                let start = Instant::now();
                for _ in 0..iters {
                    let replies = messenger.handle_frame(&alice, Frame::Send(message(64))).await;
                    black_box(replies);
                    while let Ok(delivery) = bob_rx.try_recv() {
                        black_box(messenger.handle_delivery(&bob, &delivery).await);
                    }
                }
                start.elapsed()
            })
        });
    });

    group.finish();
}

/// Benchmark handshake validation.
fn bench_handshake(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let sessions = StoredSessions::new(Arc::new(MemoryStorage::new()), "aurora");
    rt.block_on(sessions.insert("token", &session("alice"))).unwrap();

    let mut headers = HeaderMap::new();
    headers.insert(header::COOKIE, HeaderValue::from_static("theme=dark; aurora=token"));

    c.bench_function("handshake", |b| {
        b.iter(|| rt.block_on(sessions.validate(black_box(&headers))));
    });
}

criterion_group!(benches, bench_codec_roundtrip, bench_send, bench_handshake);
criterion_main!(benches);

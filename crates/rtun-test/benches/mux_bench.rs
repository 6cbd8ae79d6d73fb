//! Throughput benchmark for `rtun_core::mux::Multiplexer`: how fast one virtual
//! connection can absorb `DATA` frames before backpressure has to kick in, and how much
//! registering/tearing down virtual connections costs per call.

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use rtun_core::mux::Multiplexer;
use rtun_core::types::{Protocol, TargetAddr};
use uuid::Uuid;

fn target() -> TargetAddr {
    TargetAddr::Domain("bench.example".into(), 443)
}

fn bench_deliver_data(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let chunk = Bytes::from(vec![0u8; 4 * 1024]);

    let mut group = c.benchmark_group("mux_deliver_data");
    group.throughput(Throughput::Bytes(chunk.len() as u64));
    group.bench_function("accept_then_deliver_and_drain", |b| {
        b.iter_batched(
            || {
                rt.block_on(async {
                    let mux = Multiplexer::new();
                    let id = Uuid::new_v4();
                    let (conn, rx) = mux.accept(id, target(), Protocol::Tcp).await;
                    (mux, conn, rx, id)
                })
            },
            |(mux, conn, mut rx, id)| {
                rt.block_on(async {
                    conn.push_inbound(chunk.clone()).await.unwrap();
                    let drained = rx.recv().await.unwrap();
                    conn.release_inbound(drained.len());
                    mux.remove(&id).await;
                })
            },
            BatchSize::SmallInput,
        );
    });
    group.finish();
}

fn bench_open_ack_roundtrip(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("mux_open_ack_roundtrip", |b| {
        b.iter_batched(
            Multiplexer::new,
            |mux| {
                rt.block_on(async {
                    let id = Uuid::new_v4();
                    let opened = mux.open(id, target(), Protocol::Tcp).await;
                    mux.deliver_ack(&id, Ok(())).await;
                    opened.wait_for_ack(&mux).await.unwrap();
                })
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_deliver_data, bench_open_ack_roundtrip);
criterion_main!(benches);

//! Handoff benchmarks
//!
//! Spinlock acquire/release, shared-memory publish and consume, and
//! control-message framing.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;
use switchyard::protocol::{self, HeartbeatRequest, MessageType};
use switchyard::shm_channel::HEADER_SIZE;
use switchyard::spinlock::{SpinLock, SpinLockState};
use switchyard::{FrameInfo, ShmConsumer, ShmProducer};

fn bench_spinlock(c: &mut Criterion) {
    let state = SpinLockState::new();
    let lock = SpinLock::new(&state);

    c.bench_function("spinlock_uncontended", |b| {
        b.iter(|| {
            assert!(lock.try_lock_for(Duration::from_millis(1)));
            lock.unlock();
        });
    });

    c.bench_function("spinlock_reentrant", |b| {
        assert!(lock.try_lock_for(Duration::from_millis(1)));
        b.iter(|| {
            assert!(lock.try_lock_for(Duration::from_millis(1)));
            lock.unlock();
        });
        lock.unlock();
    });
}

fn bench_shm_handoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("shm_publish_consume");

    for size in [64usize, 4 * 1024, 256 * 1024] {
        let channel = format!("bench_{}_{}", std::process::id(), size);
        let mut producer = ShmProducer::create(&channel, HEADER_SIZE + size).unwrap();
        let mut consumer = ShmConsumer::attach(&channel, Duration::from_secs(1)).unwrap();
        let payload = vec![0xabu8; size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| {
                producer.publish(payload, FrameInfo::new(payload.len())).unwrap();
                let frame = consumer.consume_next(Some(Duration::from_secs(1))).unwrap().unwrap();
                black_box(frame.data()[0]);
            });
        });
    }

    group.finish();
}

fn bench_framing(c: &mut Criterion) {
    let req = HeartbeatRequest {
        channel_name: "camera_front".to_string(),
        producer_pid: 4242,
    };

    c.bench_function("heartbeat_encode_decode", |b| {
        b.iter(|| {
            let frames = protocol::encode(MessageType::HeartbeatReq, black_box(&req)).unwrap();
            let env = protocol::decode(frames).unwrap();
            black_box(env.parse_body::<HeartbeatRequest>().unwrap());
        });
    });
}

criterion_group!(benches, bench_spinlock, bench_shm_handoff, bench_framing);
criterion_main!(benches);

//! ByteQueue benchmarks: enqueue/drain patterns the connection worker uses.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use gangway_core::buffer::ByteQueue;

fn bench_enqueue_dequeue(c: &mut Criterion) {
    c.bench_function("enqueue_dequeue_aligned_4k", |b| {
        let chunk = Bytes::from(vec![0xAB_u8; 4096]);
        b.iter(|| {
            let mut q = ByteQueue::new();
            for _ in 0..64 {
                q.enqueue(chunk.clone());
            }
            while !q.is_empty() {
                black_box(q.dequeue(4096));
            }
        });
    });

    c.bench_function("enqueue_dequeue_straddling", |b| {
        let chunk = Bytes::from(vec![0xCD_u8; 4096]);
        b.iter(|| {
            let mut q = ByteQueue::new();
            for _ in 0..64 {
                q.enqueue(chunk.clone());
            }
            // Misaligned drains force the spanning copy path.
            while !q.is_empty() {
                black_box(q.dequeue(3000));
            }
        });
    });
}

fn bench_peek_discard(c: &mut Criterion) {
    c.bench_function("peek_then_discard_64k", |b| {
        let chunk = Bytes::from(vec![0xEF_u8; 65536]);
        b.iter(|| {
            let mut q = ByteQueue::new();
            for _ in 0..16 {
                q.enqueue(chunk.clone());
            }
            // The socket worker's drain pattern: peek a send window, then
            // discard however much the OS accepted.
            while !q.is_empty() {
                let window = q.peek(65536);
                let sent = window.len() / 2 + 1;
                q.discard(black_box(sent));
            }
        });
    });
}

criterion_group!(benches, bench_enqueue_dequeue, bench_peek_discard);
criterion_main!(benches);

//! Correlation engine benchmark suite.
//!
//! Measures the per-command cost of the engine at different pipeline
//! depths, and inbound line parsing:
//! - Outstanding commands: 1, 100, 1000, 9999
//!
//! Run with: cargo bench --bench correlation
//! Results saved to: target/criterion/

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use micro_gateway::protocol::Inbound;
use micro_gateway::{Command, CommandBody, CommandQueue, SegmentId};
use serde_json::json;

// ============================================================================
// Benchmark Parameters
// ============================================================================

const PIPELINE_DEPTHS: &[usize] = &[1, 100, 1000, 9999];

// ============================================================================
// Benchmark: Enqueue, Drain, Resolve
// ============================================================================

fn bench_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("round_trip");

    for &depth in PIPELINE_DEPTHS {
        group.throughput(Throughput::Elements(depth as u64));
        group.bench_with_input(BenchmarkId::new("depth", depth), &depth, |b, &depth| {
            b.iter(|| {
                let mut queue = CommandQueue::new();
                let mut ids = Vec::with_capacity(depth);

                for i in 0..depth {
                    let body = CommandBody::SetSegmentEffect {
                        effect: (i % 8) as u8,
                        segment_id: SegmentId::new(3),
                    };
                    ids.push(queue.enqueue(Command::new(body)).expect("enqueue"));
                }
                while let Some(request) = queue.drain_next() {
                    black_box(request.to_line().expect("encode"));
                }
                // Replies in reverse order
                for id in ids.into_iter().rev() {
                    black_box(queue.resolve(id, vec![json!(1)]).expect("resolve"));
                }
            });
        });
    }

    group.finish();
}

// ============================================================================
// Benchmark: Inbound Parsing
// ============================================================================

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");

    let lines = [
        ("ack", "[42,1]".to_string()),
        ("diagnostic", "[0,132,\"segment 3 resized\"]".to_string()),
        (
            "state",
            format!(
                "[1,[7,50,600,[{}]]]",
                (0..12)
                    .map(|i| format!("[{},50,1,{}]", i * 50, 100 + i))
                    .collect::<Vec<_>>()
                    .join(",")
            ),
        ),
    ];

    for (name, line) in &lines {
        group.bench_with_input(BenchmarkId::new("line", name), line, |b, line| {
            b.iter(|| black_box(Inbound::parse(black_box(line)).expect("parse")));
        });
    }

    group.finish();
}

// ============================================================================
// Main
// ============================================================================

criterion_group!(benches, bench_round_trip, bench_parse);
criterion_main!(benches);

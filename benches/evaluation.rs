//! Performance benchmarks for operator evaluation and feed handling.
//!
//! Run with: `cargo bench --bench evaluation`
//!
//! ## Performance Targets
//!
//! | Operation | Target | Notes |
//! |-----------|--------|-------|
//! | Operator chain (1k) | <5ms | Converges in one sweep |
//! | Operator ring (1k) | <50ms | Cyclic, Gauss-Seidel rounds |
//! | Feed parse (1k lines) | <5ms | Entry cap reached |
//! | Cached authority | <50µs | LRU hit, no fetch |

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use trust_kernel::authority::{parse_feed, AuthorityCache, FeedSnapshot, ResolveError};
use trust_kernel::{
    rank_providers, EvaluationLimits, OperatorEvaluator, OperatorKind, TrustEntry, TruthTable,
};

/// Facts `f0..f{n}` with a chain of operators each reading the previous one.
fn make_chain(n: usize) -> TruthTable {
    let mut entries = vec![TrustEntry::fact("f0", 0.7)];
    for i in 1..=n {
        entries.push(TrustEntry::fact(format!("f{i}"), 0.5));
        let prev = if i == 1 { "f0".to_string() } else { format!("op{:05}", i - 1) };
        let op = if i % 3 == 1 { OperatorKind::Or } else { OperatorKind::And };
        entries.push(TrustEntry::operator(format!("op{i:05}"), op, [prev, format!("f{i}")]));
    }
    TruthTable::from_entries(entries).expect("unique ids")
}

/// Ring of alternating Or/Not operators feeding back into the first.
fn make_ring(n: usize) -> TruthTable {
    let mut entries = vec![TrustEntry::fact("seed", 0.3)];
    for i in 0..n {
        let next = format!("r{:05}", (i + 1) % n);
        let op = if i % 2 == 0 {
            TrustEntry::operator(format!("r{i:05}"), OperatorKind::Or, ["seed".to_string(), next])
        } else {
            TrustEntry::operator(format!("r{i:05}"), OperatorKind::Not, [next])
        };
        entries.push(op);
    }
    TruthTable::from_entries(entries).expect("unique ids")
}

fn make_feed(lines: usize) -> String {
    (0..lines)
        .map(|i| format!("{{\"type\":\"fact\",\"id\":\"r{i}\",\"certainty\":0.{}}}\n", i % 10))
        .collect()
}

fn bench_operator_chain(c: &mut Criterion) {
    let evaluator = OperatorEvaluator::new(EvaluationLimits::default());
    let mut group = c.benchmark_group("operator_chain");

    for n in [10, 100, 1000] {
        let table = make_chain(n);
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("operators", n), &table, |b, table| {
            b.iter(|| evaluator.evaluate(black_box(table)))
        });
    }

    group.finish();
}

fn bench_operator_ring(c: &mut Criterion) {
    let evaluator = OperatorEvaluator::new(EvaluationLimits::default());
    let mut group = c.benchmark_group("operator_ring");

    for n in [10, 100, 1000] {
        let table = make_ring(n);
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("operators", n), &table, |b, table| {
            b.iter(|| evaluator.evaluate(black_box(table)))
        });
    }

    group.finish();
}

fn bench_feed_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("feed_parse");

    for lines in [100, 1000, 5000] {
        let feed = make_feed(lines);
        group.throughput(Throughput::Bytes(feed.len() as u64));
        group.bench_with_input(BenchmarkId::new("lines", lines), &feed, |b, feed| {
            b.iter(|| parse_feed(black_box(feed.as_bytes()), 1000).expect("utf-8"))
        });
    }

    group.finish();
}

fn bench_provider_ranking(c: &mut Criterion) {
    let providers: Vec<TrustEntry> = (0..256)
        .map(|i| TrustEntry::provider(format!("p{i}"), ((i * 37) % 200) as f64 / 100.0 - 1.0, "agent://bench"))
        .collect();

    c.bench_function("rank_providers_256", |b| {
        b.iter(|| rank_providers(black_box(&providers)))
    });
}

fn bench_cached_authority(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime");
    let cache = Arc::new(AuthorityCache::new(64));
    let url = "https://bench.example/feed.jsonl";
    let ttl = Duration::from_secs(3600);
    let snapshot = FeedSnapshot {
        records: Arc::new(vec![TrustEntry::fact("r1", 1.0)]),
        digest: "bench".to_string(),
        truncated: false,
    };

    runtime.block_on(async {
        let warm = snapshot.clone();
        cache
            .get_or_fetch(url, ttl, || async move { Ok::<_, ResolveError>(warm) })
            .await
            .expect("warm");
    });

    c.bench_function("cached_authority_hit", |b| {
        b.iter(|| {
            runtime.block_on(async {
                cache
                    .get_or_fetch(black_box(url), ttl, || async { Err(ResolveError::Timeout) })
                    .await
            })
        })
    });
}

criterion_group!(
    benches,
    bench_operator_chain,
    bench_operator_ring,
    bench_feed_parse,
    bench_provider_ranking,
    bench_cached_authority,
);
criterion_main!(benches);

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use relevo::error::{message_indicates_connection_loss, EngineError};
use std::io;
use std::time::Duration;

/// Engine error texts with their expected classification. Mirrors the
/// mix a busy proxy sees: mostly ordinary statement errors, the odd
/// disconnect buried in driver prose.
const CORPUS: &[(&str, bool)] = &[
    ("connection reset by peer", true),
    ("FATAL: terminating connection due to administrator command", true),
    ("duplicate key value violates unique constraint \"orders_pkey\"", false),
    ("ERROR 1045 (28000): Access denied for user 'app'@'10.0.0.12'", false),
    ("write failed after 3 retries on socket 42: Broken pipe", true),
    ("syntax error at or near \"SELCT\" at character 1", false),
    ("Lost connection to MySQL server during query", true),
    ("deadlock detected while waiting for ShareLock on transaction 90211", false),
];

/// Phrase scan over single messages of different shapes
fn bench_message_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_scan");

    let long_miss = format!(
        "could not serialize access due to concurrent update, retry transaction {}",
        "x".repeat(512)
    );
    let long_hit = format!("{}: server closed the connection unexpectedly", "x".repeat(512));

    group.bench_function("hit_early", |b| {
        b.iter(|| {
            black_box(message_indicates_connection_loss(black_box(
                "connection reset by peer",
            )));
        });
    });

    group.bench_function("hit_late", |b| {
        b.iter(|| {
            black_box(message_indicates_connection_loss(black_box(&long_hit)));
        });
    });

    group.bench_function("miss_short", |b| {
        b.iter(|| {
            black_box(message_indicates_connection_loss(black_box(
                "relation \"users\" does not exist",
            )));
        });
    });

    group.bench_function("miss_long", |b| {
        b.iter(|| {
            black_box(message_indicates_connection_loss(black_box(&long_miss)));
        });
    });

    group.bench_function("mixed_corpus", |b| {
        b.iter(|| {
            let mut hits = 0usize;
            for (message, _) in CORPUS {
                if message_indicates_connection_loss(message) {
                    hits += 1;
                }
            }
            black_box(hits);
        });
    });

    group.finish();
}

/// Full classification including the I/O-kind fast path
fn bench_error_classification(c: &mut Criterion) {
    let mut group = c.benchmark_group("error_classification");

    let io_by_kind = EngineError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "write failed"));
    let io_by_text = EngineError::Io(io::Error::new(
        io::ErrorKind::Other,
        "server closed the connection unexpectedly",
    ));
    let server_hit = EngineError::server("Lost connection to MySQL server during query");
    let server_miss = EngineError::server("duplicate key value violates unique constraint");
    let timeout = EngineError::timeout(Duration::from_secs(5));

    group.bench_function("io_by_kind", |b| {
        b.iter(|| black_box(io_by_kind.is_connectivity_loss()));
    });

    group.bench_function("io_by_text", |b| {
        b.iter(|| black_box(io_by_text.is_connectivity_loss()));
    });

    group.bench_function("server_hit", |b| {
        b.iter(|| black_box(server_hit.is_connectivity_loss()));
    });

    group.bench_function("server_miss", |b| {
        b.iter(|| black_box(server_miss.is_connectivity_loss()));
    });

    group.bench_function("timeout", |b| {
        b.iter(|| black_box(timeout.is_connectivity_loss()));
    });

    group.finish();
}

criterion_group!(benches, bench_message_scan, bench_error_classification);
criterion_main!(benches);

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use relevo::topology::TopologyService;
use relevo::{
    ClusterId, Config, ConnectionFactory, Endpoint, EngineError, ExecuteOutcome, HostInfo,
    HostRole, MemberRecord, Operation, PhysicalConnection, SessionSetting, Topology,
    TopologySource,
};
use std::sync::Arc;
use tokio::runtime::Runtime;

/// Build a membership list with one writer and `count - 1` readers
fn make_hosts(count: usize) -> Vec<HostInfo> {
    (0..count)
        .map(|i| {
            let endpoint = Endpoint::new(format!("host-{}.cluster.local", i), 5432);
            let role = if i == 0 {
                HostRole::Writer
            } else {
                HostRole::Reader
            };
            HostInfo::new(endpoint, role).with_weight(1 + (i % 4) as u32)
        })
        .collect()
}

fn make_members(count: usize) -> Vec<MemberRecord> {
    make_hosts(count)
        .into_iter()
        .map(|h| MemberRecord::new(h.endpoint, h.role).with_weight(h.weight))
        .collect()
}

/// Connection stub for the service benchmarks; every call succeeds
struct NullConnection;

#[async_trait]
impl PhysicalConnection for NullConnection {
    async fn execute(&mut self, _op: &Operation) -> Result<ExecuteOutcome, EngineError> {
        Ok(ExecuteOutcome::empty())
    }

    async fn ping(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn apply(&mut self, _setting: &SessionSetting) -> Result<(), EngineError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
}

struct NullFactory;

#[async_trait]
impl ConnectionFactory for NullFactory {
    async fn connect(&self, _host: &HostInfo) -> Result<Box<dyn PhysicalConnection>, EngineError> {
        Ok(Box::new(NullConnection))
    }
}

/// Topology source that always answers with the same membership
struct StaticSource {
    members: Vec<MemberRecord>,
}

#[async_trait]
impl TopologySource for StaticSource {
    async fn fetch_members(
        &self,
        _conn: &mut dyn PhysicalConnection,
    ) -> Result<Vec<MemberRecord>, EngineError> {
        Ok(self.members.clone())
    }
}

/// Snapshot construction and selection over growing membership lists
fn bench_snapshot_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot_selection");

    for host_count in [10, 100, 1000].iter() {
        let cluster = ClusterId::new("bench");
        let hosts = make_hosts(*host_count);
        let topology = Topology::new(cluster.clone(), 1, hosts.clone());
        let middle = Endpoint::new(format!("host-{}.cluster.local", host_count / 2), 5432);

        group.bench_with_input(
            BenchmarkId::new("build", host_count),
            host_count,
            |b, _| {
                // includes the single-writer scan over every row
                b.iter(|| {
                    let topo = Topology::new(cluster.clone(), 1, hosts.clone());
                    black_box(topo);
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("writer", host_count),
            host_count,
            |b, _| {
                b.iter(|| {
                    black_box(topology.writer());
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("readers", host_count),
            host_count,
            |b, _| {
                b.iter(|| {
                    let readers: Vec<&HostInfo> = topology.readers().collect();
                    black_box(readers);
                });
            },
        );

        group.bench_with_input(BenchmarkId::new("find", host_count), host_count, |b, _| {
            b.iter(|| {
                black_box(topology.find(&middle));
            });
        });
    }

    group.finish();
}

/// Read paths of a warmed topology cache, the per-call cost every
/// operation pays
fn bench_service_reads(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("service_reads");

    for host_count in [10, 100, 1000].iter() {
        let cluster = ClusterId::new("bench");
        let seeds = vec![Endpoint::new("host-0.cluster.local", 5432)];
        let service = TopologyService::new(
            Config::default().topology,
            Arc::new(NullFactory),
            Arc::new(StaticSource {
                members: make_members(*host_count),
            }),
        );

        // warm the cache once; the lease keeps the cluster registered
        // for the whole measurement
        let _lease = rt.block_on(async {
            let lease = service.lease(&cluster, &seeds).await;
            service
                .snapshot(&cluster)
                .await
                .expect("warm-up refresh failed");
            lease
        });

        group.bench_with_input(
            BenchmarkId::new("cached", host_count),
            host_count,
            |b, _| {
                b.to_async(&rt).iter(|| async {
                    black_box(service.cached(&cluster).await);
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("snapshot", host_count),
            host_count,
            |b, _| {
                b.to_async(&rt).iter(|| async {
                    let topo = service.snapshot(&cluster).await.expect("snapshot failed");
                    black_box(topo);
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("connect_candidates", host_count),
            host_count,
            |b, _| {
                b.to_async(&rt).iter(|| async {
                    let candidates = service.connect_candidates(&cluster).await;
                    black_box(candidates);
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_snapshot_selection, bench_service_reads);
criterion_main!(benches);

//! Benchmarks for the KV layer: ring placement, reconciliation, coordinator.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ringkv_common::{NodeId, Timestamp};
use ringkv_kv::coordinator::{latest, Coordinator, CoordinatorConfig};
use ringkv_kv::replica_client::InProcessReplicaClient;
use ringkv_kv::router::{Router, DEFAULT_VIRTUAL_NODES};
use ringkv_storage::{EngineOptions, FsyncPolicy, Record, StorageEngine};
use std::sync::Arc;

fn topology(n: usize) -> Vec<NodeId> {
    (0..n)
        .map(|i| NodeId::new(format!("http://10.0.0.{}:7000", i + 1)))
        .collect()
}

// ────────────────────────── Router benchmarks ──────────────────────────

fn bench_router_replicas_for(c: &mut Criterion) {
    let mut group = c.benchmark_group("router_replicas_for");
    for cluster_size in [3, 10, 50] {
        group.bench_with_input(
            BenchmarkId::from_parameter(cluster_size),
            &cluster_size,
            |b, &size| {
                let router = Router::new(topology(size), DEFAULT_VIRTUAL_NODES).unwrap();
                let mut i = 0u64;
                b.iter(|| {
                    let key = format!("key_{}", i);
                    black_box(router.replicas_for(key.as_bytes(), 3));
                    i += 1;
                });
            },
        );
    }
    group.finish();
}

fn bench_router_build(c: &mut Criterion) {
    c.bench_function("router_build_10x64", |b| {
        b.iter(|| black_box(Router::new(topology(10), DEFAULT_VIRTUAL_NODES).unwrap()));
    });
}

// ────────────────────────── Reconciliation ──────────────────────────

fn bench_latest(c: &mut Criterion) {
    let versions: Vec<Option<Record>> = (0..5u64)
        .map(|i| {
            Some(Record::put(
                b"key".to_vec(),
                format!("value_{}", i).into_bytes(),
                Timestamp::from_nanos(100 + (i * 7) % 5),
            ))
        })
        .chain(std::iter::once(None))
        .collect();
    c.bench_function("latest_of_6", |b| b.iter(|| black_box(latest(&versions))));
}

// ────────────────────────── Coordinator benchmarks ──────────────────────────

struct BenchCluster {
    coord: Coordinator<InProcessReplicaClient>,
    _dirs: Vec<tempfile::TempDir>,
}

/// Three engine-backed nodes in one process, coordinated from the first.
fn bench_cluster() -> BenchCluster {
    let nodes = topology(3);
    let options = EngineOptions {
        fsync: FsyncPolicy::None,
        ..EngineOptions::default()
    };

    let mut dirs = Vec::new();
    let mut engines = Vec::new();
    let mut client = InProcessReplicaClient::new();
    for node in &nodes {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = Arc::new(StorageEngine::open(dir.path(), options.clone()).unwrap());
        client.register(node.clone(), engine.clone());
        engines.push(engine);
        dirs.push(dir);
    }

    let router = Arc::new(Router::new(nodes.clone(), DEFAULT_VIRTUAL_NODES).unwrap());
    let config = CoordinatorConfig {
        read_repair: false,
        ..CoordinatorConfig::for_cluster(3)
    };
    let coord = Coordinator::new(
        nodes[0].clone(),
        router,
        engines[0].clone(),
        Arc::new(client),
        config,
    )
    .unwrap();

    BenchCluster { coord, _dirs: dirs }
}

fn bench_coordinator_put(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let cluster = bench_cluster();

    c.bench_function("coordinator_put", |b| {
        let mut i = 0u64;
        b.iter(|| {
            rt.block_on(async {
                let key = format!("key_{}", i);
                cluster
                    .coord
                    .put(key.as_bytes(), b"value".to_vec(), None)
                    .await
                    .unwrap();
            });
            i += 1;
        });
    });
}

fn bench_coordinator_get(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let cluster = bench_cluster();

    // Pre-populate 1000 keys
    rt.block_on(async {
        for i in 0..1000 {
            cluster
                .coord
                .put(format!("key_{:04}", i).as_bytes(), b"value".to_vec(), None)
                .await
                .unwrap();
        }
    });

    c.bench_function("coordinator_get", |b| {
        let mut i = 0u64;
        b.iter(|| {
            rt.block_on(async {
                let key = format!("key_{:04}", i % 1000);
                black_box(cluster.coord.get(key.as_bytes(), None).await.unwrap());
            });
            i += 1;
        });
    });
}

criterion_group!(
    benches,
    bench_router_replicas_for,
    bench_router_build,
    bench_latest,
    bench_coordinator_put,
    bench_coordinator_get,
);
criterion_main!(benches);

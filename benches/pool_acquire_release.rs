/// Benchmark: Container Pool Acquire/Release
///
/// Measures the reuse path of `ContainerPool::acquire`/`release` (C4)
/// against `FakeBackend`, isolating the pool's own bookkeeping overhead
/// from real Docker API latency.
use coderunner_core::net::{NetworkManager, SubnetAllocator};
use coderunner_core::pool::{AlwaysIdle, ContainerPool, ContainerPoolConfig};
use coderunner_core::runtime::fake::FakeBackend;
use coderunner_core::runtime::Language;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use std::time::Duration;

fn build_pool() -> Arc<ContainerPool> {
    let backend: Arc<dyn coderunner_core::runtime::ContainerBackend> = Arc::new(FakeBackend::new());
    let allocator = Arc::new(
        SubnetAllocator::new(&[coderunner_core::config::SubnetPool {
            name: "default".to_string(),
            base: "10.200.0.0".to_string(),
            cidr: 16,
        }])
        .unwrap(),
    );
    let network_manager = Arc::new(NetworkManager::new(
        backend.clone(),
        allocator,
        "coderunner".to_string(),
    ));
    let config = ContainerPoolConfig {
        session_ttl: Duration::from_secs(60),
        cleanup_interval: Duration::from_secs(3600),
        max_per_session: 4,
        acquire_wait: Duration::from_millis(500),
        docker_memory: 256 * 1024 * 1024,
        docker_memory_swap: 0,
        docker_nano_cpus: 1_000_000_000,
    };
    ContainerPool::new(backend, network_manager, Arc::new(AlwaysIdle), config)
}

fn bench_acquire_creates_then_reuses(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let pool = build_pool();
    let language = Language::from("python".to_string());

    c.bench_function("acquire_release_reuse_cycle", |b| {
        b.to_async(&rt).iter(|| {
            let pool = pool.clone();
            let language = language.clone();
            async move {
                let entry = pool
                    .acquire(black_box("bench-session"), &language, "python:3.12-slim")
                    .await
                    .unwrap();
                pool.release(&entry, true).await;
            }
        });
    });
}

fn bench_acquire_distinct_sessions(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let pool = build_pool();
    let language = Language::from("python".to_string());

    c.bench_function("acquire_release_distinct_sessions", |b| {
        let mut i = 0u64;
        b.to_async(&rt).iter(|| {
            let pool = pool.clone();
            let language = language.clone();
            let session_id = format!("bench-session-{i}");
            i += 1;
            async move {
                let entry = pool
                    .acquire(&session_id, &language, "python:3.12-slim")
                    .await
                    .unwrap();
                pool.release(&entry, true).await;
            }
        });
    });
}

criterion_group!(
    benches,
    bench_acquire_creates_then_reuses,
    bench_acquire_distinct_sessions
);
criterion_main!(benches);

#[cfg(feature = "metrics")]
mod prometheus_metrics {
    use lazy_static::lazy_static;
    use prometheus::{register_int_counter, register_int_gauge, IntCounter, IntGauge};

    lazy_static! {
        pub static ref CONTAINERS_CREATED: IntCounter = register_int_counter!(
            "coderunner_pool_containers_created_total",
            "Total containers created by the container pool"
        )
        .expect("register coderunner_pool_containers_created_total counter");
        pub static ref CONTAINERS_REUSED: IntCounter = register_int_counter!(
            "coderunner_pool_containers_reused_total",
            "Total containers reused from the pool instead of created"
        )
        .expect("register coderunner_pool_containers_reused_total counter");
        pub static ref CONTAINERS_DELETED: IntCounter = register_int_counter!(
            "coderunner_pool_containers_deleted_total",
            "Total containers removed by the reaper or on teardown"
        )
        .expect("register coderunner_pool_containers_deleted_total counter");
        pub static ref CLEANUP_ERRORS: IntCounter = register_int_counter!(
            "coderunner_pool_cleanup_errors_total",
            "Total container removal failures during reaping"
        )
        .expect("register coderunner_pool_cleanup_errors_total counter");
        pub static ref TOTAL_ACTIVE: IntGauge = register_int_gauge!(
            "coderunner_pool_total_active",
            "Containers currently marked in-use"
        )
        .expect("register coderunner_pool_total_active gauge");
    }

    #[inline]
    pub fn init() {
        lazy_static::initialize(&CONTAINERS_CREATED);
        lazy_static::initialize(&CONTAINERS_REUSED);
        lazy_static::initialize(&CONTAINERS_DELETED);
        lazy_static::initialize(&CLEANUP_ERRORS);
        lazy_static::initialize(&TOTAL_ACTIVE);
    }
}

#[cfg(feature = "metrics")]
pub use prometheus_metrics::init;

/// Point-in-time snapshot for the `/stats/pool` endpoint, independent of
/// whether the `metrics` feature (Prometheus export) is enabled.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolMetricsSnapshot {
    pub containers_created: u64,
    pub containers_reused: u64,
    pub containers_deleted: u64,
    pub cleanup_errors: u64,
    pub total_active: u64,
    pub queue_depth: u64,
    pub last_cleanup_duration_ms: u64,
}

#[derive(Debug, Default)]
pub struct PoolCounters {
    pub containers_created: std::sync::atomic::AtomicU64,
    pub containers_reused: std::sync::atomic::AtomicU64,
    pub containers_deleted: std::sync::atomic::AtomicU64,
    pub cleanup_errors: std::sync::atomic::AtomicU64,
    pub total_active: std::sync::atomic::AtomicU64,
    pub last_cleanup_duration_ms: std::sync::atomic::AtomicU64,
}

impl PoolCounters {
    pub fn record_created(&self) {
        self.containers_created
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        prometheus_metrics::CONTAINERS_CREATED.inc();
    }

    pub fn record_reused(&self) {
        self.containers_reused
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        prometheus_metrics::CONTAINERS_REUSED.inc();
    }

    pub fn record_deleted(&self, count: u64) {
        self.containers_deleted
            .fetch_add(count, std::sync::atomic::Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        prometheus_metrics::CONTAINERS_DELETED.inc_by(count);
    }

    pub fn record_cleanup_error(&self) {
        self.cleanup_errors
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        prometheus_metrics::CLEANUP_ERRORS.inc();
    }

    pub fn set_active(&self, value: u64) {
        self.total_active
            .store(value, std::sync::atomic::Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        prometheus_metrics::TOTAL_ACTIVE.set(value as i64);
    }

    pub fn record_cleanup_duration(&self, millis: u64) {
        self.last_cleanup_duration_ms
            .store(millis, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn snapshot(&self, queue_depth: u64) -> PoolMetricsSnapshot {
        use std::sync::atomic::Ordering::Relaxed;
        PoolMetricsSnapshot {
            containers_created: self.containers_created.load(Relaxed),
            containers_reused: self.containers_reused.load(Relaxed),
            containers_deleted: self.containers_deleted.load(Relaxed),
            cleanup_errors: self.cleanup_errors.load(Relaxed),
            total_active: self.total_active.load(Relaxed),
            queue_depth,
            last_cleanup_duration_ms: self.last_cleanup_duration_ms.load(Relaxed),
        }
    }
}

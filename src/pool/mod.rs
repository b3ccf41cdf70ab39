//! Per-session, per-language container cache with TTL, reuse, in-use
//! protection, and batch reaping (C4).

pub mod metrics;

use crate::net::NetworkManager;
use crate::pool::metrics::{PoolCounters, PoolMetricsSnapshot};
use crate::runtime::{ContainerBackend, ContainerSpec, Language};
use crate::utils::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Whether a session has an open stream, consulted by the reaper before it
/// schedules that session's network for destruction. The Session registry
/// is the real implementation; tests can use `AlwaysIdle`.
pub trait SessionActivity: Send + Sync {
    fn has_open_stream(&self, session_id: &str) -> bool;
}

pub struct AlwaysIdle;

impl SessionActivity for AlwaysIdle {
    fn has_open_stream(&self, _session_id: &str) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct ContainerEntry {
    pub session_id: String,
    pub language: String,
    pub container_id: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub in_use: bool,
}

pub struct ContainerPoolConfig {
    pub session_ttl: Duration,
    pub cleanup_interval: Duration,
    pub max_per_session: usize,
    pub acquire_wait: Duration,
    pub docker_memory: i64,
    pub docker_memory_swap: i64,
    pub docker_nano_cpus: i64,
}

type SessionLangKey = (String, String);

pub struct ContainerPool {
    backend: Arc<dyn ContainerBackend>,
    network_manager: Arc<NetworkManager>,
    activity: Arc<dyn SessionActivity>,
    config: ContainerPoolConfig,
    entries: DashMap<SessionLangKey, Arc<Mutex<Vec<ContainerEntry>>>>,
    counters: Arc<PoolCounters>,
    total_active: AtomicU64,
}

impl ContainerPool {
    pub fn new(
        backend: Arc<dyn ContainerBackend>,
        network_manager: Arc<NetworkManager>,
        activity: Arc<dyn SessionActivity>,
        config: ContainerPoolConfig,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            backend,
            network_manager,
            activity,
            config,
            entries: DashMap::new(),
            counters: Arc::new(PoolCounters::default()),
            total_active: AtomicU64::new(0),
        });
        pool.clone().spawn_reaper();
        pool
    }

    /// Ensure a Network exists, then reuse a free container or create one,
    /// else wait briefly for one to free before failing with `Capacity`.
    #[tracing::instrument(skip(self), fields(session_id = %session_id, language = %language.as_str()))]
    pub async fn acquire(
        &self,
        session_id: &str,
        language: &Language,
        image: &str,
    ) -> Result<ContainerEntry> {
        self.network_manager.ensure_network(session_id).await?;

        let key = (session_id.to_string(), language.as_str().to_string());
        let list_lock = self
            .entries
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone();

        let deadline = Instant::now() + self.config.acquire_wait;
        loop {
            {
                let mut list = list_lock.lock().await;
                let now = Utc::now();
                if let Some(pos) = list.iter().position(|e| !e.in_use && e.expires_at > now) {
                    list[pos].in_use = true;
                    list[pos].last_used_at = now;
                    self.counters.record_reused();
                    self.total_active.fetch_add(1, Ordering::Relaxed);
                    self.counters.set_active(self.total_active.load(Ordering::Relaxed));
                    return Ok(list[pos].clone());
                }

                if list.len() < self.config.max_per_session {
                    let network_name = self.network_manager.network_name(session_id);
                    let container_name =
                        format!("{network_name}-{}-{}", language.as_str(), Uuid::new_v4());
                    let spec = ContainerSpec {
                        name: container_name,
                        image: image.to_string(),
                        network_name,
                        memory_bytes: self.config.docker_memory,
                        memory_swap: self.config.docker_memory_swap,
                        nano_cpus: self.config.docker_nano_cpus,
                    };

                    let container_id = self.backend.create_container(spec).await?;
                    self.backend.start_container(&container_id).await?;

                    let now = Utc::now();
                    let entry = ContainerEntry {
                        session_id: session_id.to_string(),
                        language: language.as_str().to_string(),
                        container_id,
                        created_at: now,
                        last_used_at: now,
                        expires_at: now + self.config.session_ttl,
                        in_use: true,
                    };
                    list.push(entry.clone());
                    self.counters.record_created();
                    self.total_active.fetch_add(1, Ordering::Relaxed);
                    self.counters.set_active(self.total_active.load(Ordering::Relaxed));
                    return Ok(entry);
                }
            }

            if Instant::now() >= deadline {
                return Err(CoreError::Capacity);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Mark the entry free (`success`) or dead (on unexpected exit /
    /// runtime-fatal failure); dead entries are removed and never reused.
    #[tracing::instrument(skip(self, entry), fields(container_id = %entry.container_id))]
    pub async fn release(&self, entry: &ContainerEntry, success: bool) {
        let key = (entry.session_id.clone(), entry.language.clone());
        let Some(list_lock) = self.entries.get(&key).map(|l| l.clone()) else {
            return;
        };

        let removed_dead = {
            let mut list = list_lock.lock().await;
            if success {
                if let Some(found) = list
                    .iter_mut()
                    .find(|e| e.container_id == entry.container_id)
                {
                    found.in_use = false;
                    found.expires_at = Utc::now() + self.config.session_ttl;
                }
                self.total_active.fetch_sub(1, Ordering::Relaxed);
                false
            } else {
                let before = list.len();
                list.retain(|e| e.container_id != entry.container_id);
                let removed = before != list.len();
                if removed {
                    self.total_active.fetch_sub(1, Ordering::Relaxed);
                }
                removed
            }
        };

        self.counters.set_active(self.total_active.load(Ordering::Relaxed));

        if removed_dead {
            if self.backend.remove_container(&entry.container_id).await.is_err() {
                self.counters.record_cleanup_error();
            } else {
                self.counters.record_deleted(1);
            }
        }
    }

    pub fn metrics(&self, queue_depth: u64) -> PoolMetricsSnapshot {
        self.counters.snapshot(queue_depth)
    }

    /// Force-remove every container belonging to `session_id`, in use or
    /// not, and destroy its network. Used by `onDisconnect` (spec.md
    /// §4.5.3), which cannot wait out the normal TTL-based reap: a stopped
    /// request's container must be gone within the disconnect cleanup
    /// budget, not `session_ttl_ms` later.
    #[tracing::instrument(skip(self), fields(session_id = %session_id))]
    pub async fn evict_session(&self, session_id: &str) {
        let keys: Vec<SessionLangKey> = self
            .entries
            .iter()
            .map(|e| e.key().clone())
            .filter(|(s, _)| s == session_id)
            .collect();

        for key in keys {
            let Some((_, list_lock)) = self.entries.remove(&key) else {
                continue;
            };
            let entries = {
                let mut list = list_lock.lock().await;
                std::mem::take(&mut *list)
            };
            for entry in entries {
                if entry.in_use {
                    self.total_active.fetch_sub(1, Ordering::Relaxed);
                }
                match self.backend.remove_container(&entry.container_id).await {
                    Ok(()) => self.counters.record_deleted(1),
                    Err(e) => {
                        warn!(container_id = %entry.container_id, error = %e, "eviction removal failed");
                        self.counters.record_cleanup_error();
                    }
                }
            }
        }
        self.counters.set_active(self.total_active.load(Ordering::Relaxed));
        self.network_manager.destroy_network(session_id).await;
    }

    fn spawn_reaper(self: Arc<Self>) {
        let interval = self.config.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        });
    }

    /// Collect expired entries and remove them in a batch (best effort per
    /// container), then schedule a now-empty session's network for
    /// destruction if it has no open stream.
    async fn sweep(&self) {
        let start = Instant::now();
        let keys: Vec<SessionLangKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut total_removed = 0u64;

        for key in keys {
            let Some(list_lock) = self.entries.get(&key).map(|l| l.clone()) else {
                continue;
            };

            let expired = {
                let mut list = list_lock.lock().await;
                let now = Utc::now();
                let (expired, kept): (Vec<_>, Vec<_>) = list
                    .drain(..)
                    .partition(|e| !e.in_use && e.expires_at <= now);
                *list = kept;
                expired
            };

            let mut still_alive = Vec::new();
            for entry in expired {
                match self.backend.remove_container(&entry.container_id).await {
                    Ok(()) => total_removed += 1,
                    Err(e) => {
                        warn!(container_id = %entry.container_id, error = %e, "container removal failed, retrying next sweep");
                        self.counters.record_cleanup_error();
                        still_alive.push(entry);
                    }
                }
            }
            if !still_alive.is_empty() {
                let mut list = list_lock.lock().await;
                list.extend(still_alive);
            }

            let session_empty = {
                let list = list_lock.lock().await;
                list.is_empty()
            };
            if session_empty {
                self.entries.remove(&key);
                let session_id = key.0.clone();
                let other_entries_for_session = self
                    .entries
                    .iter()
                    .any(|kv| kv.key().0 == session_id);
                if !other_entries_for_session && !self.activity.has_open_stream(&session_id) {
                    self.network_manager.destroy_network(&session_id).await;
                }
            }
        }

        if total_removed > 0 {
            self.counters.record_deleted(total_removed);
            debug!(total_removed, "reaper swept expired containers");
        }
        self.counters
            .record_cleanup_duration(start.elapsed().as_millis() as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubnetPool;
    use crate::net::SubnetAllocator;
    use crate::runtime::fake::FakeBackend;

    fn pool(ttl: Duration, cleanup: Duration, max_per_session: usize) -> Arc<ContainerPool> {
        let allocator = Arc::new(
            SubnetAllocator::new(&[SubnetPool {
                name: "primary".to_string(),
                base: "10.200.0.0".to_string(),
                cidr: 22,
            }])
            .unwrap(),
        );
        let backend: Arc<dyn ContainerBackend> = Arc::new(FakeBackend::new());
        let network_manager = Arc::new(NetworkManager::new(
            backend.clone(),
            allocator,
            "coderunner".to_string(),
        ));
        ContainerPool::new(
            backend,
            network_manager,
            Arc::new(AlwaysIdle),
            ContainerPoolConfig {
                session_ttl: ttl,
                cleanup_interval: cleanup,
                max_per_session,
                acquire_wait: Duration::from_millis(100),
                docker_memory: 256 * 1024 * 1024,
                docker_memory_swap: 0,
                docker_nano_cpus: 1_000_000_000,
            },
        )
    }

    #[tokio::test]
    async fn acquire_creates_then_reuses_after_release() {
        let pool = pool(Duration::from_secs(60), Duration::from_secs(3600), 5);
        let lang = Language::from("python".to_string());
        let entry = pool.acquire("s1", &lang, "python:latest").await.unwrap();
        pool.release(&entry, true).await;

        let reused = pool.acquire("s1", &lang, "python:latest").await.unwrap();
        assert_eq!(entry.container_id, reused.container_id);
        assert_eq!(pool.metrics(0).containers_reused, 1);
        assert_eq!(pool.metrics(0).containers_created, 1);
    }

    #[tokio::test]
    async fn acquire_fails_with_capacity_at_max_per_session() {
        let pool = pool(Duration::from_secs(60), Duration::from_secs(3600), 1);
        let lang = Language::from("python".to_string());
        let first = pool.acquire("s1", &lang, "python:latest").await.unwrap();
        let second = pool.acquire("s1", &lang, "python:latest").await;
        assert!(matches!(second, Err(CoreError::Capacity)));
        pool.release(&first, true).await;
    }

    #[tokio::test]
    async fn failed_release_marks_container_dead_and_removes_it() {
        let pool = pool(Duration::from_secs(60), Duration::from_secs(3600), 5);
        let lang = Language::from("python".to_string());
        let entry = pool.acquire("s1", &lang, "python:latest").await.unwrap();
        pool.release(&entry, false).await;

        let recreated = pool.acquire("s1", &lang, "python:latest").await.unwrap();
        assert_ne!(entry.container_id, recreated.container_id);
        assert_eq!(pool.metrics(0).containers_deleted, 1);
    }

    #[tokio::test]
    async fn reaper_removes_expired_idle_entries() {
        let pool = pool(Duration::from_millis(20), Duration::from_millis(30), 5);
        let lang = Language::from("python".to_string());
        let entry = pool.acquire("s1", &lang, "python:latest").await.unwrap();
        pool.release(&entry, true).await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(pool.metrics(0).containers_deleted, 1);
    }

    #[tokio::test]
    async fn reused_container_counts_as_active_again() {
        let pool = pool(Duration::from_secs(60), Duration::from_secs(3600), 5);
        let lang = Language::from("python".to_string());
        let entry = pool.acquire("s1", &lang, "python:latest").await.unwrap();
        assert_eq!(pool.metrics(0).total_active, 1);
        pool.release(&entry, true).await;
        assert_eq!(pool.metrics(0).total_active, 0);

        pool.acquire("s1", &lang, "python:latest").await.unwrap();
        assert_eq!(pool.metrics(0).total_active, 1);
    }

    #[tokio::test]
    async fn evict_session_removes_in_use_and_idle_containers_immediately() {
        let pool = pool(Duration::from_secs(60), Duration::from_secs(3600), 5);
        let lang = Language::from("python".to_string());
        let idle = pool.acquire("s1", &lang, "python:latest").await.unwrap();
        pool.release(&idle, true).await;
        let in_use = pool.acquire("s1", &lang, "python:latest").await.unwrap();
        assert_ne!(idle.container_id, in_use.container_id);

        pool.evict_session("s1").await;

        assert_eq!(pool.metrics(0).total_active, 0);
        assert_eq!(pool.metrics(0).containers_deleted, 2);
        // A fresh acquire must create a new container, not find a stale entry.
        let after = pool.acquire("s1", &lang, "python:latest").await.unwrap();
        assert_ne!(after.container_id, idle.container_id);
        assert_ne!(after.container_id, in_use.container_id);
    }
}

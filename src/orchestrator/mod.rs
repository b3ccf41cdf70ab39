//! Execution Orchestrator (C5): admission queue, dispatch loop, and the
//! four externally visible operations (`submit`, `sendInput`, `stop`,
//! `onDisconnect`) plus the buffered `execute` request/response path.

pub mod queue;
pub mod task;

use crate::config::Config;
use crate::pool::ContainerPool;
use crate::protocol::{RequestId, ServerFrame, SessionId};
use crate::session::SessionRegistry;
use crate::utils::error::{CoreError, Result};
use dashmap::DashMap;
use queue::PriorityQueue;
use std::sync::Arc;
use std::time::{Duration, Instant};
use task::{run_execution, ActiveHandle, ExecutionRequest, ResultSink};
use tokio::sync::{Notify, Semaphore};
use tracing::{info, warn};

/// One admitted request paired with where its output goes. `enqueued_at`
/// is tracked independently of the queue's own bookkeeping so a task can be
/// put back (see `PriorityQueue::requeue`) without losing its original
/// wait-clock when the dispatch loop finds no free concurrency slot.
struct QueuedExecution {
    request: ExecutionRequest,
    sink: Arc<dyn ResultSink>,
    enqueued_at: Instant,
}

/// Ties the priority queue, the container pool, and the dispatch loop
/// together. Owns no pointers into Session/Network/Pool state beyond what
/// it needs to drive a single execution (spec.md §9 "cyclic references").
pub struct Orchestrator {
    config: Arc<Config>,
    queue: Arc<PriorityQueue<QueuedExecution>>,
    pool: Arc<ContainerPool>,
    backend: Arc<dyn crate::runtime::ContainerBackend>,
    sessions: Arc<SessionRegistry>,
    active_requests: Arc<DashMap<RequestId, Arc<ActiveHandle>>>,
    semaphore: Arc<Semaphore>,
    notify: Arc<Notify>,
}

/// Point-in-time snapshot for the `/stats/queue` endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStats {
    pub depth: usize,
    pub active_count: usize,
    pub max_concurrent_sessions: usize,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        pool: Arc<ContainerPool>,
        backend: Arc<dyn crate::runtime::ContainerBackend>,
        sessions: Arc<SessionRegistry>,
    ) -> Arc<Self> {
        let orchestrator = Arc::new(Self {
            queue: Arc::new(PriorityQueue::new(
                config.max_queue_size,
                Duration::from_millis(config.queue_timeout_ms),
            )),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_sessions)),
            notify: Arc::new(Notify::new()),
            active_requests: Arc::new(DashMap::new()),
            config,
            pool,
            backend,
            sessions,
        });
        orchestrator.clone().spawn_dispatch_loop();
        orchestrator
    }

    pub fn queue_stats(&self) -> QueueStats {
        QueueStats {
            depth: self.queue.len(),
            active_count: self.config.max_concurrent_sessions
                - self.semaphore.available_permits(),
            max_concurrent_sessions: self.config.max_concurrent_sessions,
        }
    }

    /// Admit a request onto the priority queue (spec.md §4.5.1). Fails
    /// synchronously with `QueueFull` if the queue is already at capacity;
    /// everything else (container acquisition, staging, execution) happens
    /// later, off this call, once the dispatch loop picks the task up.
    pub async fn submit(&self, request: ExecutionRequest, sink: Arc<dyn ResultSink>) -> Result<()> {
        self.sessions
            .track_request(&request.session_id.to_string(), request.request_id);
        let priority = request.priority;
        let enqueued_at = Instant::now();
        let result = self
            .queue
            .enqueue(
                priority,
                QueuedExecution {
                    request,
                    sink,
                    enqueued_at,
                },
            )
            .await;
        if result.is_err() {
            // Never admitted; nothing to stop on disconnect for it.
        } else {
            self.notify.notify_one();
        }
        result
    }

    /// Write bytes to a running request's stdin; silently dropped if no
    /// such run is active (spec.md §4.5.3).
    pub async fn send_input(&self, request_id: RequestId, bytes: Vec<u8>) {
        if let Some(handle) = self.active_requests.get(&request_id) {
            handle.send_input(bytes).await;
        }
    }

    /// Request SIGTERM-then-SIGKILL for a running request; a no-op if it is
    /// not currently active (it may still be queued, in which case it will
    /// simply run to completion once dispatched — spec.md has no "cancel
    /// while queued" operation, only `stop` of a running request).
    pub fn stop(&self, request_id: RequestId) {
        if let Some(handle) = self.active_requests.get(&request_id) {
            handle.request_stop();
        }
    }

    /// Mark all of a session's in-flight requests cancelled, `stop` each,
    /// and evict its containers and network without waiting for the normal
    /// TTL-based reap (spec.md §4.5.3, end-to-end scenario 6).
    #[tracing::instrument(skip(self), fields(session_id = %session_id))]
    pub async fn on_disconnect(&self, session_id: SessionId) {
        let session_id_str = session_id.to_string();
        let in_flight = self.sessions.disconnect(&session_id_str);
        for request_id in &in_flight {
            self.stop(*request_id);
        }
        // Give each stopped run a moment to actually release its container
        // before force-evicting; `stop` itself caps at 500ms for the
        // SIGTERM/SIGKILL escalation.
        if !in_flight.is_empty() {
            tokio::time::sleep(Duration::from_millis(600)).await;
        }
        self.pool.evict_session(&session_id_str).await;
        self.sessions.forget(&session_id_str);
        info!(requests_stopped = in_flight.len(), "session disconnected, containers and network evicted");
    }

    /// Graceful shutdown (spec.md §9): drain the admission queue, rejecting
    /// every still-queued request with a synthetic error, then stop every
    /// in-flight request and destroy every session's containers and
    /// network. Returns once all of it has settled.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        let drained = self.queue.drain_all().await;
        let drained_count = drained.len();
        for queued in drained {
            self.sessions.untrack_request(
                &queued.request.session_id.to_string(),
                &queued.request.request_id,
            );
            queued.sink.emit(ServerFrame::Error {
                session_id: queued.request.session_id,
                request_id: Some(queued.request.request_id),
                code: "SHUTTING_DOWN",
                message: "server is shutting down".to_string(),
            });
        }

        for handle in self.active_requests.iter() {
            handle.request_stop();
        }
        if !self.active_requests.is_empty() {
            tokio::time::sleep(Duration::from_millis(600)).await;
        }

        let session_ids = self.sessions.all_session_ids();
        for session_id in &session_ids {
            self.pool.evict_session(session_id).await;
            self.sessions.forget(session_id);
        }

        info!(
            drained_count,
            sessions_torn_down = session_ids.len(),
            "shutdown drained queue and destroyed all sessions"
        );
    }

    fn spawn_dispatch_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(50));
            loop {
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = ticker.tick() => {}
                }
                self.dispatch_pass().await;
            }
        });
    }

    /// One scheduling pass (spec.md §4.5.1): expire stale tasks, then pop
    /// and spawn dispatchable tasks without blocking on their completion.
    /// Never awaits container/runtime I/O itself — only queue-lock and
    /// channel operations, so concurrency never collapses to 1.
    async fn dispatch_pass(&self) {
        loop {
            let (expired, next) = self.queue.dispatch_pass().await;
            for queued in expired {
                self.sessions.untrack_request(
                    &queued.request.session_id.to_string(),
                    &queued.request.request_id,
                );
                queued.sink.emit(ServerFrame::Error {
                    session_id: queued.request.session_id,
                    request_id: Some(queued.request.request_id),
                    code: "QUEUE_TIMEOUT",
                    message: "request waited too long in the admission queue".to_string(),
                });
            }

            let Some(queued) = next else {
                return;
            };

            let permit = match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    // No free concurrency slot: put it back (preserving its
                    // original arrival time) and stop this pass. The next
                    // pass is woken either by the interval tick or by a
                    // task completing and releasing a permit.
                    self.queue
                        .requeue(queued.request.priority, queued.enqueued_at, queued)
                        .await;
                    return;
                }
            };

            let pool = self.pool.clone();
            let config = self.config.clone();
            let backend = self.backend.clone();
            let active_requests = self.active_requests.clone();
            let session_id = queued.request.session_id;
            let request_id = queued.request.request_id;
            let sessions = self.sessions.clone();
            let notify = self.notify.clone();

            tokio::spawn(async move {
                run_execution(
                    queued.request,
                    pool,
                    config,
                    backend,
                    queued.sink,
                    active_requests,
                )
                .await;
                sessions.untrack_request(&session_id.to_string(), &request_id);
                drop(permit);
                notify.notify_one();
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RuntimeSpec, SubnetPool};
    use crate::net::{NetworkManager, SubnetAllocator};
    use crate::pool::ContainerPoolConfig;
    use crate::protocol::{OutputStream, Priority, SourceFile};
    use crate::runtime::fake::{ExecScript, FakeBackend};
    use crate::runtime::{ContainerBackend, Language};
    use crate::session::SessionRegistry;
    use std::collections::HashMap;
    use task::BufferSink;

    fn test_config(max_concurrent: usize, max_queue: usize) -> Arc<Config> {
        let mut runtimes = HashMap::new();
        runtimes.insert(
            "python".to_string(),
            RuntimeSpec {
                image: "coderunner-runtime-python:latest".to_string(),
                entry_convention: "main.py".to_string(),
            },
        );
        Arc::new(Config {
            max_concurrent_sessions: max_concurrent,
            max_queue_size: max_queue,
            queue_timeout_ms: 60_000,
            execution_timeout_ms: 2_000,
            interactive_execution_timeout_ms: 2_000,
            runtimes,
            subnet_pools: vec![SubnetPool {
                name: "primary".to_string(),
                base: "10.210.0.0".to_string(),
                cidr: 20,
            }],
            ..Config::default()
        })
    }

    fn orchestrator_with(
        config: Arc<Config>,
        backend: Arc<FakeBackend>,
    ) -> Arc<Orchestrator> {
        let allocator = Arc::new(SubnetAllocator::new(&config.subnet_pools).unwrap());
        let backend_dyn: Arc<dyn ContainerBackend> = backend;
        let network_manager = Arc::new(NetworkManager::new(
            backend_dyn.clone(),
            allocator,
            config.session_network_prefix.clone(),
        ));
        let sessions = Arc::new(SessionRegistry::new());
        let pool = ContainerPool::new(
            backend_dyn.clone(),
            network_manager,
            sessions.clone(),
            ContainerPoolConfig {
                session_ttl: Duration::from_secs(60),
                cleanup_interval: Duration::from_secs(3600),
                max_per_session: 5,
                acquire_wait: Duration::from_millis(200),
                docker_memory: 256 * 1024 * 1024,
                docker_memory_swap: 0,
                docker_nano_cpus: 1_000_000_000,
            },
        );
        Orchestrator::new(config, pool, backend_dyn, sessions)
    }

    fn hello_request(priority: Priority) -> ExecutionRequest {
        ExecutionRequest {
            session_id: SessionId::new_v4(),
            request_id: RequestId::new_v4(),
            language: Language::from("python".to_string()),
            entry_path: "main.py".to_string(),
            files: vec![SourceFile {
                name: "main.py".to_string(),
                path: "main.py".to_string(),
                content: "print('hi')".to_string(),
                to_be_exec: true,
            }],
            priority,
            interactive: priority == Priority::Interactive,
        }
    }

    #[tokio::test]
    async fn hello_world_produces_stdout_and_exit_zero() {
        let backend = Arc::new(FakeBackend::new());
        backend.with_script(
            "python3",
            ExecScript {
                stdout: b"hi\n".to_vec(),
                stderr: Vec::new(),
                exit_code: 0,
                hang: false,
            },
        );
        let orchestrator = orchestrator_with(test_config(10, 50), backend);

        let sink = Arc::new(BufferSink::new());
        orchestrator
            .submit(hello_request(Priority::OneShot), sink.clone())
            .await
            .unwrap();

        let frames = wait_for_terminal(&sink).await;
        assert!(matches!(
            &frames[0],
            ServerFrame::Output { stream: OutputStream::Stdout, data, .. } if data == "hi\n"
        ));
        assert!(matches!(
            frames.last().unwrap(),
            ServerFrame::Exit { code: 0, reason: None, .. }
        ));
    }

    #[tokio::test]
    async fn queue_full_is_rejected_synchronously() {
        let backend = Arc::new(FakeBackend::new());
        backend.with_script(
            "python3",
            ExecScript {
                hang: true,
                ..Default::default()
            },
        );
        let orchestrator = orchestrator_with(test_config(1, 1), backend);

        let sink_a = Arc::new(BufferSink::new());
        orchestrator
            .submit(hello_request(Priority::OneShot), sink_a)
            .await
            .unwrap();
        // Give the dispatch loop a moment to pick up the first task so the
        // queue itself (not the concurrency cap) is what's at capacity.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let sink_b = Arc::new(BufferSink::new());
        orchestrator
            .submit(hello_request(Priority::OneShot), sink_b)
            .await
            .unwrap();

        let sink_c = Arc::new(BufferSink::new());
        let result = orchestrator.submit(hello_request(Priority::OneShot), sink_c).await;
        assert!(matches!(result, Err(CoreError::QueueFull)));
    }

    #[tokio::test]
    async fn stop_produces_synthetic_stopped_exit() {
        let backend = Arc::new(FakeBackend::new());
        backend.with_script(
            "python3",
            ExecScript {
                hang: true,
                ..Default::default()
            },
        );
        let orchestrator = orchestrator_with(test_config(5, 10), backend);

        let request = hello_request(Priority::Interactive);
        let request_id = request.request_id;
        let sink = Arc::new(BufferSink::new());
        orchestrator.submit(request, sink.clone()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        orchestrator.stop(request_id);

        let frames = wait_for_terminal(&sink).await;
        assert!(matches!(
            frames.last().unwrap(),
            ServerFrame::Exit { code: -1, reason: Some(r), .. } if r == "stopped"
        ));
    }

    /// Poll the buffer sink until a terminal frame (exit/error) has landed,
    /// then drain it. Exists because the dispatch loop and execution task
    /// run on spawned background tasks.
    async fn wait_for_terminal(sink: &Arc<BufferSink>) -> Vec<ServerFrame> {
        for _ in 0..200 {
            {
                let frames = sink.0.lock().expect("buffer sink mutex poisoned");
                if frames
                    .iter()
                    .any(|f| matches!(f, ServerFrame::Exit { .. } | ServerFrame::Error { .. }))
                {
                    return frames.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("terminal event never arrived");
    }
}

//! End-to-end scenarios against `FakeBackend` (no live Docker daemon), one
//! test per scenario. Mirrors the orchestrator's own in-crate unit tests but
//! exercised purely through the public API, the way the teacher's
//! `server::pool` integration tests drive a real listener from outside.

use coderunner_core::config::{Config, RuntimeSpec, SubnetPool};
use coderunner_core::net::{NetworkManager, SubnetAllocator};
use coderunner_core::orchestrator::task::{BufferSink, ExecutionRequest};
use coderunner_core::orchestrator::Orchestrator;
use coderunner_core::pool::{ContainerPool, ContainerPoolConfig};
use coderunner_core::protocol::{OutputStream, Priority, RequestId, ServerFrame, SessionId, SourceFile};
use coderunner_core::runtime::fake::{ExecScript, FakeBackend};
use coderunner_core::runtime::{ContainerBackend, Language};
use coderunner_core::session::SessionRegistry;
use coderunner_core::CoreError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

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
        execution_timeout_ms: 1_000,
        interactive_execution_timeout_ms: 2_000,
        max_per_session: 5,
        runtimes,
        subnet_pools: vec![SubnetPool {
            name: "primary".to_string(),
            base: "10.220.0.0".to_string(),
            cidr: 20,
        }],
        ..Config::default()
    })
}

fn orchestrator_with(config: Arc<Config>, backend: Arc<FakeBackend>) -> (Arc<Orchestrator>, Arc<ContainerPool>) {
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
            max_per_session: config.max_per_session,
            acquire_wait: Duration::from_millis(200),
            docker_memory: 256 * 1024 * 1024,
            docker_memory_swap: 0,
            docker_nano_cpus: 1_000_000_000,
        },
    );
    let orchestrator = Orchestrator::new(config, pool.clone(), backend_dyn, sessions);
    (orchestrator, pool)
}

fn request_for(session_id: SessionId, entry: &str, content: &str, priority: Priority) -> ExecutionRequest {
    ExecutionRequest {
        session_id,
        request_id: RequestId::new_v4(),
        language: Language::from("python".to_string()),
        entry_path: entry.to_string(),
        files: vec![SourceFile {
            name: entry.to_string(),
            path: entry.to_string(),
            content: content.to_string(),
            to_be_exec: true,
        }],
        priority,
        interactive: priority == Priority::Interactive,
    }
}

async fn wait_for_terminal(sink: &Arc<BufferSink>) -> Vec<ServerFrame> {
    for _ in 0..300 {
        {
            let frames = sink.frames();
            if frames
                .iter()
                .any(|f| matches!(f, ServerFrame::Exit { .. } | ServerFrame::Error { .. }))
            {
                return frames;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("terminal event never arrived");
}

// Scenario 1: Hello.
#[tokio::test]
async fn hello_world_prints_and_exits_zero() {
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
    let (orchestrator, _pool) = orchestrator_with(test_config(50, 200), backend);

    let sink = Arc::new(BufferSink::new());
    orchestrator
        .submit(
            request_for(SessionId::new_v4(), "main.py", "print('hi')", Priority::OneShot),
            sink.clone(),
        )
        .await
        .unwrap();

    let frames = wait_for_terminal(&sink).await;
    assert!(frames.iter().any(|f| matches!(
        f,
        ServerFrame::Output { stream: OutputStream::Stdout, data, .. } if data == "hi\n"
    )));
    assert!(matches!(
        frames.last().unwrap(),
        ServerFrame::Exit { code: 0, reason: None, .. }
    ));
}

// Scenario 2: Timeout.
#[tokio::test]
async fn runaway_process_is_killed_at_the_deadline() {
    let backend = Arc::new(FakeBackend::new());
    backend.with_script(
        "python3",
        ExecScript {
            hang: true,
            ..Default::default()
        },
    );
    let (orchestrator, _pool) = orchestrator_with(test_config(50, 200), backend);

    let sink = Arc::new(BufferSink::new());
    let started = std::time::Instant::now();
    orchestrator
        .submit(
            request_for(SessionId::new_v4(), "main.py", "while True: pass", Priority::OneShot),
            sink.clone(),
        )
        .await
        .unwrap();

    let frames = wait_for_terminal(&sink).await;
    assert!(started.elapsed() < Duration::from_millis(1_500));
    assert!(matches!(
        frames.last().unwrap(),
        ServerFrame::Exit { code: 124, reason: Some(r), .. } if r == "timeout"
    ));
}

// Scenario 3: Stop.
#[tokio::test]
async fn stop_ends_a_hung_process_and_releases_the_container() {
    let backend = Arc::new(FakeBackend::new());
    backend.with_script(
        "python3",
        ExecScript {
            hang: true,
            ..Default::default()
        },
    );
    let (orchestrator, _pool) = orchestrator_with(test_config(50, 200), backend);

    let request = request_for(SessionId::new_v4(), "main.py", "import time; time.sleep(60)", Priority::Interactive);
    let request_id = request.request_id;
    let sink = Arc::new(BufferSink::new());

    let started = std::time::Instant::now();
    orchestrator.submit(request, sink.clone()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    orchestrator.stop(request_id);

    let frames = wait_for_terminal(&sink).await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(matches!(
        frames.last().unwrap(),
        ServerFrame::Exit { code: -1, reason: Some(r), .. } if r == "stopped"
    ));
}

// Scenario 4: Reuse.
#[tokio::test]
async fn second_run_in_the_same_session_reuses_the_container() {
    let backend = Arc::new(FakeBackend::new());
    backend.with_script(
        "python3",
        ExecScript {
            stdout: b"ok\n".to_vec(),
            stderr: Vec::new(),
            exit_code: 0,
            hang: false,
        },
    );
    let (orchestrator, pool) = orchestrator_with(test_config(50, 200), backend.clone());

    let session_id = SessionId::new_v4();

    let sink_a = Arc::new(BufferSink::new());
    orchestrator
        .submit(request_for(session_id, "main.py", "print('a')", Priority::OneShot), sink_a.clone())
        .await
        .unwrap();
    wait_for_terminal(&sink_a).await;

    let sink_b = Arc::new(BufferSink::new());
    orchestrator
        .submit(request_for(session_id, "other.py", "print('b')", Priority::OneShot), sink_b.clone())
        .await
        .unwrap();
    wait_for_terminal(&sink_b).await;

    assert_eq!(backend.container_count(), 1, "only one container should ever have been created");
    assert_eq!(pool.metrics(0).containers_reused, 1);
}

// Scenario 5: Queue full.
#[tokio::test]
async fn queue_full_rejects_admission_synchronously() {
    let backend = Arc::new(FakeBackend::new());
    backend.with_script(
        "python3",
        ExecScript {
            hang: true,
            ..Default::default()
        },
    );
    let (orchestrator, _pool) = orchestrator_with(test_config(1, 1), backend);

    // One dispatched (fills the concurrency slot), one queued (fills the
    // queue), the third must be rejected synchronously.
    orchestrator
        .submit(request_for(SessionId::new_v4(), "main.py", "while True: pass", Priority::OneShot), Arc::new(BufferSink::new()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    orchestrator
        .submit(request_for(SessionId::new_v4(), "main.py", "while True: pass", Priority::OneShot), Arc::new(BufferSink::new()))
        .await
        .unwrap();

    let result = orchestrator
        .submit(request_for(SessionId::new_v4(), "main.py", "while True: pass", Priority::OneShot), Arc::new(BufferSink::new()))
        .await;
    assert!(matches!(result, Err(CoreError::QueueFull)));
}

// Scenario 6: Disconnect during run.
#[tokio::test]
async fn disconnect_tears_down_the_session_promptly() {
    let backend = Arc::new(FakeBackend::new());
    backend.with_script(
        "python3",
        ExecScript {
            hang: true,
            ..Default::default()
        },
    );
    let (orchestrator, pool) = orchestrator_with(test_config(50, 200), backend.clone());

    let session_id = SessionId::new_v4();
    let sink = Arc::new(BufferSink::new());
    orchestrator
        .submit(request_for(session_id, "main.py", "import time; time.sleep(30)", Priority::Interactive), sink)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.container_count(), 1);

    let started = std::time::Instant::now();
    orchestrator.on_disconnect(session_id).await;
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(backend.container_count(), 0, "container must be gone after disconnect teardown");
    assert_eq!(backend.network_count(), 0, "network must be gone after disconnect teardown");
    assert_eq!(pool.metrics(0).total_active, 0);
}

//! In-memory `ContainerBackend` used by the test suite so the orchestrator,
//! pool, and network manager can be exercised without a Docker daemon.

use super::backend::{ContainerBackend, ContainerSpec, ExecHandle, LabelledNetwork, NetworkSpec, OutputChunk};
use crate::protocol::SourceFile;
use crate::utils::error::{CoreError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone)]
struct FakeNetwork {
    spec: NetworkSpec,
}

#[derive(Debug, Clone)]
struct FakeContainer {
    spec: ContainerSpec,
    running: bool,
}

/// Script for a single `exec` call: output to emit, and the exit code to
/// report once the handle is asked for it. Tests register scripts ahead of
/// time keyed by the command's first argument (conventionally the
/// interpreter, e.g. `python3`).
#[derive(Debug, Clone)]
pub struct ExecScript {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i64,
    /// If set, the exec never resolves its exit code until cancelled —
    /// simulates a long-running / hung process for timeout and stop tests.
    pub hang: bool,
}

impl Default for ExecScript {
    fn default() -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: 0,
            hang: false,
        }
    }
}

pub struct FakeBackend {
    networks: DashMap<String, FakeNetwork>,
    containers: DashMap<String, FakeContainer>,
    next_id: AtomicI64,
    pub scripts: DashMap<String, ExecScript>,
    pub default_script: ExecScript,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            networks: DashMap::new(),
            containers: DashMap::new(),
            next_id: AtomicI64::new(1),
            scripts: DashMap::new(),
            default_script: ExecScript::default(),
        }
    }

    pub fn with_script(self: &Arc<Self>, key: &str, script: ExecScript) {
        self.scripts.insert(key.to_string(), script);
    }

    pub fn container_count(&self) -> usize {
        self.containers.len()
    }

    pub fn network_count(&self) -> usize {
        self.networks.len()
    }

    fn fresh_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerBackend for FakeBackend {
    async fn create_network(&self, spec: NetworkSpec) -> Result<String> {
        let id = self.fresh_id("net");
        self.networks
            .insert(spec.name.clone(), FakeNetwork { spec });
        Ok(id)
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.networks.remove(name);
        Ok(())
    }

    async fn list_labelled_networks(
        &self,
        label_key: &str,
        label_value: &str,
    ) -> Result<Vec<LabelledNetwork>> {
        Ok(self
            .networks
            .iter()
            .filter(|entry| {
                entry
                    .spec
                    .labels
                    .get(label_key)
                    .is_some_and(|v| v == label_value)
            })
            .map(|entry| LabelledNetwork {
                name: entry.key().clone(),
                subnet: Some(entry.spec.subnet),
            })
            .collect())
    }

    async fn create_container(&self, spec: ContainerSpec) -> Result<String> {
        if !self.networks.contains_key(&spec.network_name) {
            return Err(CoreError::RuntimeUnavailable(format!(
                "network '{}' does not exist",
                spec.network_name
            )));
        }
        let id = self.fresh_id("ctr");
        self.containers.insert(
            id.clone(),
            FakeContainer {
                spec,
                running: false,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        let mut entry = self
            .containers
            .get_mut(container_id)
            .ok_or_else(|| CoreError::RuntimeUnavailable("no such container".to_string()))?;
        entry.running = true;
        Ok(())
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        if let Some(mut entry) = self.containers.get_mut(container_id) {
            entry.running = false;
        }
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        self.containers.remove(container_id);
        Ok(())
    }

    async fn stage_files(
        &self,
        container_id: &str,
        _workdir: &str,
        _files: &[SourceFile],
    ) -> Result<()> {
        if !self.containers.contains_key(container_id) {
            return Err(CoreError::RuntimeUnavailable("no such container".to_string()));
        }
        Ok(())
    }

    async fn exec(
        &self,
        container_id: &str,
        command: Vec<String>,
        _workdir: &str,
    ) -> Result<ExecHandle> {
        if !self
            .containers
            .get(container_id)
            .is_some_and(|c| c.running)
        {
            return Err(CoreError::RuntimeUnavailable(
                "container is not running".to_string(),
            ));
        }

        let key = command.first().cloned().unwrap_or_default();
        let script = self
            .scripts
            .get(&key)
            .map(|s| s.value().clone())
            .unwrap_or_else(|| self.default_script.clone());

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(8);
        let (output_tx, output_rx) = mpsc::channel(64);
        let (exit_tx, exit_rx) = oneshot::channel();

        tokio::spawn(async move {
            // Drain stdin so senders never block; the fake backend does not
            // echo it anywhere.
            while stdin_rx.recv().await.is_some() {}
        });

        tokio::spawn(async move {
            if !script.stdout.is_empty() {
                let _ = output_tx.send(OutputChunk::Stdout(script.stdout)).await;
            }
            if !script.stderr.is_empty() {
                let _ = output_tx.send(OutputChunk::Stderr(script.stderr)).await;
            }
            drop(output_tx);
            if script.hang {
                // Simulates a stuck process: never resolve the exit code.
                // Hold `exit_tx` open indefinitely so the receiver stays
                // pending rather than observing a sender drop, which would
                // look like an immediate (wrong) exit to callers racing on
                // `handle.exit` in a `tokio::select!`.
                std::future::pending::<()>().await;
            }
            let _ = exit_tx.send(script.exit_code);
        });

        Ok(ExecHandle {
            stdin: stdin_tx,
            output: output_rx,
            exit: exit_rx,
            pid: Some(1),
        })
    }

    async fn signal_process(&self, _container_id: &str, _pid: i64, _force: bool) -> Result<()> {
        Ok(())
    }
}

//! Abstraction over the container runtime so the orchestrator and pool can
//! be exercised in tests without a live Docker daemon (spec.md §8), mirrored
//! on the teacher's pattern of swapping a real engine for a no-op one behind
//! a trait (`qos::QosEngine::None` / `QosEngine::Htb`).

use crate::protocol::SourceFile;
use crate::utils::error::{CoreError, Result};
use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};

/// One chunk of process output, tagged by stream.
#[derive(Debug, Clone)]
pub enum OutputChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// A running in-container exec: a channel to write stdin, a channel that
/// yields output chunks as they arrive, and a one-shot that resolves to the
/// process's exit code once it has finished.
pub struct ExecHandle {
    pub stdin: mpsc::Sender<Vec<u8>>,
    pub output: mpsc::Receiver<OutputChunk>,
    pub exit: oneshot::Receiver<i64>,
    /// Process id inside the container, used to deliver `stop`'s
    /// SIGTERM-then-SIGKILL without tearing down the whole container.
    pub pid: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NetworkSpec {
    pub name: String,
    pub subnet: Ipv4Net,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub network_name: String,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub memory_swap: i64,
}

#[derive(Debug, Clone)]
pub struct LabelledNetwork {
    pub name: String,
    pub subnet: Option<Ipv4Net>,
}

/// The container-runtime surface the Container Pool and Network Manager
/// depend on. `BollardBackend` talks to a real Docker Engine; `FakeBackend`
/// (in tests) simulates it in memory.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    async fn create_network(&self, spec: NetworkSpec) -> Result<String>;
    async fn remove_network(&self, name: &str) -> Result<()>;
    async fn list_labelled_networks(&self, label_key: &str, label_value: &str)
        -> Result<Vec<LabelledNetwork>>;

    /// Create a container whose main process is an idle sleep; actual code
    /// runs via `exec` against this container.
    async fn create_container(&self, spec: ContainerSpec) -> Result<String>;
    async fn start_container(&self, container_id: &str) -> Result<()>;
    async fn stop_container(&self, container_id: &str) -> Result<()>;
    async fn remove_container(&self, container_id: &str) -> Result<()>;

    /// Stage a project's files into the container at `workdir` (tar archive
    /// uploaded via `copy_to_container`, the same tar-then-upload shape as
    /// `testcontainers::core::copy`'s `CopyToContainer`).
    async fn stage_files(
        &self,
        container_id: &str,
        workdir: &str,
        files: &[SourceFile],
    ) -> Result<()>;

    /// Run `command` inside `container_id` at `workdir`, streaming output.
    async fn exec(
        &self,
        container_id: &str,
        command: Vec<String>,
        workdir: &str,
    ) -> Result<ExecHandle>;

    /// Deliver SIGTERM (or SIGKILL if `force`) to `pid` inside the
    /// container, used by `stop`.
    async fn signal_process(&self, container_id: &str, pid: i64, force: bool) -> Result<()>;
}

pub struct BollardBackend {
    docker: bollard::Docker,
}

impl BollardBackend {
    pub fn connect() -> Result<Self> {
        let docker = bollard::Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerBackend for BollardBackend {
    #[tracing::instrument(skip(self, spec), fields(network.name = %spec.name))]
    async fn create_network(&self, spec: NetworkSpec) -> Result<String> {
        let ipam = bollard::models::Ipam {
            config: Some(vec![bollard::models::IpamConfig {
                subnet: Some(spec.subnet.to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        };
        let response = self
            .docker
            .create_network(bollard::network::CreateNetworkOptions {
                name: spec.name.clone(),
                driver: "bridge".to_string(),
                labels: spec.labels.clone(),
                ipam,
                ..Default::default()
            })
            .await?;
        Ok(response.id)
    }

    #[tracing::instrument(skip(self))]
    async fn remove_network(&self, name: &str) -> Result<()> {
        self.docker.remove_network(name).await?;
        Ok(())
    }

    async fn list_labelled_networks(
        &self,
        label_key: &str,
        label_value: &str,
    ) -> Result<Vec<LabelledNetwork>> {
        let mut filters = HashMap::new();
        filters.insert("label", vec![format!("{label_key}={label_value}")]);
        let networks = self
            .docker
            .list_networks(Some(bollard::network::ListNetworksOptions { filters }))
            .await?;

        Ok(networks
            .into_iter()
            .filter_map(|network| {
                let name = network.name?;
                let subnet = network
                    .ipam
                    .and_then(|ipam| ipam.config)
                    .and_then(|configs| configs.into_iter().next())
                    .and_then(|c| c.subnet)
                    .and_then(|s| s.parse::<Ipv4Net>().ok());
                Some(LabelledNetwork { name, subnet })
            })
            .collect())
    }

    #[tracing::instrument(skip(self, spec), fields(container.name = %spec.name))]
    async fn create_container(&self, spec: ContainerSpec) -> Result<String> {
        let response = self
            .docker
            .create_container(
                Some(bollard::container::CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                bollard::container::Config {
                    image: Some(spec.image),
                    // Idle main process; real work runs through `exec`.
                    cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
                    host_config: Some(bollard::models::HostConfig {
                        memory: Some(spec.memory_bytes),
                        memory_swap: Some(spec.memory_swap),
                        nano_cpus: Some(spec.nano_cpus),
                        auto_remove: Some(false),
                        ..Default::default()
                    }),
                    networking_config: Some(bollard::container::NetworkingConfig {
                        endpoints_config: [(
                            spec.network_name,
                            bollard::models::EndpointSettings::default(),
                        )]
                        .into_iter()
                        .collect(),
                    }),
                    ..Default::default()
                },
            )
            .await?;
        Ok(response.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        self.docker
            .start_container::<String>(container_id, None)
            .await?;
        Ok(())
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        self.docker
            .stop_container(container_id, Some(bollard::container::StopContainerOptions { t: 0 }))
            .await?;
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        self.docker
            .remove_container(
                container_id,
                Some(bollard::container::RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    async fn stage_files(
        &self,
        container_id: &str,
        workdir: &str,
        files: &[SourceFile],
    ) -> Result<()> {
        let mut archive_bytes = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut archive_bytes);
            for file in files {
                let content = file.content.as_bytes();
                let mut header = tar::Header::new_gnu();
                header.set_size(content.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder.append_data(&mut header, &file.path, content)?;
            }
            builder.finish()?;
        }

        self.docker
            .upload_to_container(
                container_id,
                Some(bollard::container::UploadToContainerOptions {
                    path: workdir.to_string(),
                    ..Default::default()
                }),
                archive_bytes.into(),
            )
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, command))]
    async fn exec(
        &self,
        container_id: &str,
        command: Vec<String>,
        workdir: &str,
    ) -> Result<ExecHandle> {
        use bollard::exec::{CreateExecOptions, StartExecResults};
        use futures::StreamExt;

        let created = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(command),
                    working_dir: Some(workdir.to_string()),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let started = self.docker.start_exec(&created.id, None).await?;

        // `stop` needs the in-container pid to signal a single process
        // rather than the whole container; exec inspection exposes it once
        // the exec has actually started running.
        let pid = self
            .docker
            .inspect_exec(&created.id)
            .await
            .ok()
            .and_then(|inspect| inspect.pid)
            .map(|p| p as i64);

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(32);
        let (output_tx, output_rx) = mpsc::channel(1024);
        let (exit_tx, exit_rx) = oneshot::channel();

        let StartExecResults::Attached { mut input, mut output } = started else {
            return Err(CoreError::RuntimeUnavailable(
                "exec returned a detached session".to_string(),
            ));
        };

        tokio::spawn(async move {
            while let Some(bytes) = stdin_rx.recv().await {
                if tokio::io::AsyncWriteExt::write_all(&mut input, &bytes)
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let docker = self.docker.clone();
        let exec_id = created.id.clone();
        tokio::spawn(async move {
            use bollard::container::LogOutput;

            while let Some(chunk) = output.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(_) => break,
                };
                let forwarded = match chunk {
                    LogOutput::StdOut { message } | LogOutput::Console { message } => {
                        output_tx.send(OutputChunk::Stdout(message.to_vec())).await
                    }
                    LogOutput::StdErr { message } => {
                        output_tx.send(OutputChunk::Stderr(message.to_vec())).await
                    }
                    LogOutput::StdIn { .. } => Ok(()),
                };
                if forwarded.is_err() {
                    break;
                }
            }

            let code = docker
                .inspect_exec(&exec_id)
                .await
                .ok()
                .and_then(|inspect| inspect.exit_code)
                .unwrap_or(-1);
            let _ = exit_tx.send(code);
        });

        Ok(ExecHandle {
            stdin: stdin_tx,
            output: output_rx,
            exit: exit_rx,
            pid,
        })
    }

    async fn signal_process(&self, container_id: &str, pid: i64, force: bool) -> Result<()> {
        let signal = if force { "SIGKILL" } else { "SIGTERM" };
        self.exec(
            container_id,
            vec!["kill".to_string(), format!("-{signal}"), pid.to_string()],
            "/",
        )
        .await?;
        Ok(())
    }
}

//! Docker runtime backed by the `bollard` crate.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::time::Duration;

use agent_sandbox_core::{Error, Result};

use crate::demux::{encode_frame, StreamKind};
use crate::runtime::{
    ContainerId, ContainerRuntime, ContainerSpec, ExecId, ExecOutput, ExecSpec, ExecState,
    TerminalSize,
};

/// Docker-based container runtime.
///
/// Containers are created with:
/// - Network mode from config (`none` by default)
/// - All capabilities dropped and no privilege escalation
/// - Memory, CPU and PID limits
/// - Auto-remove disabled, so the registry owns teardown
pub struct DockerRuntime {
    docker: bollard::Docker,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon.
    pub fn new() -> Result<Self> {
        let docker = bollard::Docker::connect_with_local_defaults().map_err(|e| {
            Error::sandbox_unavailable(format!(
                "Failed to connect to Docker daemon: {}. Is Docker running?",
                e
            ))
        })?;
        Ok(Self { docker })
    }

    /// Create from an existing bollard Docker client.
    pub fn from_client(docker: bollard::Docker) -> Self {
        Self { docker }
    }
}

fn status_code(err: &bollard::errors::Error) -> Option<u16> {
    match err {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } => {
            Some(*status_code)
        }
        _ => None,
    }
}

/// bollard already splits the hijacked connection into `LogOutput` chunks;
/// re-frame them so every runtime hands the executor the same wire format.
fn reframe(output: bollard::container::LogOutput) -> Bytes {
    use bollard::container::LogOutput;

    match output {
        LogOutput::StdOut { message } | LogOutput::Console { message } => {
            encode_frame(StreamKind::Stdout, &message)
        }
        LogOutput::StdErr { message } => encode_frame(StreamKind::Stderr, &message),
        LogOutput::StdIn { message } => encode_frame(StreamKind::Stdin, &message),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId> {
        use bollard::container::{Config, CreateContainerOptions};
        use bollard::models::{HostConfig, ResourcesUlimits};

        let host_config = HostConfig {
            memory: Some(spec.memory_limit_bytes),
            cpu_quota: Some(spec.cpu_quota),
            cpu_period: Some(100_000), // standard 100ms period
            network_mode: Some(spec.network_mode.clone()),
            auto_remove: Some(false),
            // Drop all capabilities by default
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            // Prevent fork bombs and too many open files
            pids_limit: Some(spec.pids_limit),
            ulimits: Some(vec![ResourcesUlimits {
                name: Some("nofile".to_string()),
                soft: Some(1024),
                hard: Some(2048),
            }]),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(spec.image.clone()),
            working_dir: Some(spec.workdir.clone()),
            user: spec.user.clone(),
            cmd: Some(spec.command.clone()),
            attach_stdout: Some(false),
            attach_stderr: Some(false),
            tty: Some(false),
            host_config: Some(host_config),
            labels: Some(spec.labels.clone()),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| {
                Error::sandbox_unavailable(format!("Failed to create sandbox container: {}", e))
            })?;

        for warning in &response.warnings {
            tracing::warn!(container = %spec.name, warning = %warning, "Docker create warning");
        }

        Ok(ContainerId(response.id))
    }

    async fn start_container(&self, id: &ContainerId) -> Result<()> {
        self.docker
            .start_container::<String>(&id.0, None)
            .await
            .map_err(|e| {
                Error::sandbox_unavailable(format!("Failed to start sandbox container: {}", e))
            })
    }

    async fn create_exec(&self, id: &ContainerId, spec: &ExecSpec) -> Result<ExecId> {
        use bollard::exec::CreateExecOptions;

        let exec_options = CreateExecOptions {
            cmd: Some(spec.cmd.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(spec.tty),
            working_dir: Some(spec.workdir.clone()),
            user: spec.user.clone(),
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env.clone())
            },
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(&id.0, exec_options)
            .await
            .map_err(|e| Error::command_rejected(format!("Failed to create exec in sandbox: {}", e)))?;

        Ok(ExecId(exec.id))
    }

    async fn start_exec(&self, exec: &ExecId, tty: bool) -> Result<ExecOutput> {
        use bollard::exec::{StartExecOptions, StartExecResults};

        let options = StartExecOptions {
            detach: false,
            tty,
            output_capacity: None,
        };

        let started = self
            .docker
            .start_exec(&exec.0, Some(options))
            .await
            .map_err(|e| Error::transport(format!("Failed to start exec in sandbox: {}", e)))?;

        match started {
            StartExecResults::Attached { output, .. } => Ok(output
                .map(|chunk| {
                    chunk
                        .map(reframe)
                        .map_err(|e| Error::transport(format!("Exec stream failed: {}", e)))
                })
                .boxed()),
            StartExecResults::Detached => Err(Error::transport(
                "Exec started detached; no output stream to read",
            )),
        }
    }

    async fn inspect_exec(&self, exec: &ExecId) -> Result<ExecState> {
        let inspect = self
            .docker
            .inspect_exec(&exec.0)
            .await
            .map_err(|e| Error::transport(format!("Failed to inspect exec result: {}", e)))?;

        let running = inspect.running.unwrap_or(false);
        Ok(ExecState {
            running,
            exit_code: if running { None } else { inspect.exit_code },
        })
    }

    async fn resize_exec(&self, exec: &ExecId, size: TerminalSize) -> Result<()> {
        use bollard::exec::ResizeExecOptions;

        self.docker
            .resize_exec(
                &exec.0,
                ResizeExecOptions {
                    height: size.rows,
                    width: size.cols,
                },
            )
            .await
            .map_err(|e| Error::transport(format!("Failed to resize exec: {}", e)))
    }

    async fn stop_container(&self, id: &ContainerId, grace: Duration) -> Result<()> {
        use bollard::container::StopContainerOptions;

        match self
            .docker
            .stop_container(
                &id.0,
                Some(StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped, 404: already gone
            Err(e) if matches!(status_code(&e), Some(304) | Some(404)) => Ok(()),
            Err(e) => Err(Error::transport(format!(
                "Failed to stop sandbox container: {}",
                e
            ))),
        }
    }

    async fn remove_container(&self, id: &ContainerId, force: bool) -> Result<()> {
        use bollard::container::RemoveContainerOptions;

        match self
            .docker
            .remove_container(
                &id.0,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if status_code(&e) == Some(404) => Ok(()),
            Err(e) => Err(Error::transport(format!(
                "Failed to remove sandbox container: {}",
                e
            ))),
        }
    }

    async fn put_archive(&self, id: &ContainerId, path: &str, tar: Bytes) -> Result<()> {
        use bollard::container::UploadToContainerOptions;

        self.docker
            .upload_to_container(
                &id.0,
                Some(UploadToContainerOptions {
                    path: path.to_string(),
                    ..Default::default()
                }),
                tar,
            )
            .await
            .map_err(|e| Error::transport(format!("Failed to upload archive to {}: {}", path, e)))
    }

    async fn get_archive(&self, id: &ContainerId, path: &str) -> Result<Bytes> {
        use bollard::container::DownloadFromContainerOptions;

        let mut stream = Box::pin(self.docker.download_from_container(
            &id.0,
            Some(DownloadFromContainerOptions {
                path: path.to_string(),
            }),
        ));

        let mut archive = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                Error::transport(format!("Failed to download archive from {}: {}", path, e))
            })?;
            archive.extend_from_slice(&chunk);
        }
        Ok(archive.freeze())
    }

    async fn ping(&self) -> bool {
        self.docker.ping().await.is_ok()
    }
}

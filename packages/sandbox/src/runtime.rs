// ABOUTME: Container runtime trait and Docker implementation via bollard
// ABOUTME: Create, inspect, start/stop/kill, remove, discover, and exec in room containers

use crate::error::{Result, SandboxError};
use crate::types::{ContainerState, ExecOutput};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, ListContainersOptions, LogOutput, RemoveContainerOptions,
        StartContainerOptions, StopContainerOptions,
    },
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecResults},
    image::CreateImageOptions,
    models::HostConfig,
    Docker,
};
use futures::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Labels applied to every container this subsystem owns
const MANAGED_LABEL: &str = "scribble.managed";
const ROOM_LABEL: &str = "scribble.room";

/// Everything needed to create a room container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub memory_mb: u64,
    pub cpu_nano_cores: i64,
    pub cmd: Vec<String>,
    pub room_id: String,
}

/// Abstract container runtime. One implementation talks to Docker; tests
/// substitute an in-memory runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check that the runtime daemon is reachable
    async fn ping(&self) -> Result<()>;

    /// Create a container with the given name; returns the container ID.
    /// The container is not started.
    async fn create(&self, name: &str, spec: &ContainerSpec) -> Result<String>;

    /// Start a created or stopped container
    async fn start(&self, container_id: &str) -> Result<()>;

    /// Gracefully stop a running container, waiting up to `wait_secs`
    async fn stop(&self, container_id: &str, wait_secs: u64) -> Result<()>;

    /// Forcefully kill a running container
    async fn kill(&self, container_id: &str) -> Result<()>;

    /// Remove a container and its anonymous volumes
    async fn remove(&self, container_id: &str, force: bool) -> Result<()>;

    /// Observe a container's lifecycle state
    async fn inspect(&self, container_id: &str) -> Result<ContainerState>;

    /// Find a leftover container by name; returns its ID and state
    async fn find_by_name(&self, name: &str) -> Result<Option<(String, ContainerState)>>;

    /// Execute a command inside a running container and collect its output
    async fn exec(&self, container_id: &str, cmd: Vec<String>) -> Result<ExecOutput>;
}

/// Docker-backed runtime
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the Docker daemon using the platform defaults
    pub fn connect() -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| SandboxError::Configuration(format!("cannot reach Docker: {}", e)))?;
        Ok(Self { client })
    }

    /// Use a specific Docker connection
    pub fn with_client(client: Docker) -> Self {
        Self { client }
    }

    fn to_bollard_config(&self, spec: &ContainerSpec) -> Config<String> {
        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(ROOM_LABEL.to_string(), spec.room_id.clone());

        // Resource isolation is fixed policy: memory ceiling, bounded CPU
        // share, and no network interface on any recovery path.
        let host_config = HostConfig {
            memory: Some((spec.memory_mb * 1024 * 1024) as i64),
            nano_cpus: Some(spec.cpu_nano_cores),
            network_mode: Some("none".to_string()),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    /// Pull the base image if it is not present locally
    async fn ensure_image(&self, image: &str) -> Result<()> {
        match self.client.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(e.into()),
        }

        info!("Pulling image {}", image);
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            let info = progress.map_err(|e| {
                SandboxError::Creation(format!("failed to pull image {}: {}", image, e))
            })?;
            if let Some(error) = info.error {
                return Err(SandboxError::Creation(format!(
                    "failed to pull image {}: {}",
                    image, error
                )));
            }
        }

        Ok(())
    }

    fn state_from_inspect(state: Option<&bollard::models::ContainerState>) -> ContainerState {
        match state {
            Some(s) if s.running.unwrap_or(false) => ContainerState::Running,
            Some(_) => ContainerState::Stopped,
            None => ContainerState::Stopped,
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map_err(|e| SandboxError::Configuration(format!("Docker not reachable: {}", e)))?;
        Ok(())
    }

    async fn create(&self, name: &str, spec: &ContainerSpec) -> Result<String> {
        info!("Creating container {} for room {}", name, spec.room_id);

        self.ensure_image(&spec.image).await?;

        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(options), self.to_bollard_config(spec))
            .await
            .map_err(|e| SandboxError::Creation(e.to_string()))?;

        debug!("Created container {}", response.id);
        Ok(response.id)
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        info!("Starting container {}", container_id);

        self.client
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stop(&self, container_id: &str, wait_secs: u64) -> Result<()> {
        info!("Stopping container {} (wait: {}s)", container_id, wait_secs);

        let options = StopContainerOptions {
            t: wait_secs as i64,
        };

        match self.client.stop_container(container_id, Some(options)).await {
            Ok(_) => Ok(()),
            // Already stopped is not an error
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!("Container {} already stopped", container_id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn kill(&self, container_id: &str) -> Result<()> {
        warn!("Killing container {}", container_id);

        match self
            .client
            .kill_container::<String>(container_id, None)
            .await
        {
            Ok(_) => Ok(()),
            // Not running anymore: the graceful path won the race
            Err(BollardError::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, container_id: &str, force: bool) -> Result<()> {
        debug!("Removing container {} (force: {})", container_id, force);

        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };

        match self
            .client
            .remove_container(container_id, Some(options))
            .await
        {
            Ok(_) => Ok(()),
            // Already removed is not an error
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerState> {
        match self.client.inspect_container(container_id, None).await {
            Ok(info) => Ok(Self::state_from_inspect(info.state.as_ref())),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(ContainerState::Absent),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<(String, ContainerState)>> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![format!("^/{}$", name)]);
        filters.insert("label".to_string(), vec![format!("{}=true", MANAGED_LABEL)]);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self.client.list_containers(Some(options)).await?;

        let Some(container) = containers.into_iter().next() else {
            return Ok(None);
        };
        let Some(id) = container.id else {
            return Ok(None);
        };

        let state = match container.state.as_deref() {
            Some("running") => ContainerState::Running,
            _ => ContainerState::Stopped,
        };

        Ok(Some((id, state)))
    }

    async fn exec(&self, container_id: &str, cmd: Vec<String>) -> Result<ExecOutput> {
        debug!("Executing in container {}: {:?}", container_id, cmd.first());

        let exec_config = CreateExecOptions {
            cmd: Some(cmd),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self.client.create_exec(container_id, exec_config).await?;
        let start_result = self.client.start_exec(&exec.id, None).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        match start_result {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(msg) = output.next().await {
                    match msg {
                        Ok(LogOutput::StdOut { message }) => stdout.extend_from_slice(&message),
                        Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
                        Ok(LogOutput::Console { message }) => stdout.extend_from_slice(&message),
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(SandboxError::Execution(
                    "exec was detached unexpectedly".to_string(),
                ))
            }
        }

        let exec_inspect = self.client.inspect_exec(&exec.id).await?;
        let exit_code = exec_inspect.exit_code.unwrap_or(0);

        Ok(ExecOutput {
            exit_code,
            stdout,
            stderr,
        })
    }
}

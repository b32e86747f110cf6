/// Container Runtime Client
///
/// **Responsibility:**
/// Issue requests to the container runtime and translate its responses.
///
/// The sandbox phases only talk to `ContainerRuntime`; `DockerRuntime` is the
/// production implementation on top of bollard. Deadlines and cancellation are
/// applied by callers around each call: dropping an in-flight future aborts the
/// underlying request to the daemon.

use crate::error::RuntimeError;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{BuildImageOptions, RemoveImageOptions};
use bollard::models::{HostConfig, RestartPolicy, RestartPolicyNameEnum};
use bollard::{Docker, API_DEFAULT_VERSION};
use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt};
use runbox_common::types::ResourceLimits;
use std::time::Duration;
use tracing::{debug, warn};

/// Grace period for a non-forced stop before the runtime escalates to SIGKILL
const STOP_GRACE_SECS: i64 = 5;

/// Client-side HTTP timeout; must outlast the longest build we allow
const CLIENT_TIMEOUT_SECS: u64 = 900;

/// Combined stdout/stderr bytes in the order the runtime delivers them
pub type LogStream<'a> = BoxStream<'a, Result<Bytes, RuntimeError>>;

/// Everything the runtime reported while building an image
#[derive(Debug, Clone, Default)]
pub struct BuildOutput {
    pub log: String,
    /// First error reported by the build, if any
    pub error: Option<String>,
}

impl BuildOutput {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Container creation parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub limits: ResourceLimits,
    pub network_enabled: bool,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check that the runtime is reachable
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// Build an image from a compressed tar context, consuming the whole response
    async fn build_image(&self, context: Bytes, tag: &str) -> Result<BuildOutput, RuntimeError>;

    /// Create a container and return its id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Follow the container's combined output until it exits
    fn stream_logs<'a>(&'a self, id: &'a str) -> LogStream<'a>;

    /// Wait for the container to stop and return its exit code
    async fn wait_container(&self, id: &str) -> Result<i64, RuntimeError>;

    /// Stop a container; `force` kills it immediately
    async fn stop_container(&self, id: &str, force: bool) -> Result<(), RuntimeError>;

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError>;

    async fn remove_image(&self, tag: &str, force: bool) -> Result<(), RuntimeError>;
}

/// Map a bollard error onto the runtime taxonomy
fn classify(err: BollardError, what: &str) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError { status_code, message } => match status_code {
            404 => RuntimeError::NotFound(format!("{}: {}", what, message)),
            304 => RuntimeError::NotModified(what.to_string()),
            409 => RuntimeError::Conflict(format!("{}: {}", what, message)),
            _ => RuntimeError::Api(format!("{} ({}): {}", what, status_code, message)),
        },
        BollardError::IOError { err } => RuntimeError::Unavailable(format!("{}: {}", what, err)),
        BollardError::RequestTimeoutError => {
            RuntimeError::Unavailable(format!("{}: request timed out", what))
        }
        other => RuntimeError::Api(format!("{}: {}", what, other)),
    }
}

/// Container configuration for an untrusted workload
pub fn container_config(spec: &ContainerSpec) -> Config<String> {
    let memory = spec.limits.memory_bytes();
    let host_config = HostConfig {
        memory: Some(memory),
        // Equal to memory: no swap on top of the ceiling
        memory_swap: Some(memory),
        nano_cpus: Some(spec.limits.nano_cpus()),
        pids_limit: Some(spec.limits.pids_limit),
        network_mode: Some(if spec.network_enabled { "bridge" } else { "none" }.to_string()),
        restart_policy: Some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::NO),
            maximum_retry_count: None,
        }),
        cap_drop: Some(vec!["ALL".to_string()]),
        security_opt: Some(vec!["no-new-privileges".to_string()]),
        auto_remove: Some(false),
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        attach_stdin: Some(false),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        tty: Some(false),
        network_disabled: Some(!spec.network_enabled),
        host_config: Some(host_config),
        ..Default::default()
    }
}

/// Docker-backed runtime client
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the daemon at `endpoint`, or the local defaults when unset.
    ///
    /// `unix://` endpoints use the socket; `tcp://` and `http://` use HTTP.
    pub fn connect(endpoint: Option<&str>) -> Result<Self, RuntimeError> {
        let docker = match endpoint {
            Some(addr) if addr.starts_with("unix://") => {
                Docker::connect_with_unix(addr, CLIENT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            Some(addr) if addr.starts_with("tcp://") || addr.starts_with("http://") => {
                Docker::connect_with_http(addr, CLIENT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            Some(addr) => {
                return Err(RuntimeError::Unavailable(format!(
                    "unsupported runtime endpoint: {}",
                    addr
                )))
            }
            None => Docker::connect_with_local_defaults()
                .map(|d| d.with_timeout(Duration::from_secs(CLIENT_TIMEOUT_SECS))),
        }
        .map_err(|e| RuntimeError::Unavailable(format!("Failed to connect to Docker daemon: {}", e)))?;

        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| classify(e, "ping"))
    }

    async fn build_image(&self, context: Bytes, tag: &str) -> Result<BuildOutput, RuntimeError> {
        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: tag.to_string(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        let mut stream = Box::pin(self.docker.build_image(options, None, Some(context)));
        let mut output = BuildOutput::default();

        // Drain the whole response even after an error so the daemon can finish the build
        while let Some(item) = stream.next().await {
            match item {
                Ok(info) => {
                    if let Some(line) = info.stream {
                        output.log.push_str(&line);
                    }
                    if let Some(status) = info.status {
                        output.log.push_str(&status);
                        output.log.push('\n');
                    }
                    if let Some(error) = info.error {
                        output.log.push_str(&error);
                        output.log.push('\n');
                        output.error.get_or_insert(error);
                    }
                }
                Err(BollardError::DockerStreamError { error }) => {
                    output.log.push_str(&error);
                    output.log.push('\n');
                    output.error.get_or_insert(error);
                }
                Err(e) => return Err(classify(e, &format!("build {}", tag))),
            }
        }

        debug!(tag = tag, log_bytes = output.log.len(), "Build stream drained");
        Ok(output)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config(spec))
            .await
            .map_err(|e| classify(e, &format!("create container {}", spec.name)))?;

        for warning in &response.warnings {
            warn!(container = %spec.name, warning = %warning, "Runtime warning on create");
        }

        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| classify(e, &format!("start container {}", id)))
    }

    fn stream_logs<'a>(&'a self, id: &'a str) -> LogStream<'a> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        self.docker
            .logs(id, Some(options))
            .map(move |item| {
                item.map(|chunk| chunk.into_bytes())
                    .map_err(|e| classify(e, &format!("logs {}", id)))
            })
            .boxed()
    }

    async fn wait_container(&self, id: &str) -> Result<i64, RuntimeError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = Box::pin(self.docker.wait_container(id, Some(options)));
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(classify(e, &format!("wait container {}", id))),
            None => Err(RuntimeError::Api(format!(
                "wait container {}: no response from runtime",
                id
            ))),
        }
    }

    async fn stop_container(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        let what = format!("stop container {}", id);
        if force {
            self.docker
                .kill_container(id, Some(KillContainerOptions { signal: "SIGKILL" }))
                .await
                .map_err(|e| classify(e, &what))
        } else {
            self.docker
                .stop_container(id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
                .await
                .map_err(|e| classify(e, &what))
        }
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };

        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| classify(e, &format!("remove container {}", id)))
    }

    async fn remove_image(&self, tag: &str, force: bool) -> Result<(), RuntimeError> {
        let options = RemoveImageOptions {
            force,
            noprune: false,
        };

        self.docker
            .remove_image(tag, Some(options), None)
            .await
            .map(|deleted| {
                debug!(image = tag, layers = deleted.len(), "Image removed");
            })
            .map_err(|e| classify(e, &format!("remove image {}", tag)))
    }
}

/// Execution Launcher
///
/// Creates and starts a container from a built image. Returns as soon as the
/// container is running; watching it is the collector's job.

use crate::error::{RuntimeError, SandboxError};
use crate::runtime::{ContainerRuntime, ContainerSpec};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
    pub image_tag: String,
}

/// Run one runtime call under the launch timeout and the request's cancellation
async fn guarded<T, F>(
    what: &str,
    timeout: Duration,
    cancel: &CancellationToken,
    call: F,
) -> Result<T, SandboxError>
where
    F: Future<Output = Result<T, RuntimeError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SandboxError::Cancelled),
        res = tokio::time::timeout(timeout, call) => match res {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(SandboxError::Launch(format!("{}: {}", what, e))),
            Err(_) => Err(SandboxError::Launch(format!(
                "{}: no response within {} ms",
                what,
                timeout.as_millis()
            ))),
        },
    }
}

/// Create a container from `spec` and start it.
///
/// Each of the create and start calls gets its own `timeout`. `on_created`
/// runs as soon as the runtime has assigned an id, before the start call, so
/// the caller can schedule removal even if the start fails.
pub async fn launch<F>(
    runtime: &dyn ContainerRuntime,
    spec: ContainerSpec,
    timeout: Duration,
    cancel: &CancellationToken,
    on_created: F,
) -> Result<ContainerHandle, SandboxError>
where
    F: FnOnce(&ContainerHandle),
{
    let id = guarded(
        "create container",
        timeout,
        cancel,
        runtime.create_container(&spec),
    )
    .await?;
    let limits = spec.limits;
    let network_enabled = spec.network_enabled;
    let handle = ContainerHandle {
        id,
        name: spec.name,
        image_tag: spec.image,
    };
    on_created(&handle);

    guarded(
        "start container",
        timeout,
        cancel,
        runtime.start_container(&handle.id),
    )
    .await?;

    info!(
        container = %handle.name,
        container_id = %handle.id,
        image = %handle.image_tag,
        memory_mb = limits.memory_limit_mb,
        cpu_limit = limits.cpu_limit,
        network = network_enabled,
        "Container started"
    );
    Ok(handle)
}

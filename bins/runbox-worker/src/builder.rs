/// Image Builder
///
/// Submits an assembled build context to the runtime and turns the build
/// outcome into an `ImageHandle` or a typed failure. A successful build leaves
/// an image in the runtime store; removing it is the reaper's job.

use crate::error::SandboxError;
use crate::runtime::ContainerRuntime;
use bytes::Bytes;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHandle {
    pub tag: String,
    pub build_log: String,
}

/// Build `context` as `tag`, bounded by `timeout` and `cancel`
pub async fn build_image(
    runtime: &dyn ContainerRuntime,
    context: Bytes,
    tag: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ImageHandle, SandboxError> {
    let started = Instant::now();
    let context_bytes = context.len();

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(SandboxError::Cancelled),
        res = tokio::time::timeout(timeout, runtime.build_image(context, tag)) => res,
    };

    let output = match outcome {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(SandboxError::Build {
                message: e.to_string(),
                log: String::new(),
            })
        }
        Err(_) => {
            warn!(image = tag, timeout_ms = timeout.as_millis() as u64, "Image build timed out");
            return Err(SandboxError::BuildTimeout { timeout });
        }
    };

    let elapsed_ms = started.elapsed().as_millis() as u64;
    if output.succeeded() {
        info!(image = tag, context_bytes, elapsed_ms, "Image built");
        return Ok(ImageHandle {
            tag: tag.to_string(),
            build_log: output.log,
        });
    }

    let message = output.error.unwrap_or_default();
    warn!(image = tag, elapsed_ms, error = %message, "Image build failed");
    Err(SandboxError::Build {
        message,
        log: output.log,
    })
}

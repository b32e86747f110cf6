/// Lifecycle Reaper
///
/// Removes whatever runtime objects an execution may have created: the
/// container first, then the image. Every step is idempotent (an object that
/// is already gone counts as removed) and best-effort: a failing step is
/// recorded and the remaining steps still run.

use crate::error::{CleanupCall, RuntimeError, SandboxError};
use crate::runtime::ContainerRuntime;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Runtime objects an execution may own.
///
/// Names are claimed before the call that creates the object, so an object
/// created by a call that then timed out or was cancelled is still removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceLedger {
    image_tag: Option<String>,
    container_name: Option<String>,
    container_id: Option<String>,
}

impl ResourceLedger {
    pub fn claim_image(&mut self, tag: impl Into<String>) {
        self.image_tag = Some(tag.into());
    }

    pub fn claim_container(&mut self, name: impl Into<String>) {
        self.container_name = Some(name.into());
    }

    pub fn bind_container_id(&mut self, id: impl Into<String>) {
        self.container_id = Some(id.into());
    }

    pub fn image_tag(&self) -> Option<&str> {
        self.image_tag.as_deref()
    }

    /// Id when the runtime returned one, otherwise the claimed name
    pub fn container_ref(&self) -> Option<&str> {
        self.container_id
            .as_deref()
            .or(self.container_name.as_deref())
    }

    pub fn is_empty(&self) -> bool {
        self.image_tag.is_none() && self.container_ref().is_none()
    }
}

/// Run one cleanup call; errors that leave the target gone are success, anything else is recorded
async fn step<F>(
    kind: CleanupCall,
    what: String,
    timeout: Duration,
    call: F,
    failures: &mut Vec<SandboxError>,
) where
    F: Future<Output = Result<(), RuntimeError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(())) => debug!(step = %what, "Cleanup step done"),
        Ok(Err(e)) if e.is_benign_for(kind) => {
            debug!(step = %what, reason = %e, "Cleanup step had nothing to do")
        }
        Ok(Err(e)) => {
            warn!(step = %what, error = %e, "Cleanup step failed");
            failures.push(SandboxError::Reap(format!("{}: {}", what, e)));
        }
        Err(_) => {
            warn!(step = %what, timeout_ms = timeout.as_millis() as u64, "Cleanup step timed out");
            failures.push(SandboxError::Reap(format!(
                "{}: no response within {} ms",
                what,
                timeout.as_millis()
            )));
        }
    }
}

/// Remove the ledger's container and image.
///
/// `kill` forces an immediate SIGKILL before removal; use it whenever the
/// container may still be running (timeout, cancellation).
pub async fn reap(
    runtime: &dyn ContainerRuntime,
    ledger: &ResourceLedger,
    kill: bool,
    call_timeout: Duration,
) -> Vec<SandboxError> {
    let mut failures = Vec::new();

    if ledger.is_empty() {
        debug!("Nothing to reap");
        return failures;
    }

    if let Some(container) = ledger.container_ref() {
        if kill {
            step(
                CleanupCall::KillContainer,
                format!("kill container {}", container),
                call_timeout,
                runtime.stop_container(container, true),
                &mut failures,
            )
            .await;
        }
        step(
            CleanupCall::RemoveContainer,
            format!("remove container {}", container),
            call_timeout,
            runtime.remove_container(container, true),
            &mut failures,
        )
        .await;
    }

    if let Some(tag) = ledger.image_tag() {
        step(
            CleanupCall::RemoveImage,
            format!("remove image {}", tag),
            call_timeout,
            runtime.remove_image(tag, true),
            &mut failures,
        )
        .await;
    }

    info!(
        container = ledger.container_ref().unwrap_or("-"),
        image = ledger.image_tag().unwrap_or("-"),
        killed = kill,
        failures = failures.len(),
        "Execution resources reaped"
    );
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockBehavior, MockRuntime};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn full_ledger() -> ResourceLedger {
        let mut ledger = ResourceLedger::default();
        ledger.claim_image("runbox-r1:latest");
        ledger.claim_container("runbox-r1");
        ledger.bind_container_id("cid-1");
        ledger
    }

    #[tokio::test]
    async fn test_removes_container_then_image() {
        let runtime = MockRuntime::healthy();
        runtime.insert_running("cid-1", "runbox-r1", "runbox-r1:latest");

        let failures = reap(&runtime, &full_ledger(), true, TIMEOUT).await;

        assert!(failures.is_empty());
        assert!(runtime.live_containers().is_empty());
        assert!(runtime.live_images().is_empty());
        let calls = runtime.calls();
        assert_eq!(
            calls,
            vec![
                "stop:cid-1:kill".to_string(),
                "remove_container:cid-1".to_string(),
                "remove_image:runbox-r1:latest".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_idempotent_when_already_gone() {
        let runtime = MockRuntime::healthy();

        let failures = reap(&runtime, &full_ledger(), true, TIMEOUT).await;
        assert!(failures.is_empty());

        // Second pass over the same ledger is just as quiet
        let failures = reap(&runtime, &full_ledger(), true, TIMEOUT).await;
        assert!(failures.is_empty());
    }

    #[tokio::test]
    async fn test_empty_ledger_is_noop() {
        let runtime = MockRuntime::healthy();
        let failures = reap(&runtime, &ResourceLedger::default(), true, TIMEOUT).await;
        assert!(failures.is_empty());
        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_falls_back_to_container_name() {
        let runtime = MockRuntime::healthy();
        runtime.insert_running("cid-9", "runbox-r1", "runbox-r1:latest");

        let mut ledger = ResourceLedger::default();
        ledger.claim_image("runbox-r1:latest");
        ledger.claim_container("runbox-r1");

        let failures = reap(&runtime, &ledger, true, TIMEOUT).await;
        assert!(failures.is_empty());
        assert!(runtime.live_containers().is_empty());
    }

    #[tokio::test]
    async fn test_failure_does_not_skip_image_removal() {
        let runtime = MockRuntime::new(MockBehavior {
            remove_container_error: Some(RuntimeError::Api("device or resource busy".to_string())),
            ..Default::default()
        });
        runtime.insert_running("cid-1", "runbox-r1", "runbox-r1:latest");

        let failures = reap(&runtime, &full_ledger(), false, TIMEOUT).await;

        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0], SandboxError::Reap(_)));
        assert_eq!(runtime.count_calls("remove_image:"), 1);
        assert!(runtime.live_images().is_empty());
    }

    #[tokio::test]
    async fn test_graceful_path_skips_kill() {
        let runtime = MockRuntime::healthy();
        runtime.insert_running("cid-1", "runbox-r1", "runbox-r1:latest");

        reap(&runtime, &full_ledger(), false, TIMEOUT).await;
        assert_eq!(runtime.count_calls("stop:"), 0);
    }

    #[tokio::test]
    async fn test_image_still_in_use_is_recorded() {
        let runtime = MockRuntime::new(MockBehavior {
            remove_container_error: Some(RuntimeError::Unavailable("socket closed".to_string())),
            remove_image_error: Some(RuntimeError::Conflict(
                "image is being used by running container cid-1".to_string(),
            )),
            ..Default::default()
        });
        runtime.insert_running("cid-1", "runbox-r1", "runbox-r1:latest");

        let failures = reap(&runtime, &full_ledger(), true, TIMEOUT).await;

        assert_eq!(failures.len(), 2);
        assert!(failures[0].to_string().contains("remove container cid-1"));
        assert!(failures[1].to_string().contains("remove image runbox-r1:latest"));
        assert!(failures[1].to_string().contains("being used"));
        assert!(runtime.live_images().contains("runbox-r1:latest"));
    }

    #[tokio::test]
    async fn test_kill_conflict_on_exited_container_is_quiet() {
        let runtime = MockRuntime::healthy();
        runtime.insert_running("cid-1", "runbox-r1", "runbox-r1:latest");
        runtime.stop_container("cid-1", true).await.unwrap();

        let failures = reap(&runtime, &full_ledger(), true, TIMEOUT).await;

        assert!(failures.is_empty());
        assert!(runtime.live_containers().is_empty());
    }
}

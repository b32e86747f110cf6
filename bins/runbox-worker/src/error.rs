//! Failure taxonomy for the sandbox pipeline.

use runbox_common::types::FailureKind;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by a container runtime client.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("{0} not found")]
    NotFound(String),

    /// The object was already in the requested state (e.g. stopping a stopped container).
    #[error("{0} not modified")]
    NotModified(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    #[error("runtime API error: {0}")]
    Api(String),
}

/// Runtime calls issued while reaping an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupCall {
    KillContainer,
    RemoveContainer,
    RemoveImage,
}

impl RuntimeError {
    /// Whether `call` failing with this error still leaves the target gone or idle.
    ///
    /// A conflict on kill means the container is not running, and on container
    /// removal that a removal is already in progress. A conflict on image
    /// removal means a container still uses the image, so only absence counts.
    pub fn is_benign_for(&self, call: CleanupCall) -> bool {
        match call {
            CleanupCall::KillContainer | CleanupCall::RemoveContainer => matches!(
                self,
                RuntimeError::NotFound(_) | RuntimeError::NotModified(_) | RuntimeError::Conflict(_)
            ),
            CleanupCall::RemoveImage => matches!(self, RuntimeError::NotFound(_)),
        }
    }
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("assembly failed: {0}")]
    Assembly(String),

    #[error("image build failed: {message}\n{log}")]
    Build { message: String, log: String },

    #[error("image build exceeded {} ms", timeout.as_millis())]
    BuildTimeout { timeout: Duration },

    #[error("launch failed: {0}")]
    Launch(String),

    #[error("output collection failed: {0}")]
    Collection(String),

    #[error("cleanup failed: {0}")]
    Reap(String),

    #[error("execution exceeded {} ms", timeout.as_millis())]
    ExecutionTimeout { timeout: Duration },

    #[error("execution cancelled")]
    Cancelled,
}

impl SandboxError {
    /// Classification stored in the result for errors that abort the forward phases.
    ///
    /// Collection, cleanup and run timeouts are not aborting failures and map to `None`.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            SandboxError::Assembly(_) => Some(FailureKind::Assembly),
            SandboxError::Build { .. } => Some(FailureKind::Build),
            SandboxError::BuildTimeout { .. } => Some(FailureKind::BuildTimeout),
            SandboxError::Launch(_) => Some(FailureKind::Launch),
            SandboxError::Cancelled => Some(FailureKind::Cancelled),
            SandboxError::Collection(_)
            | SandboxError::Reap(_)
            | SandboxError::ExecutionTimeout { .. } => None,
        }
    }
}

impl From<std::io::Error> for SandboxError {
    fn from(err: std::io::Error) -> Self {
        SandboxError::Assembly(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_error_carries_log() {
        let err = SandboxError::Build {
            message: "exit status 1".to_string(),
            log: "./main.go:3:2: undefined: fmt.Printn".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("exit status 1"));
        assert!(text.contains("undefined: fmt.Printn"));
        assert_eq!(err.kind(), Some(FailureKind::Build));
    }

    #[test]
    fn test_non_fatal_errors_have_no_kind() {
        assert!(SandboxError::Collection("eof".into()).kind().is_none());
        assert!(SandboxError::Reap("busy".into()).kind().is_none());
        let timeout = SandboxError::ExecutionTimeout {
            timeout: Duration::from_millis(500),
        };
        assert!(timeout.kind().is_none());
        assert_eq!(timeout.to_string(), "execution exceeded 500 ms");
    }

    #[test]
    fn test_benign_cleanup_errors() {
        for call in [CleanupCall::KillContainer, CleanupCall::RemoveContainer] {
            assert!(RuntimeError::NotFound("container x".into()).is_benign_for(call));
            assert!(RuntimeError::NotModified("container x".into()).is_benign_for(call));
            assert!(RuntimeError::Conflict("container x".into()).is_benign_for(call));
            assert!(!RuntimeError::Api("boom".into()).is_benign_for(call));
            assert!(!RuntimeError::Unavailable("socket".into()).is_benign_for(call));
        }
    }

    #[test]
    fn test_image_in_use_is_not_benign() {
        let call = CleanupCall::RemoveImage;
        assert!(RuntimeError::NotFound("image x".into()).is_benign_for(call));
        assert!(!RuntimeError::Conflict("image is being used by running container".into()).is_benign_for(call));
        assert!(!RuntimeError::NotModified("image x".into()).is_benign_for(call));
    }
}

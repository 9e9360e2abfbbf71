use crate::accelerator::AcceleratorError;
use crate::build_platform::BuildError;
use crate::object_storage::ObjectStorageServiceError;
use crate::packager::PackagerError;
use thiserror::Error;

/// Caller-facing error taxonomy. Every failure of the remote-execution
/// pipeline surfaces as one of these kinds.
#[derive(Clone, Error, Debug)]
pub enum RemoteError {
    /// Missing project, unparseable accelerator, invalid options.
    #[error("Configuration error: {0}")]
    Config(String),

    /// No ambient cloud credentials or no reachable cluster context.
    #[error("Credential error: {0}")]
    Credential(String),

    /// Remote image build failed or timed out.
    #[error(transparent)]
    Build(#[from] BuildError),

    /// The cluster rejected the workload (permission, namespace, name collision).
    #[error("Cannot submit workload: {0}")]
    Submission(String),

    /// Pods stayed pending: insufficient accelerators or selector mismatch.
    #[error("Workload cannot be scheduled: {0}")]
    Scheduling(String),

    /// The workload ran and exited non-zero without producing a result envelope.
    #[error("Job failed: {0}")]
    Job(String),

    /// The runner completed and reported a captured user failure.
    #[error("Remote execution failed with {kind}: {message}")]
    RemoteExecution {
        kind: String,
        message: String,
        traceback: String,
    },

    #[error(transparent)]
    Packaging(#[from] PackagerError),

    #[error(transparent)]
    Storage(#[from] ObjectStorageServiceError),

    /// Local filesystem failure (scoped working directory, artifact files).
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<AcceleratorError> for RemoteError {
    fn from(error: AcceleratorError) -> Self {
        RemoteError::Config(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accelerator_error_is_a_config_error() {
        let error = crate::accelerator::parse_accelerator("warp-drive").unwrap_err();
        let remote_error: RemoteError = error.into();

        assert!(matches!(remote_error, RemoteError::Config(_)));
        assert!(remote_error.to_string().starts_with("Configuration error:"));
    }

    #[test]
    fn test_remote_execution_error_carries_original_failure() {
        let error = RemoteError::RemoteExecution {
            kind: "ValueError".to_string(),
            message: "x".to_string(),
            traceback: "ValueError: x".to_string(),
        };

        assert_eq!(error.to_string(), "Remote execution failed with ValueError: x");
    }
}

//! Error types for engine operations

use crate::demux::DemuxError;
use bollard::errors::Error as DockerError;
use stevedore_common::types::ExecResult;
use thiserror::Error;

/// Failure of a single request to the container engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The request never got an answer: socket missing, connection refused,
    /// broken transport
    #[error("container engine unavailable: {0}")]
    Unavailable(String),

    /// The engine answered and refused the request
    #[error("container engine rejected request{}: {message}", status_suffix(.status_code))]
    Rejected {
        status_code: Option<u16>,
        message: String,
    },
}

fn status_suffix(status_code: &Option<u16>) -> String {
    status_code.map(|c| format!(" ({})", c)).unwrap_or_default()
}

impl EngineError {
    pub fn rejected(status_code: u16, message: impl Into<String>) -> Self {
        EngineError::Rejected {
            status_code: Some(status_code),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::Rejected {
                status_code: Some(404),
                ..
            }
        )
    }
}

impl From<DockerError> for EngineError {
    fn from(err: DockerError) -> Self {
        match err {
            DockerError::DockerResponseServerError {
                status_code,
                message,
            } => EngineError::Rejected {
                status_code: Some(status_code),
                message,
            },
            DockerError::DockerStreamError { error } => EngineError::Rejected {
                status_code: None,
                message: error,
            },
            other => EngineError::Unavailable(other.to_string()),
        }
    }
}

/// Result type for inventory and client-facing queries
pub type CoreResult<T> = Result<T, CoreError>;

/// Failure kinds surfaced to callers of the engine core
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("container engine rejected request: {0}")]
    EngineRejected(String),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("failed to create exec instance in {container}: {reason}")]
    ExecCreateFailed { container: String, reason: String },

    #[error("failed to pull image {image}: {reason}")]
    ImagePullFailed { image: String, reason: String },

    #[error("failed to create container from {image}: {reason}")]
    ContainerCreateFailed { image: String, reason: String },

    #[error("failed to attach to container {container}: {reason}")]
    AttachFailed { container: String, reason: String },

    #[error("malformed stream frame: {0}")]
    MalformedFrame(DemuxError),

    #[error("output capture incomplete: {0}")]
    IncompleteCapture(String),
}

impl CoreError {
    /// Transport-level failures that may succeed if the caller tries again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::EngineUnavailable(_) | CoreError::IncompleteCapture(_)
        )
    }
}

impl From<EngineError> for CoreError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Unavailable(message) => CoreError::EngineUnavailable(message),
            rejected @ EngineError::Rejected { .. } => {
                CoreError::EngineRejected(rejected.to_string())
            }
        }
    }
}

impl From<DemuxError> for CoreError {
    fn from(err: DemuxError) -> Self {
        match err {
            DemuxError::Io(io) => CoreError::IncompleteCapture(io.to_string()),
            protocol => CoreError::MalformedFrame(protocol),
        }
    }
}

/// Failed exec or one-shot run. Carries whatever output arrived before the
/// failure (never marked completed) and any cleanup warning.
#[derive(Error, Debug)]
#[error("{error}")]
pub struct RunError {
    #[source]
    pub error: CoreError,
    pub partial: ExecResult,
}

impl RunError {
    pub fn new(error: CoreError, partial: ExecResult) -> Self {
        debug_assert!(!partial.completed);
        Self { error, partial }
    }

    /// Failure before any output was read
    pub fn before_output(error: impl Into<CoreError>) -> Self {
        Self::new(error.into(), ExecResult::partial(Vec::new()))
    }

    pub fn is_retryable(&self) -> bool {
        self.error.is_retryable()
    }
}

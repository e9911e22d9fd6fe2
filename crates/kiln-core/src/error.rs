//! Unified scheduling error type.
//!
//! Handlers return `Result<T, SchedulerError>`; the [`IntoResponse`]
//! implementation maps each kind to its status code with a terse plain-text
//! body.  The one exception is the runner proxy path, which writes an
//! OpenAI-shaped JSON error instead (see `runner`).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Maximum accepted inference request body.
pub const MAX_REQUEST_BODY_BYTES: usize = 10 * 1024 * 1024;

/// All errors that can occur in the scheduling core.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The client asked for a backend the core does not know.
    #[error("backend not found: {0}")]
    BackendNotFound(String),

    /// A request arrived before the scheduler's run loop began.
    #[error("installer has not been started")]
    InstallerNotStarted,

    /// Installation was interrupted because the core is stopping.
    #[error("installer is shutting down")]
    InstallerShuttingDown,

    /// The backend's install step failed permanently.
    #[error("backend installation failed: {0}")]
    InstallFailed(String),

    /// The model is absent from the local store.
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// The model's memory requirement exceeds the host budget.
    #[error("model too big for this host: {0}")]
    ModelTooBig(String),

    /// The loader run loop has exited; shutdown is in progress.
    #[error("loads are disabled")]
    LoadsDisabled,

    /// A reconfigure arrived while the runner is serving requests.
    #[error("runner is in use: {0}")]
    RunnerAlreadyActive(String),

    /// The readiness poll exhausted its attempts.
    #[error("backend failed to become ready")]
    BackendNotReady,

    /// The child exited before readiness without reporting an error.
    #[error("backend quit unexpectedly")]
    BackendQuitUnexpectedly,

    /// The child exited before readiness and reported an error.
    #[error("backend failed: {0}")]
    BackendFailed(String),

    /// The request body exceeds [`MAX_REQUEST_BODY_BYTES`].
    #[error("request body exceeds {MAX_REQUEST_BODY_BYTES} bytes")]
    RequestTooLarge,

    /// The request body could not be interpreted.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Cooperative cancellation.
    #[error("operation cancelled")]
    Cancelled,

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for SchedulerError {
    fn into_response(self) -> Response {
        let status = match &self {
            SchedulerError::BackendNotFound(_) | SchedulerError::ModelNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            SchedulerError::RequestTooLarge | SchedulerError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            SchedulerError::RunnerAlreadyActive(_) => StatusCode::CONFLICT,
            SchedulerError::InstallerNotStarted
            | SchedulerError::InstallerShuttingDown
            | SchedulerError::InstallFailed(_)
            | SchedulerError::LoadsDisabled
            | SchedulerError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            SchedulerError::ModelTooBig(_)
            | SchedulerError::BackendNotReady
            | SchedulerError::BackendQuitUnexpectedly
            | SchedulerError::BackendFailed(_)
            | SchedulerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

//! Collaborator contracts consumed by the scheduling core.
//!
//! The core never talks to an inference engine, a model store, or the host
//! memory subsystem directly; it goes through the traits below.  Concrete
//! adapters live in the server binary, fakes live in the test suite.

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use kiln_types::{BackendConfig, BackendMode, RequiredMemory};

// ── Backend ───────────────────────────────────────────────────────────────────

/// Errors produced by a [`Backend`] implementation.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The model's GGUF metadata could not be parsed.  The loader downgrades
    /// this to a warning and schedules the model with zero known memory.
    #[error("failed to parse GGUF metadata: {0}")]
    GgufParse(String),

    /// The operation was interrupted by cancellation.
    #[error("backend operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BackendError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, BackendError::Cancelled)
    }
}

/// One installable, runnable inference engine.
///
/// `install` is idempotent and always completes (success or permanent
/// failure) before the core ever invokes `run`.  `run` must serve an
/// OpenAI-compatible HTTP API on the given endpoint, block until the child
/// exits or `cancel` fires, and never attempt to restart itself.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Stable lowercase name, usable as a URL path segment.
    fn name(&self) -> &str;

    /// Provision the backend (download binaries, unpack runtimes, …).
    async fn install(
        &self,
        http: &reqwest::Client,
        cancel: &CancellationToken,
    ) -> Result<(), BackendError>;

    /// Serve `model_id` in `mode` on the private `endpoint` until the child
    /// exits or `cancel` fires.
    async fn run(
        &self,
        endpoint: &Path,
        model_id: &str,
        mode: BackendMode,
        config: Option<&BackendConfig>,
        cancel: CancellationToken,
    ) -> Result<(), BackendError>;

    /// Human-readable state, served verbatim by `GET /status`.
    fn status(&self) -> String;

    /// Bytes of disk consumed by the backend's installation.
    async fn disk_usage(&self) -> Result<u64, BackendError>;

    /// Memory needed to serve `model_id` with `config`.
    ///
    /// [`RequiredMemory::UNKNOWN`] on an axis means the estimate is
    /// unavailable and the loader admits at most one such runner.
    async fn required_memory(
        &self,
        model_id: &str,
        config: Option<&BackendConfig>,
    ) -> Result<RequiredMemory, BackendError>;

    /// True when the backend manages model artifacts itself, in which case
    /// the scheduler skips the local-store existence check.
    fn uses_external_model_management(&self) -> bool {
        false
    }
}

// ── Model manager ─────────────────────────────────────────────────────────────

/// A model known to the local store.
#[derive(Debug, Clone)]
pub struct Model {
    /// Resolved content identifier (digest).
    pub id: String,
    /// Size of the model artifact on disk, in bytes.
    pub size: u64,
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Local model storage, consumed read-only by the core.
#[async_trait]
pub trait ModelManager: Send + Sync {
    /// Resolve a user-facing tag to its content identifier.  Returns the
    /// input unchanged when resolution fails.
    fn resolve_model_id(&self, model_ref: &str) -> String;

    /// Look up a model by tag or id.
    async fn get_model(&self, model_ref: &str) -> Result<Model, ModelError>;

    /// Aggregate bytes of disk consumed by stored models.
    async fn disk_usage(&self) -> Result<u64, ModelError>;
}

// ── System memory ─────────────────────────────────────────────────────────────

/// Host memory probe.
pub trait SystemMemoryInfo: Send + Sync {
    /// Total RAM/VRAM of the host.  [`RequiredMemory::UNKNOWN`] on an axis
    /// means the probe could not measure it.
    fn total_memory(&self) -> RequiredMemory;

    /// Whether the host can hold `required` at all.
    fn have_sufficient_memory(&self, required: &RequiredMemory) -> anyhow::Result<bool>;
}

//! Shared types for the kiln scheduling core and its HTTP surface.
//!
//! Everything here is plain data: runner identities, memory budgets, the
//! persisted per-runner configuration, and the JSON envelopes exchanged on
//! the management routes.  The behavioural pieces live in `kiln-core`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

// ── Backend mode ──────────────────────────────────────────────────────────────

/// Capability under which a runner serves a model.
///
/// Part of the runner identity: a completion runner and an embedding runner
/// for the same model are distinct child processes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BackendMode {
    Completion,
    Embedding,
}

// ── Memory budgets ────────────────────────────────────────────────────────────

/// A RAM/VRAM pair, in bytes.
///
/// Used both for a model's requirement and for the host budget.  The value
/// [`RequiredMemory::UNKNOWN`] (1) on either axis means "unknown"; zero is a
/// real measurement and never a sentinel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredMemory {
    pub ram: u64,
    pub vram: u64,
}

impl RequiredMemory {
    /// Sentinel byte count meaning "unknown; admit at most one".
    pub const UNKNOWN: u64 = 1;

    pub const ZERO: RequiredMemory = RequiredMemory { ram: 0, vram: 0 };

    pub const fn new(ram: u64, vram: u64) -> Self {
        Self { ram, vram }
    }

    /// True if either axis carries the unknown sentinel.
    pub fn has_unknown(&self) -> bool {
        self.ram == Self::UNKNOWN || self.vram == Self::UNKNOWN
    }

    /// True if `self` is at least `other` on both axes.
    pub fn covers(&self, other: &RequiredMemory) -> bool {
        self.ram >= other.ram && self.vram >= other.vram
    }

    /// True if either axis of a requirement exceeds this budget.
    pub fn exceeded_by(&self, required: &RequiredMemory) -> bool {
        required.ram > self.ram || required.vram > self.vram
    }

    /// Resolve unknown axes against a total budget.
    ///
    /// An unknown requirement fills its axis completely, so an admitted
    /// runner with unknown memory excludes every other runner on that axis
    /// until it is evicted.
    pub fn resolved_against(&self, total: &RequiredMemory) -> RequiredMemory {
        RequiredMemory {
            ram: if self.ram == Self::UNKNOWN { total.ram } else { self.ram },
            vram: if self.vram == Self::UNKNOWN { total.vram } else { self.vram },
        }
    }

    pub fn plus(&self, other: &RequiredMemory) -> RequiredMemory {
        RequiredMemory {
            ram: self.ram.saturating_add(other.ram),
            vram: self.vram.saturating_add(other.vram),
        }
    }

    pub fn minus(&self, other: &RequiredMemory) -> RequiredMemory {
        RequiredMemory {
            ram: self.ram.saturating_sub(other.ram),
            vram: self.vram.saturating_sub(other.vram),
        }
    }
}

impl std::fmt::Display for RequiredMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ram={} vram={}", self.ram, self.vram)
    }
}

// ── Runner identity ───────────────────────────────────────────────────────────

/// The identity under which runners are deduplicated.
///
/// `model_id` is the resolved content identifier (digest) of a model, not
/// the tag the client supplied.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunnerKey {
    pub backend: String,
    pub model_id: String,
    pub mode: BackendMode,
}

impl RunnerKey {
    pub fn new(backend: impl Into<String>, model_id: impl Into<String>, mode: BackendMode) -> Self {
        Self {
            backend: backend.into(),
            model_id: model_id.into(),
            mode,
        }
    }
}

impl std::fmt::Display for RunnerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.backend, self.model_id, self.mode)
    }
}

// ── Runner configuration ──────────────────────────────────────────────────────

/// Persisted per-runner startup configuration, keyed by
/// (backend, model id, mode) and consulted when the runner's child process
/// is launched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Context window size, in tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_size: Option<u64>,
    /// Extra flags appended to the backend's launch command.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub runtime_flags: Vec<String>,
}

// ── HTTP envelopes ────────────────────────────────────────────────────────────

/// Thin view of an OpenAI inference request body: the scheduler only needs
/// the model name, the rest of the bytes are replayed to the runner verbatim.
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionEnvelope {
    #[serde(default)]
    pub model: String,
}

/// One live runner, as reported by `GET /ps`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerState {
    pub backend_name: String,
    /// The tag the client used, preserved for observability.
    pub model_name: String,
    pub mode: BackendMode,
    /// Wall-clock time the last reference was released.  `null` while
    /// requests are still holding the runner.
    pub last_used: Option<DateTime<Utc>>,
}

/// Disk usage report served by `GET /df`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DiskUsage {
    pub models_disk_usage: u64,
    pub default_backend_disk_usage: u64,
}

/// Request body for `POST /unload`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnloadRequest {
    /// Evict every runner and drop every stored configuration.
    #[serde(default)]
    pub all: bool,
    /// Restrict targeted unloads to one backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    /// Model tags to unload (resolved to ids before matching).
    #[serde(default)]
    pub models: Vec<String>,
}

/// Response body for `POST /unload`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UnloadResponse {
    pub unloaded_runners: usize,
}

/// Request body for `POST /models/configure`.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigureRequest {
    pub model: String,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub mode: Option<BackendMode>,
    #[serde(default)]
    pub context_size: Option<u64>,
    #[serde(default)]
    pub runtime_flags: Vec<String>,
}

/// The OpenAI-shaped error object written when a runner's child process
/// fails mid-request.
pub fn openai_error_body(message: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "error",
        "code": null,
        "message": message,
        "param": null,
        "sequence_number": 1,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

//! Exec-style backend adapter.
//!
//! Wraps an external OpenAI-serving command (e.g. a llama.cpp server build)
//! as a [`Backend`].  The launch command is a whitespace-separated template
//! with `{socket}`, `{model}`, `{mode}` and `{ctx}` placeholders; stored
//! runtime flags are appended after substitution.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kiln_core::backend::{Backend, BackendError};
use kiln_types::{BackendConfig, BackendMode, RequiredMemory};

/// Default context size handed to the child when none is configured.
const DEFAULT_CONTEXT_SIZE: u64 = 4096;

pub struct ExecBackend {
    name: String,
    models_dir: PathBuf,
    /// argv template; empty means the backend is unconfigured.
    command: Vec<String>,
}

impl ExecBackend {
    pub fn new(name: impl Into<String>, models_dir: impl Into<PathBuf>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            models_dir: models_dir.into(),
            command,
        }
    }

    /// Locate the configured program: an explicit path, or a `PATH` lookup.
    fn resolve_program(&self) -> anyhow::Result<PathBuf> {
        let Some(program) = self.command.first() else {
            anyhow::bail!("KILN_BACKEND_CMD is not configured");
        };
        let direct = Path::new(program);
        if direct.components().count() > 1 {
            if direct.is_file() {
                return Ok(direct.to_path_buf());
            }
            anyhow::bail!("backend command not found: {program}");
        }
        let path = std::env::var_os("PATH").unwrap_or_default();
        for dir in std::env::split_paths(&path) {
            let candidate = dir.join(program);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        anyhow::bail!("backend command not found on PATH: {program}")
    }

    fn model_path(&self, model_id: &str) -> PathBuf {
        self.models_dir.join(model_id)
    }

    fn render_args(
        &self,
        endpoint: &Path,
        model_id: &str,
        mode: BackendMode,
        config: Option<&BackendConfig>,
    ) -> Vec<String> {
        let context = config
            .and_then(|c| c.context_size)
            .unwrap_or(DEFAULT_CONTEXT_SIZE);
        let mut args: Vec<String> = self
            .command
            .iter()
            .skip(1)
            .map(|arg| {
                arg.replace("{socket}", &endpoint.to_string_lossy())
                    .replace("{model}", &self.model_path(model_id).to_string_lossy())
                    .replace("{mode}", &mode.to_string())
                    .replace("{ctx}", &context.to_string())
            })
            .collect();
        if let Some(config) = config {
            args.extend(config.runtime_flags.iter().cloned());
        }
        args
    }
}

#[async_trait]
impl Backend for ExecBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn install(
        &self,
        _http: &reqwest::Client,
        _cancel: &CancellationToken,
    ) -> Result<(), BackendError> {
        let program = self.resolve_program()?;
        info!(backend = %self.name, program = %program.display(), "backend command resolved");
        Ok(())
    }

    async fn run(
        &self,
        endpoint: &Path,
        model_id: &str,
        mode: BackendMode,
        config: Option<&BackendConfig>,
        cancel: CancellationToken,
    ) -> Result<(), BackendError> {
        let program = self.resolve_program()?;
        let args = self.render_args(endpoint, model_id, mode, config);
        info!(backend = %self.name, program = %program.display(), ?args, "spawning backend child");

        let mut child = tokio::process::Command::new(&program)
            .args(&args)
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| BackendError::Other(err.into()))?;

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|err| BackendError::Other(err.into()))?;
                if status.success() {
                    Ok(())
                } else {
                    Err(anyhow::anyhow!("backend child exited with {status}").into())
                }
            }
            _ = cancel.cancelled() => {
                if let Err(err) = child.start_kill() {
                    warn!(backend = %self.name, error = %err, "failed to kill backend child");
                }
                let _ = child.wait().await;
                Err(BackendError::Cancelled)
            }
        }
    }

    fn status(&self) -> String {
        match self.resolve_program() {
            Ok(program) => format!("installed ({})", program.display()),
            Err(err) => format!("not installed ({err})"),
        }
    }

    async fn disk_usage(&self) -> Result<u64, BackendError> {
        let program = self.resolve_program()?;
        let metadata = tokio::fs::metadata(&program)
            .await
            .map_err(|err| BackendError::Other(err.into()))?;
        Ok(metadata.len())
    }

    async fn required_memory(
        &self,
        model_id: &str,
        _config: Option<&BackendConfig>,
    ) -> Result<RequiredMemory, BackendError> {
        let path = self.model_path(model_id);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|err| BackendError::GgufParse(format!("{}: {err}", path.display())))?;
        // Weights plus a quarter for KV cache and scratch buffers; this
        // backend runs on the CPU, so no VRAM is reserved.
        let size = metadata.len();
        Ok(RequiredMemory::new(size + size / 4, 0))
    }

    fn uses_external_model_management(&self) -> bool {
        false
    }
}

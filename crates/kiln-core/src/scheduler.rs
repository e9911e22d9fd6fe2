//! HTTP entry point for the scheduling core.
//!
//! Routes OpenAI inference requests (with or without a `{backend}` path
//! segment) through install-gating, model resolution, and runner admission,
//! then reverse-proxies the captured body to the runner.  Also serves the
//! management surface: /status, /ps, /df, /unload, /models/configure,
//! /health.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::{Body, BodyDataStream, Bytes};
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use kiln_types::{
    BackendConfig, BackendMode, CompletionEnvelope, ConfigureRequest, DiskUsage, RunnerState,
    UnloadRequest, UnloadResponse,
};

use crate::backend::{Backend, ModelError, ModelManager, SystemMemoryInfo};
use crate::error::{SchedulerError, MAX_REQUEST_BODY_BYTES};
use crate::installer::Installer;
use crate::loader::{Loader, LoaderOptions, RunnerLease};

pub struct Scheduler {
    backends: Arc<HashMap<String, Arc<dyn Backend>>>,
    default_backend: String,
    models: Arc<dyn ModelManager>,
    installer: Installer,
    loader: Arc<Loader>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(
        backends: HashMap<String, Arc<dyn Backend>>,
        default_backend: impl Into<String>,
        models: Arc<dyn ModelManager>,
        memory: Arc<dyn SystemMemoryInfo>,
        options: LoaderOptions,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let backends = Arc::new(backends);
        let installer = Installer::new(Arc::clone(&backends), reqwest::Client::new());
        let loader = Arc::new(Loader::new(Arc::clone(&backends), memory, options));
        Arc::new(Scheduler {
            backends,
            default_backend: default_backend.into(),
            models,
            installer,
            loader,
            cancel,
        })
    }

    /// Drive the installer and the loader until the scheduler's token fires;
    /// the loader drains every runner before this returns.
    pub async fn run(&self) {
        info!(default_backend = %self.default_backend, "scheduler running");
        tokio::join!(
            self.installer.run(self.cancel.clone()),
            self.loader.run(self.cancel.clone()),
        );
        info!("scheduler stopped");
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/status", get(status))
            .route("/ps", get(ps))
            .route("/df", get(df))
            .route("/unload", post(unload))
            .route("/models/configure", post(configure))
            .route("/v1/chat/completions", post(inference_default))
            .route("/v1/completions", post(inference_default))
            .route("/v1/embeddings", post(inference_default))
            .route("/{backend}/v1/chat/completions", post(inference_scoped))
            .route("/{backend}/v1/completions", post(inference_scoped))
            .route("/{backend}/v1/embeddings", post(inference_scoped))
            .with_state(Arc::clone(self))
    }

    // ── Inference path ───────────────────────────────────────────────────────

    async fn handle_inference(
        self: &Arc<Self>,
        backend_name: Option<String>,
        req: Request,
    ) -> Result<Response, SchedulerError> {
        let name = backend_name.unwrap_or_else(|| self.default_backend.clone());
        let backend = self
            .backends
            .get(&name)
            .cloned()
            .ok_or_else(|| SchedulerError::BackendNotFound(name.clone()))?;

        let (parts, body) = req.into_parts();
        let bytes = read_body(body).await?;

        self.installer.wait(&self.cancel, backend.name()).await?;

        let mode = mode_for_path(parts.uri.path()).ok_or_else(|| {
            SchedulerError::Internal(format!(
                "cannot derive backend mode from path {}",
                parts.uri.path()
            ))
        })?;

        let envelope: CompletionEnvelope = serde_json::from_slice(&bytes)
            .map_err(|err| SchedulerError::InvalidRequest(format!("error parsing request: {err}")))?;
        if envelope.model.is_empty() {
            return Err(SchedulerError::InvalidRequest("model is required".into()));
        }

        if !backend.uses_external_model_management() {
            match self.models.get_model(&envelope.model).await {
                Ok(_) => {}
                Err(ModelError::NotFound(_)) => {
                    return Err(SchedulerError::ModelNotFound(envelope.model))
                }
                Err(err) => return Err(SchedulerError::Internal(err.to_string())),
            }
        }

        let model_id = self.models.resolve_model_id(&envelope.model);
        debug!(backend = %name, model = %envelope.model, %model_id, %mode, "admitting inference request");
        let lease = self
            .loader
            .acquire(&self.cancel, backend.name(), &model_id, &envelope.model, mode)
            .await?;

        // The captured bytes back both the envelope parse above and the
        // upstream request.
        let response = lease.proxy(parts, bytes).await;
        Ok(hold_lease_until_streamed(response, lease))
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn status(State(scheduler): State<Arc<Scheduler>>) -> Json<HashMap<String, String>> {
    let statuses = scheduler
        .backends
        .iter()
        .map(|(name, backend)| (name.clone(), backend.status()))
        .collect();
    Json(statuses)
}

async fn ps(State(scheduler): State<Arc<Scheduler>>) -> Json<Vec<RunnerState>> {
    Json(scheduler.loader.running().await)
}

async fn df(State(scheduler): State<Arc<Scheduler>>) -> Result<Json<DiskUsage>, SchedulerError> {
    let models_disk_usage = scheduler
        .models
        .disk_usage()
        .await
        .map_err(|err| SchedulerError::Internal(err.to_string()))?;
    let default_backend_disk_usage = match scheduler.backends.get(&scheduler.default_backend) {
        Some(backend) => backend
            .disk_usage()
            .await
            .map_err(|err| SchedulerError::Internal(err.to_string()))?,
        None => 0,
    };
    Ok(Json(DiskUsage {
        models_disk_usage,
        default_backend_disk_usage,
    }))
}

async fn unload(
    State(scheduler): State<Arc<Scheduler>>,
    Json(req): Json<UnloadRequest>,
) -> Result<Json<UnloadResponse>, SchedulerError> {
    let unloaded_runners = if req.all {
        scheduler.loader.unload_all().await
    } else {
        let mut count = 0;
        for model in &req.models {
            let model_id = scheduler.models.resolve_model_id(model);
            count += scheduler
                .loader
                .unload_model(req.backend.as_deref(), &model_id)
                .await;
        }
        count
    };
    info!(unloaded_runners, "unload request served");
    Ok(Json(UnloadResponse { unloaded_runners }))
}

async fn configure(
    State(scheduler): State<Arc<Scheduler>>,
    Json(req): Json<ConfigureRequest>,
) -> Result<StatusCode, SchedulerError> {
    let backend = req
        .backend
        .clone()
        .unwrap_or_else(|| scheduler.default_backend.clone());
    if !scheduler.backends.contains_key(&backend) {
        return Err(SchedulerError::BackendNotFound(backend));
    }
    let model_id = scheduler.models.resolve_model_id(&req.model);
    let mode = req.mode.unwrap_or(BackendMode::Completion);
    let config = BackendConfig {
        context_size: req.context_size,
        runtime_flags: req.runtime_flags,
    };
    scheduler
        .loader
        .set_runner_config(&backend, &model_id, mode, config)
        .await?;
    Ok(StatusCode::OK)
}

async fn inference_default(
    State(scheduler): State<Arc<Scheduler>>,
    req: Request,
) -> Result<Response, SchedulerError> {
    scheduler.handle_inference(None, req).await
}

async fn inference_scoped(
    State(scheduler): State<Arc<Scheduler>>,
    Path(backend): Path<String>,
    req: Request,
) -> Result<Response, SchedulerError> {
    scheduler.handle_inference(Some(backend), req).await
}

// ── Request plumbing ──────────────────────────────────────────────────────────

/// Derive the runner mode from the request path suffix.
fn mode_for_path(path: &str) -> Option<BackendMode> {
    if path.ends_with("/chat/completions") || path.ends_with("/completions") {
        Some(BackendMode::Completion)
    } else if path.ends_with("/embeddings") {
        Some(BackendMode::Embedding)
    } else {
        None
    }
}

/// Capture the request body, bounded at [`MAX_REQUEST_BODY_BYTES`].
async fn read_body(body: Body) -> Result<Bytes, SchedulerError> {
    match axum::body::to_bytes(body, MAX_REQUEST_BODY_BYTES).await {
        Ok(bytes) => Ok(bytes),
        Err(err) if is_length_limit(&err) => Err(SchedulerError::RequestTooLarge),
        Err(err) => Err(SchedulerError::Internal(format!(
            "error reading request body: {err}"
        ))),
    }
}

fn is_length_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(inner) = source {
        if inner.is::<http_body_util::LengthLimitError>() {
            return true;
        }
        source = inner.source();
    }
    false
}

/// Tie the lease's lifetime to the response body, so the reference is
/// released when the proxied stream finishes or the client hangs up.
fn hold_lease_until_streamed(response: Response, lease: RunnerLease) -> Response {
    let (parts, body) = response.into_parts();
    let stream = LeasedStream {
        inner: body.into_data_stream(),
        _lease: lease,
    };
    Response::from_parts(parts, Body::from_stream(stream))
}

struct LeasedStream {
    inner: BodyDataStream,
    _lease: RunnerLease,
}

impl Stream for LeasedStream {
    type Item = Result<Bytes, axum::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

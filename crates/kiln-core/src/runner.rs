//! One live runner: a child backend process bound to a single
//! (backend, model, mode), plus the plumbing that forwards OpenAI HTTP
//! requests to it over a private per-slot socket.
//!
//! The child is supervised by a background task that invokes
//! [`Backend::run`] and, when it returns, records the exit error and fires
//! the runner's `done` signal.  Everything else (readiness, proxying,
//! defunct detection) observes that signal.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::header::HOST;
use http::{HeaderName, HeaderValue, StatusCode, Uri};
use http_body_util::Full;
use hyper_util::rt::TokioIo;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use kiln_types::{openai_error_body, BackendConfig, RunnerKey};

use crate::backend::Backend;
use crate::error::SchedulerError;

/// Interval between readiness probes.
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Readiness probe budget: 600 × 500 ms ≈ 5 minutes.
pub const READY_POLL_ATTEMPTS: u32 = 600;

/// Placeholder authority the proxy dials; never resolved through DNS.
const PROXY_HOST: &str = "kiln-runner.local";

/// How long the proxy error path waits for `done` before concluding the
/// failure was transient rather than a dead child.
const DONE_GRACE: Duration = Duration::from_secs(1);

/// Deterministic, collision-free private endpoint for a slot.
pub(crate) fn socket_path(socket_dir: &Path, slot: usize) -> PathBuf {
    socket_dir.join(format!("inference-runner-{slot}.sock"))
}

/// Trim the request path so it begins at the first `/v1/` segment, keeping
/// the query string.  Paths without a `/v1/` segment pass through unchanged.
fn upstream_path(uri: &Uri) -> String {
    let path = uri.path();
    let trimmed = match path.find("/v1/") {
        Some(idx) => &path[idx..],
        None => path,
    };
    match uri.query() {
        Some(q) => format!("{trimmed}?{q}"),
        None => trimmed.to_owned(),
    }
}

pub struct Runner {
    key: RunnerKey,
    model_ref: String,
    slot: usize,
    socket: PathBuf,
    /// Cancels the child process; `terminate` fires it.
    cancel: CancellationToken,
    /// Fired by the supervisor when `Backend::run` returns.
    done: CancellationToken,
    exit_reason: Arc<OnceLock<String>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Runner {
    /// Launch the child process and return the handle before readiness is
    /// confirmed; call [`Runner::wait`] to block until the backend serves.
    pub(crate) fn start(
        socket_dir: &Path,
        backend: Arc<dyn Backend>,
        key: RunnerKey,
        model_ref: String,
        slot: usize,
        config: Option<BackendConfig>,
    ) -> Arc<Runner> {
        let socket = socket_path(socket_dir, slot);
        // A stale socket from a crashed predecessor would break the bind.
        let _ = std::fs::remove_file(&socket);

        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let exit_reason: Arc<OnceLock<String>> = Arc::new(OnceLock::new());

        let supervisor = tokio::spawn({
            let socket = socket.clone();
            let key = key.clone();
            let cancel = cancel.clone();
            let done = done.clone();
            let exit_reason = Arc::clone(&exit_reason);
            async move {
                debug!(runner = %key, slot, socket = %socket.display(), "starting backend child");
                let result = backend
                    .run(&socket, &key.model_id, key.mode, config.as_ref(), cancel)
                    .await;
                match result {
                    Ok(()) => debug!(runner = %key, "backend child exited"),
                    Err(err) if err.is_cancellation() => {
                        debug!(runner = %key, "backend child cancelled")
                    }
                    Err(err) => {
                        warn!(runner = %key, error = %err, "backend child failed");
                        let _ = exit_reason.set(err.to_string());
                    }
                }
                done.cancel();
            }
        });

        Arc::new(Runner {
            key,
            model_ref,
            slot,
            socket,
            cancel,
            done,
            exit_reason,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }

    pub fn key(&self) -> &RunnerKey {
        &self.key
    }

    pub fn model_ref(&self) -> &str {
        &self.model_ref
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Non-blocking peek at the `done` signal.
    pub fn is_defunct(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Block until the backend answers `GET /v1/models` with 200, the child
    /// quits, the probe budget runs out, or `cancel` fires.
    ///
    /// Cancellation does not terminate the runner; the caller who started it
    /// owns termination.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), SchedulerError> {
        for _ in 0..READY_POLL_ATTEMPTS {
            tokio::select! {
                _ = cancel.cancelled() => return Err(SchedulerError::Cancelled),
                _ = self.done.cancelled() => return Err(self.exit_error()),
                ready = self.ping() => {
                    if ready {
                        return Ok(());
                    }
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(SchedulerError::Cancelled),
                _ = self.done.cancelled() => return Err(self.exit_error()),
                _ = tokio::time::sleep(READY_POLL_INTERVAL) => {}
            }
        }
        Err(SchedulerError::BackendNotReady)
    }

    fn exit_error(&self) -> SchedulerError {
        match self.exit_reason.get() {
            Some(reason) => SchedulerError::BackendFailed(reason.clone()),
            None => SchedulerError::BackendQuitUnexpectedly,
        }
    }

    async fn ping(&self) -> bool {
        let mut req = hyper::Request::new(Full::new(Bytes::new()));
        *req.uri_mut() = Uri::from_static("/v1/models");
        req.headers_mut()
            .insert(HOST, HeaderValue::from_static(PROXY_HOST));
        match self.forward(req).await {
            Ok(response) => response.status() == StatusCode::OK,
            Err(_) => false,
        }
    }

    /// Dial the private socket and drive one HTTP/1 exchange over it.
    async fn forward(
        &self,
        req: hyper::Request<Full<Bytes>>,
    ) -> anyhow::Result<hyper::Response<hyper::body::Incoming>> {
        let stream = parity_tokio_ipc::Endpoint::connect(&self.socket).await?;
        let (mut sender, connection) =
            hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            // The connection future resolves once the exchange completes or
            // the upstream hangs up; errors surface through send_request.
            let _ = connection.await;
        });
        Ok(sender.send_request(req).await?)
    }

    /// Reverse-proxy one captured request to the child.
    ///
    /// The body was read once at the edge (bounded) and is replayed here
    /// from memory.  CORS response headers are stripped; the edge applies
    /// its own.
    pub async fn proxy(&self, parts: http::request::Parts, body: Bytes) -> Response {
        let path = upstream_path(&parts.uri);
        let uri: Uri = match path.parse() {
            Ok(uri) => uri,
            Err(err) => {
                warn!(runner = %self.key, error = %err, "unroutable request path");
                return (StatusCode::INTERNAL_SERVER_ERROR, "unroutable request path")
                    .into_response();
            }
        };

        let mut req = hyper::Request::new(Full::new(body));
        *req.method_mut() = parts.method;
        *req.uri_mut() = uri;
        *req.headers_mut() = parts.headers;
        strip_hop_headers(req.headers_mut());
        req.headers_mut().remove(HOST);
        req.headers_mut()
            .insert(HOST, HeaderValue::from_static(PROXY_HOST));

        match self.forward(req).await {
            Ok(upstream) => {
                let (mut parts, body) = upstream.into_parts();
                strip_hop_headers(&mut parts.headers);
                strip_cors_headers(&mut parts.headers);
                Response::from_parts(parts, Body::new(body))
            }
            Err(err) => self.proxy_error(err).await,
        }
    }

    /// A failed exchange usually means the child died mid-request.  Wait
    /// briefly for the supervisor to confirm, then answer in the OpenAI
    /// error shape; anything else is a plain bad gateway.
    async fn proxy_error(&self, err: anyhow::Error) -> Response {
        let child_died = tokio::time::timeout(DONE_GRACE, self.done.cancelled())
            .await
            .is_ok();
        if child_died {
            let message = self
                .exit_reason
                .get()
                .cloned()
                .unwrap_or_else(|| SchedulerError::BackendQuitUnexpectedly.to_string());
            warn!(runner = %self.key, error = %message, "child died during request");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(openai_error_body(&message)),
            )
                .into_response();
        }
        warn!(runner = %self.key, error = %err, "upstream request failed");
        (StatusCode::BAD_GATEWAY, "upstream request failed").into_response()
    }

    /// Cancel the child and wait for the supervisor to confirm its exit.
    pub(crate) async fn terminate(&self) {
        self.cancel.cancel();
        self.done.cancelled().await;
        let supervisor = self
            .supervisor
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }
        let _ = std::fs::remove_file(&self.socket);
        debug!(runner = %self.key, slot = self.slot, "runner terminated");
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("key", &self.key.to_string())
            .field("slot", &self.slot)
            .field("defunct", &self.is_defunct())
            .finish()
    }
}

fn strip_cors_headers(headers: &mut http::HeaderMap) {
    let cors: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with("access-control-"))
        .cloned()
        .collect();
    for name in cors {
        while headers.remove(&name).is_some() {}
    }
}

/// Hop-by-hop headers never cross the proxy; bodies are re-framed from
/// memory on both legs.
fn strip_hop_headers(headers: &mut http::HeaderMap) {
    const HOP_HEADERS: [&str; 8] = [
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ];
    for name in HOP_HEADERS {
        while headers.remove(name).is_some() {}
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

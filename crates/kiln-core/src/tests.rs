//! Integration-style tests over fake collaborators.
//!
//! The fake backend binds a real HTTP server on the runner socket, so the
//! readiness poll, the reverse proxy, and the defunct detection all exercise
//! the same code paths a live inference engine would.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use kiln_types::{BackendConfig, BackendMode, RequiredMemory, RunnerKey};

use crate::backend::{Backend, BackendError, Model, ModelError, ModelManager, SystemMemoryInfo};
use crate::error::{SchedulerError, MAX_REQUEST_BODY_BYTES};
use crate::installer::Installer;
use crate::loader::{Loader, LoaderOptions};
use crate::scheduler::Scheduler;

// ── Fakes ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InstallBehavior {
    Succeed,
    Fail,
    BlockUntilCancelled,
}

struct FakeBackend {
    name: String,
    memory: RequiredMemory,
    gguf_parse_error: bool,
    /// Delay before the child binds its socket; simulates a slow cold start.
    ready_delay: Duration,
    install: std::sync::Mutex<InstallBehavior>,
    install_calls: AtomicUsize,
    run_fails: std::sync::Mutex<bool>,
    spawns: AtomicUsize,
    /// Fired to make every running child of this backend exit with an error.
    crash: Arc<Notify>,
}

impl FakeBackend {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            memory: RequiredMemory::ZERO,
            gguf_parse_error: false,
            ready_delay: Duration::ZERO,
            install: std::sync::Mutex::new(InstallBehavior::Succeed),
            install_calls: AtomicUsize::new(0),
            run_fails: std::sync::Mutex::new(false),
            spawns: AtomicUsize::new(0),
            crash: Arc::new(Notify::new()),
        }
    }

    fn with_memory(mut self, memory: RequiredMemory) -> Self {
        self.memory = memory;
        self
    }

    fn with_gguf_parse_error(mut self) -> Self {
        self.gguf_parse_error = true;
        self
    }

    fn with_ready_delay(mut self, delay: Duration) -> Self {
        self.ready_delay = delay;
        self
    }

    fn set_install(&self, behavior: InstallBehavior) {
        *self.install.lock().unwrap() = behavior;
    }

    fn set_run_fails(&self, fails: bool) {
        *self.run_fails.lock().unwrap() = fails;
    }

    fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    fn serve_connection(stream: impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static, model_id: String) {
        let service = hyper::service::service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
            let model_id = model_id.clone();
            async move {
                let path = req.uri().path().to_owned();
                let body = req.into_body().collect().await.unwrap().to_bytes();
                let response = if path == "/v1/models" {
                    hyper::Response::new(Full::new(Bytes::from_static(b"{\"data\":[]}")))
                } else {
                    let payload = serde_json::json!({
                        "model": model_id,
                        "path": path,
                        "received": body.len(),
                    });
                    hyper::Response::builder()
                        .header("content-type", "application/json")
                        // The edge must strip this.
                        .header("access-control-allow-origin", "*")
                        .body(Full::new(Bytes::from(payload.to_string())))
                        .unwrap()
                };
                Ok::<_, std::convert::Infallible>(response)
            }
        });
        tokio::spawn(async move {
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await;
        });
    }
}

#[async_trait]
impl Backend for FakeBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn install(
        &self,
        _http: &reqwest::Client,
        cancel: &CancellationToken,
    ) -> Result<(), BackendError> {
        self.install_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = *self.install.lock().unwrap();
        match behavior {
            InstallBehavior::Succeed => Ok(()),
            InstallBehavior::Fail => Err(anyhow::anyhow!("download failed").into()),
            InstallBehavior::BlockUntilCancelled => {
                cancel.cancelled().await;
                Err(BackendError::Cancelled)
            }
        }
    }

    async fn run(
        &self,
        endpoint: &Path,
        model_id: &str,
        _mode: BackendMode,
        _config: Option<&BackendConfig>,
        cancel: CancellationToken,
    ) -> Result<(), BackendError> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        if *self.run_fails.lock().unwrap() {
            return Err(anyhow::anyhow!("engine failed to load model").into());
        }
        if !self.ready_delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(BackendError::Cancelled),
                _ = tokio::time::sleep(self.ready_delay) => {}
            }
        }
        let listener =
            tokio::net::UnixListener::bind(endpoint).map_err(|err| BackendError::Other(err.into()))?;
        let model_id = model_id.to_owned();
        let crash = Arc::clone(&self.crash);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(BackendError::Cancelled),
                _ = crash.notified() => {
                    return Err(anyhow::anyhow!("inference engine crashed").into());
                }
                conn = listener.accept() => match conn {
                    Ok((stream, _addr)) => Self::serve_connection(stream, model_id.clone()),
                    Err(err) => return Err(BackendError::Other(err.into())),
                }
            }
        }
    }

    fn status(&self) -> String {
        format!("{} running", self.name)
    }

    async fn disk_usage(&self) -> Result<u64, BackendError> {
        Ok(42)
    }

    async fn required_memory(
        &self,
        _model_id: &str,
        _config: Option<&BackendConfig>,
    ) -> Result<RequiredMemory, BackendError> {
        if self.gguf_parse_error {
            return Err(BackendError::GgufParse("truncated header".into()));
        }
        Ok(self.memory)
    }

    fn uses_external_model_management(&self) -> bool {
        false
    }
}

struct FakeMemory {
    total: RequiredMemory,
}

impl SystemMemoryInfo for FakeMemory {
    fn total_memory(&self) -> RequiredMemory {
        self.total
    }

    fn have_sufficient_memory(&self, required: &RequiredMemory) -> anyhow::Result<bool> {
        Ok(!self.total.exceeded_by(required))
    }
}

struct FakeModels {
    /// tag → (id, size)
    models: HashMap<String, (String, u64)>,
}

impl FakeModels {
    fn with_model(tag: &str, id: &str, size: u64) -> Self {
        let mut models = HashMap::new();
        models.insert(tag.to_owned(), (id.to_owned(), size));
        Self { models }
    }
}

#[async_trait]
impl ModelManager for FakeModels {
    fn resolve_model_id(&self, model_ref: &str) -> String {
        self.models
            .get(model_ref)
            .map(|(id, _)| id.clone())
            .unwrap_or_else(|| model_ref.to_owned())
    }

    async fn get_model(&self, model_ref: &str) -> Result<Model, ModelError> {
        self.models
            .get(model_ref)
            .map(|(id, size)| Model {
                id: id.clone(),
                size: *size,
            })
            .ok_or_else(|| ModelError::NotFound(model_ref.to_owned()))
    }

    async fn disk_usage(&self) -> Result<u64, ModelError> {
        Ok(self.models.values().map(|(_, size)| size).sum())
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn test_socket_dir() -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let dir = std::env::temp_dir().join(format!(
        "kiln-test-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn backend_map(backend: &Arc<FakeBackend>) -> Arc<HashMap<String, Arc<dyn Backend>>> {
    let mut map: HashMap<String, Arc<dyn Backend>> = HashMap::new();
    map.insert(backend.name.clone(), Arc::clone(backend) as Arc<dyn Backend>);
    Arc::new(map)
}

async fn start_loader(
    backend: &Arc<FakeBackend>,
    total: RequiredMemory,
    idle_timeout: Duration,
) -> (Arc<Loader>, CancellationToken, JoinHandle<()>) {
    start_loader_with(backend_map(backend), total, idle_timeout).await
}

async fn start_loader_with(
    backends: Arc<HashMap<String, Arc<dyn Backend>>>,
    total: RequiredMemory,
    idle_timeout: Duration,
) -> (Arc<Loader>, CancellationToken, JoinHandle<()>) {
    let loader = Arc::new(Loader::new(
        backends,
        Arc::new(FakeMemory { total }),
        LoaderOptions {
            slot_count: Some(4),
            idle_timeout,
            socket_dir: test_socket_dir(),
        },
    ));
    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let loader = Arc::clone(&loader);
        let cancel = cancel.clone();
        async move { loader.run(cancel).await }
    });
    let enabled = Arc::clone(&loader);
    eventually("loads enabled", move || {
        let loader = Arc::clone(&enabled);
        async move { loader.loads_enabled().await }
    })
    .await;
    (loader, cancel, handle)
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if check().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

const GIB: u64 = 1 << 30;

// ── Loader tests ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn acquire_release_round_trip() {
    let backend = Arc::new(FakeBackend::new("fake").with_memory(RequiredMemory::new(GIB, 0)));
    let total = RequiredMemory::new(8 * GIB, 0);
    let (loader, cancel, handle) = start_loader(&backend, total, Duration::from_secs(300)).await;

    let key = RunnerKey::new("fake", "sha256:aa", BackendMode::Completion);
    let lease = loader
        .acquire(
            &CancellationToken::new(),
            "fake",
            "sha256:aa",
            "ai/tiny",
            BackendMode::Completion,
        )
        .await
        .expect("acquire should succeed");
    assert_eq!(backend.spawns(), 1);
    assert_eq!(loader.references_for(&key).await, Some(1));
    assert_eq!(loader.available_memory().await, total.minus(&RequiredMemory::new(GIB, 0)));

    drop(lease);
    let check = Arc::clone(&loader);
    eventually("reference released", move || {
        let loader = Arc::clone(&check);
        let key = key.clone();
        async move { loader.references_for(&key).await == Some(0) }
    })
    .await;
    // The runner stays resident until the idle timeout.
    assert_eq!(loader.runner_count().await, 1);

    cancel.cancel();
    handle.await.unwrap();
    assert_eq!(loader.runner_count().await, 0);
    assert_eq!(loader.available_memory().await, total);
}

#[tokio::test]
async fn concurrent_acquires_share_one_child() {
    let backend = Arc::new(FakeBackend::new("fake"));
    let total = RequiredMemory::new(8 * GIB, 0);
    let (loader, cancel, handle) = start_loader(&backend, total, Duration::from_secs(300)).await;

    let acquire = |loader: Arc<Loader>| async move {
        loader
            .acquire(
                &CancellationToken::new(),
                "fake",
                "sha256:aa",
                "ai/tiny",
                BackendMode::Completion,
            )
            .await
            .expect("acquire should succeed")
    };
    let (lease_a, lease_b) = tokio::join!(
        acquire(Arc::clone(&loader)),
        acquire(Arc::clone(&loader))
    );

    assert_eq!(backend.spawns(), 1, "dedup must start exactly one child");
    let key = RunnerKey::new("fake", "sha256:aa", BackendMode::Completion);
    assert_eq!(loader.references_for(&key).await, Some(2));
    assert_eq!(loader.runner_count().await, 1);

    drop(lease_a);
    drop(lease_b);
    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn concurrent_acquires_dedup_during_slow_startup() {
    let backend =
        Arc::new(FakeBackend::new("fake").with_ready_delay(Duration::from_millis(300)));
    let (loader, cancel, handle) = start_loader(
        &backend,
        RequiredMemory::new(8 * GIB, 0),
        Duration::from_secs(300),
    )
    .await;

    // Truly concurrent tasks: the second must park on the in-flight start
    // rather than spawn its own child.
    let acquire = |loader: Arc<Loader>| {
        tokio::spawn(async move {
            loader
                .acquire(
                    &CancellationToken::new(),
                    "fake",
                    "sha256:aa",
                    "ai/tiny",
                    BackendMode::Completion,
                )
                .await
        })
    };
    let (lease_a, lease_b) = tokio::join!(
        acquire(Arc::clone(&loader)),
        acquire(Arc::clone(&loader))
    );
    let lease_a = lease_a.unwrap().expect("first acquire");
    let lease_b = lease_b.unwrap().expect("second acquire");

    assert_eq!(backend.spawns(), 1, "dedup must hold across a slow startup");
    let key = RunnerKey::new("fake", "sha256:aa", BackendMode::Completion);
    assert_eq!(loader.references_for(&key).await, Some(2));

    drop(lease_a);
    drop(lease_b);
    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn cold_start_does_not_block_other_keys() {
    let slow = Arc::new(FakeBackend::new("slow").with_ready_delay(Duration::from_secs(30)));
    let fast = Arc::new(FakeBackend::new("fast"));
    let mut map: HashMap<String, Arc<dyn Backend>> = HashMap::new();
    map.insert(slow.name.clone(), Arc::clone(&slow) as Arc<dyn Backend>);
    map.insert(fast.name.clone(), Arc::clone(&fast) as Arc<dyn Backend>);
    let total = RequiredMemory::new(8 * GIB, 0);
    let (loader, cancel, handle) =
        start_loader_with(Arc::new(map), total, Duration::from_secs(300)).await;

    // Park one acquire in the readiness wait of a never-ready backend.
    let slow_token = CancellationToken::new();
    let pending = tokio::spawn({
        let loader = Arc::clone(&loader);
        let token = slow_token.clone();
        async move {
            loader
                .acquire(&token, "slow", "sha256:aa", "slow-model", BackendMode::Completion)
                .await
        }
    });
    let started = Arc::clone(&slow);
    eventually("slow child spawned", move || {
        let slow = Arc::clone(&started);
        async move { slow.spawns() == 1 }
    })
    .await;

    // Other keys and read-only snapshots must not queue behind the cold
    // start.
    let lease = tokio::time::timeout(
        Duration::from_secs(5),
        loader.acquire(
            &CancellationToken::new(),
            "fast",
            "sha256:bb",
            "fast-model",
            BackendMode::Completion,
        ),
    )
    .await
    .expect("unrelated acquire must not block behind a cold start")
    .expect("fast acquire");

    let running = tokio::time::timeout(Duration::from_secs(1), loader.running())
        .await
        .expect("running() must not block behind a cold start");
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].backend_name, "fast");

    // Abandoning the cold start rolls its reservation back.
    slow_token.cancel();
    let err = pending
        .await
        .unwrap()
        .expect_err("cancelled cold start must fail");
    assert!(matches!(err, SchedulerError::Cancelled));

    drop(lease);
    cancel.cancel();
    handle.await.unwrap();
    assert_eq!(loader.runner_count().await, 0);
    assert_eq!(loader.available_memory().await, total);
}

#[tokio::test]
async fn completion_and_embedding_runners_are_distinct() {
    let backend = Arc::new(FakeBackend::new("fake"));
    let (loader, cancel, handle) = start_loader(
        &backend,
        RequiredMemory::new(8 * GIB, 0),
        Duration::from_secs(300),
    )
    .await;

    let token = CancellationToken::new();
    let completion = loader
        .acquire(&token, "fake", "sha256:aa", "ai/tiny", BackendMode::Completion)
        .await
        .unwrap();
    let embedding = loader
        .acquire(&token, "fake", "sha256:aa", "ai/tiny", BackendMode::Embedding)
        .await
        .unwrap();

    assert_eq!(backend.spawns(), 2);
    assert_eq!(loader.runner_count().await, 2);

    drop(completion);
    drop(embedding);
    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn memory_pressure_evicts_released_runner() {
    let backend = Arc::new(FakeBackend::new("fake").with_memory(RequiredMemory::new(0, 3 * GIB / 2)));
    let total = RequiredMemory::new(0, 2 * GIB);
    let (loader, cancel, handle) = start_loader(&backend, total, Duration::from_secs(300)).await;

    let token = CancellationToken::new();
    let first = loader
        .acquire(&token, "fake", "sha256:aa", "first", BackendMode::Completion)
        .await
        .unwrap();
    drop(first);
    let released = Arc::clone(&loader);
    let key = RunnerKey::new("fake", "sha256:aa", BackendMode::Completion);
    eventually("first runner released", move || {
        let loader = Arc::clone(&released);
        let key = key.clone();
        async move { loader.references_for(&key).await == Some(0) }
    })
    .await;

    // 1.5 GiB free of 2 GiB: admitting the second model forces the first out.
    let second = loader
        .acquire(&token, "fake", "sha256:bb", "second", BackendMode::Completion)
        .await
        .expect("second model should evict the first");
    assert_eq!(loader.runner_count().await, 1);
    assert_eq!(backend.spawns(), 2);

    drop(second);
    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn model_too_big_fails_before_spawn() {
    let backend = Arc::new(FakeBackend::new("fake").with_memory(RequiredMemory::new(32 * GIB, 0)));
    let (loader, cancel, handle) = start_loader(
        &backend,
        RequiredMemory::new(8 * GIB, 0),
        Duration::from_secs(300),
    )
    .await;

    let err = loader
        .acquire(
            &CancellationToken::new(),
            "fake",
            "sha256:aa",
            "huge",
            BackendMode::Completion,
        )
        .await
        .expect_err("model larger than the host must be rejected");
    assert!(matches!(err, SchedulerError::ModelTooBig(_)));
    assert_eq!(backend.spawns(), 0);

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn gguf_parse_failure_schedules_without_reservation() {
    let backend = Arc::new(
        FakeBackend::new("fake")
            .with_memory(RequiredMemory::new(32 * GIB, 0))
            .with_gguf_parse_error(),
    );
    let total = RequiredMemory::new(8 * GIB, 0);
    let (loader, cancel, handle) = start_loader(&backend, total, Duration::from_secs(300)).await;

    let lease = loader
        .acquire(
            &CancellationToken::new(),
            "fake",
            "sha256:aa",
            "opaque",
            BackendMode::Completion,
        )
        .await
        .expect("unparseable model proceeds with zero requirement");
    // Nothing was reserved.
    assert_eq!(loader.available_memory().await, total);

    drop(lease);
    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn idle_runner_is_evicted_after_timeout() {
    let backend = Arc::new(FakeBackend::new("fake"));
    let (loader, cancel, handle) = start_loader(
        &backend,
        RequiredMemory::new(8 * GIB, 0),
        Duration::from_millis(200),
    )
    .await;

    let lease = loader
        .acquire(
            &CancellationToken::new(),
            "fake",
            "sha256:aa",
            "ai/tiny",
            BackendMode::Completion,
        )
        .await
        .unwrap();
    drop(lease);

    let check = Arc::clone(&loader);
    eventually("idle eviction", move || {
        let loader = Arc::clone(&check);
        async move { loader.runner_count().await == 0 }
    })
    .await;

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn crashed_child_is_replaced_on_next_acquire() {
    let backend = Arc::new(FakeBackend::new("fake"));
    let (loader, cancel, handle) = start_loader(
        &backend,
        RequiredMemory::new(8 * GIB, 0),
        Duration::from_secs(300),
    )
    .await;

    let token = CancellationToken::new();
    let lease = loader
        .acquire(&token, "fake", "sha256:aa", "ai/tiny", BackendMode::Completion)
        .await
        .unwrap();

    backend.crash.notify_one();
    let runner = Arc::clone(lease.runner());
    eventually("child exit observed", move || {
        let runner = Arc::clone(&runner);
        async move { runner.is_defunct() }
    })
    .await;

    // The in-flight request now hits a dead socket and gets the
    // OpenAI-shaped error body.
    let (parts, _) = http::Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .body(())
        .unwrap()
        .into_parts();
    let response = lease.proxy(parts, Bytes::from_static(b"{}")).await;
    assert_eq!(response.status(), http::StatusCode::INTERNAL_SERVER_ERROR);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["type"], "error");
    assert!(body["message"].as_str().unwrap().contains("crashed"));

    // Releasing the defunct runner evicts it; the next acquire starts fresh.
    drop(lease);
    let gone = Arc::clone(&loader);
    eventually("defunct runner evicted", move || {
        let loader = Arc::clone(&gone);
        async move { loader.runner_count().await == 0 }
    })
    .await;

    let lease = loader
        .acquire(&token, "fake", "sha256:aa", "ai/tiny", BackendMode::Completion)
        .await
        .expect("fresh child should start");
    assert_eq!(backend.spawns(), 2);

    drop(lease);
    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn failed_startup_releases_slot_and_memory() {
    let backend = Arc::new(FakeBackend::new("fake").with_memory(RequiredMemory::new(GIB, 0)));
    backend.set_run_fails(true);
    let total = RequiredMemory::new(8 * GIB, 0);
    let (loader, cancel, handle) = start_loader(&backend, total, Duration::from_secs(300)).await;

    let token = CancellationToken::new();
    let err = loader
        .acquire(&token, "fake", "sha256:aa", "ai/tiny", BackendMode::Completion)
        .await
        .expect_err("startup failure must surface");
    assert!(matches!(err, SchedulerError::BackendFailed(_)));
    assert_eq!(loader.runner_count().await, 0);
    assert_eq!(loader.available_memory().await, total);

    // The slot is immediately usable again.
    backend.set_run_fails(false);
    let lease = loader
        .acquire(&token, "fake", "sha256:aa", "ai/tiny", BackendMode::Completion)
        .await
        .expect("retry after failed startup");
    drop(lease);
    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn shutdown_drains_all_runners() {
    let backend = Arc::new(FakeBackend::new("fake").with_memory(RequiredMemory::new(GIB, 0)));
    let total = RequiredMemory::new(8 * GIB, 0);
    let (loader, cancel, handle) = start_loader(&backend, total, Duration::from_secs(300)).await;

    let lease = loader
        .acquire(
            &CancellationToken::new(),
            "fake",
            "sha256:aa",
            "ai/tiny",
            BackendMode::Completion,
        )
        .await
        .unwrap();

    cancel.cancel();
    // The drain must outwait the in-flight reference.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!handle.is_finished(), "drain must wait for held references");
    assert_eq!(loader.runner_count().await, 1);

    drop(lease);
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("drain should finish once references drop")
        .unwrap();
    assert_eq!(loader.runner_count().await, 0);
    assert_eq!(loader.available_memory().await, total);

    // Loads are disabled once the run loop has exited.
    let err = loader
        .acquire(
            &CancellationToken::new(),
            "fake",
            "sha256:aa",
            "ai/tiny",
            BackendMode::Completion,
        )
        .await
        .expect_err("no loads after drain");
    assert!(matches!(err, SchedulerError::LoadsDisabled));
}

#[tokio::test]
async fn unload_all_forces_fresh_child() {
    let backend = Arc::new(FakeBackend::new("fake"));
    let (loader, cancel, handle) = start_loader(
        &backend,
        RequiredMemory::new(8 * GIB, 0),
        Duration::from_secs(300),
    )
    .await;

    let token = CancellationToken::new();
    let lease = loader
        .acquire(&token, "fake", "sha256:aa", "ai/tiny", BackendMode::Completion)
        .await
        .unwrap();
    drop(lease);
    let released = Arc::clone(&loader);
    let key = RunnerKey::new("fake", "sha256:aa", BackendMode::Completion);
    eventually("released", move || {
        let loader = Arc::clone(&released);
        let key = key.clone();
        async move { loader.references_for(&key).await == Some(0) }
    })
    .await;

    assert_eq!(loader.unload_all().await, 1);
    assert_eq!(loader.runner_count().await, 0);

    let lease = loader
        .acquire(&token, "fake", "sha256:aa", "ai/tiny", BackendMode::Completion)
        .await
        .unwrap();
    assert_eq!(backend.spawns(), 2);

    drop(lease);
    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn reconfigure_rejected_while_runner_in_use() {
    let backend = Arc::new(FakeBackend::new("fake"));
    let (loader, cancel, handle) = start_loader(
        &backend,
        RequiredMemory::new(8 * GIB, 0),
        Duration::from_secs(300),
    )
    .await;

    let config = BackendConfig {
        context_size: Some(4096),
        runtime_flags: vec!["--flash-attn".into()],
    };
    // No runner yet: plain store.
    loader
        .set_runner_config("fake", "sha256:aa", BackendMode::Completion, config.clone())
        .await
        .unwrap();
    // Same configuration again is a no-op even with a live runner.
    let token = CancellationToken::new();
    let lease = loader
        .acquire(&token, "fake", "sha256:aa", "ai/tiny", BackendMode::Completion)
        .await
        .unwrap();
    loader
        .set_runner_config("fake", "sha256:aa", BackendMode::Completion, config.clone())
        .await
        .unwrap();

    let changed = BackendConfig {
        context_size: Some(8192),
        runtime_flags: Vec::new(),
    };
    let err = loader
        .set_runner_config("fake", "sha256:aa", BackendMode::Completion, changed.clone())
        .await
        .expect_err("cannot reconfigure while referenced");
    assert!(matches!(err, SchedulerError::RunnerAlreadyActive(_)));

    drop(lease);
    let released = Arc::clone(&loader);
    let key = RunnerKey::new("fake", "sha256:aa", BackendMode::Completion);
    eventually("released", move || {
        let loader = Arc::clone(&released);
        let key = key.clone();
        async move { loader.references_for(&key).await == Some(0) }
    })
    .await;

    // Unused runner: the change evicts it so the next start picks it up.
    loader
        .set_runner_config("fake", "sha256:aa", BackendMode::Completion, changed)
        .await
        .unwrap();
    assert_eq!(loader.runner_count().await, 0);

    cancel.cancel();
    handle.await.unwrap();
}

// ── Installer tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn installer_wait_requires_run() {
    let backend = Arc::new(FakeBackend::new("fake"));
    let installer = Installer::new(backend_map(&backend), reqwest::Client::new());
    let err = installer
        .wait(&CancellationToken::new(), "fake")
        .await
        .expect_err("wait before run must fail fast");
    assert!(matches!(err, SchedulerError::InstallerNotStarted));
}

#[tokio::test]
async fn installer_unknown_backend() {
    let backend = Arc::new(FakeBackend::new("fake"));
    let installer = Installer::new(backend_map(&backend), reqwest::Client::new());
    installer.run(CancellationToken::new()).await;
    let err = installer
        .wait(&CancellationToken::new(), "missing")
        .await
        .expect_err("unknown backend");
    assert!(matches!(err, SchedulerError::BackendNotFound(_)));
}

#[tokio::test]
async fn installer_runs_each_backend_once() {
    let backend = Arc::new(FakeBackend::new("fake"));
    let installer = Installer::new(backend_map(&backend), reqwest::Client::new());
    installer.run(CancellationToken::new()).await;
    installer.run(CancellationToken::new()).await;
    assert_eq!(backend.install_calls.load(Ordering::SeqCst), 1);
    installer
        .wait(&CancellationToken::new(), "fake")
        .await
        .expect("installed backend");
}

#[tokio::test]
async fn installer_failure_is_permanent() {
    let backend = Arc::new(FakeBackend::new("fake"));
    backend.set_install(InstallBehavior::Fail);
    let installer = Installer::new(backend_map(&backend), reqwest::Client::new());
    installer.run(CancellationToken::new()).await;
    let err = installer
        .wait(&CancellationToken::new(), "fake")
        .await
        .expect_err("failed install");
    assert!(matches!(err, SchedulerError::InstallFailed(_)));

    // Failed backends are not retried by a second run.
    backend.set_install(InstallBehavior::Succeed);
    installer.run(CancellationToken::new()).await;
    assert_eq!(backend.install_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn real_failure_during_shutdown_is_recorded() {
    let backend = Arc::new(FakeBackend::new("fake"));
    backend.set_install(InstallBehavior::Fail);
    let installer = Installer::new(backend_map(&backend), reqwest::Client::new());

    // The token is already set, but the install error is a real failure,
    // not a cancellation: it must land in the failed state, not Pending.
    let cancel = CancellationToken::new();
    cancel.cancel();
    installer.run(cancel).await;

    let err = installer
        .wait(&CancellationToken::new(), "fake")
        .await
        .expect_err("broken install must be recorded");
    assert!(matches!(err, SchedulerError::InstallFailed(_)));
}

#[tokio::test]
async fn cancelled_install_stays_retryable() {
    let backend = Arc::new(FakeBackend::new("fake"));
    backend.set_install(InstallBehavior::BlockUntilCancelled);
    let installer = Arc::new(Installer::new(backend_map(&backend), reqwest::Client::new()));

    let cancel = CancellationToken::new();
    let run = tokio::spawn({
        let installer = Arc::clone(&installer);
        let cancel = cancel.clone();
        async move { installer.run(cancel).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    run.await.unwrap();

    // A restarted installer retries the interrupted backend.
    backend.set_install(InstallBehavior::Succeed);
    installer.run(CancellationToken::new()).await;
    assert_eq!(backend.install_calls.load(Ordering::SeqCst), 2);
    installer
        .wait(&CancellationToken::new(), "fake")
        .await
        .expect("retried install succeeds");
}

// ── Scheduler HTTP tests ──────────────────────────────────────────────────────

fn test_scheduler(
    backend: &Arc<FakeBackend>,
) -> (Arc<Scheduler>, CancellationToken, JoinHandle<()>) {
    let mut backends: HashMap<String, Arc<dyn Backend>> = HashMap::new();
    backends.insert(backend.name.clone(), Arc::clone(backend) as Arc<dyn Backend>);
    let cancel = CancellationToken::new();
    let scheduler = Scheduler::new(
        backends,
        backend.name.clone(),
        Arc::new(FakeModels::with_model("ai/tiny", "sha256:feed", 64)),
        Arc::new(FakeMemory {
            total: RequiredMemory::new(8 * GIB, 0),
        }),
        LoaderOptions {
            slot_count: Some(2),
            idle_timeout: Duration::from_secs(300),
            socket_dir: test_socket_dir(),
        },
        cancel.clone(),
    );
    let handle = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        async move { scheduler.run().await }
    });
    (scheduler, cancel, handle)
}

fn post_json(uri: &str, body: &str) -> http::Request<Body> {
    http::Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_owned()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn cold_chat_completion_end_to_end() {
    let backend = Arc::new(FakeBackend::new("llamacpp"));
    let (scheduler, cancel, handle) = test_scheduler(&backend);
    let router = scheduler.router();

    // Retry while the installer and loader come up.
    let mut response = None;
    for _ in 0..100 {
        let candidate = router
            .clone()
            .oneshot(post_json(
                "/v1/chat/completions",
                r#"{"model":"ai/tiny","messages":[{"role":"user","content":"hi"}]}"#,
            ))
            .await
            .unwrap();
        if candidate.status() != http::StatusCode::SERVICE_UNAVAILABLE {
            response = Some(candidate);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let response = response.expect("scheduler should come up");
    assert_eq!(response.status(), http::StatusCode::OK);
    assert!(
        !response
            .headers()
            .keys()
            .any(|h| h.as_str().starts_with("access-control-")),
        "proxy must not forward CORS headers"
    );
    let body = body_json(response).await;
    // The runner saw the resolved digest and the OpenAI path.
    assert_eq!(body["model"], "sha256:feed");
    assert_eq!(body["path"], "/v1/chat/completions");
    assert_eq!(backend.spawns(), 1);

    // Once the lease is released the runner shows up as idle in /ps.
    let ps_router = router.clone();
    eventually("runner idle in /ps", move || {
        let router = ps_router.clone();
        async move {
            let response = router
                .oneshot(
                    http::Request::builder()
                        .uri("/ps")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            let body = body_json(response).await;
            body.as_array().is_some_and(|runners| {
                runners.len() == 1
                    && runners[0]["backend_name"] == "llamacpp"
                    && runners[0]["model_name"] == "ai/tiny"
                    && runners[0]["mode"] == "completion"
                    && !runners[0]["last_used"].is_null()
            })
        }
    })
    .await;

    // Unload everything and confirm /ps is empty again.
    let response = router
        .clone()
        .oneshot(post_json("/unload", r#"{"all":true}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), http::StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["unloaded_runners"], 1);

    let response = router
        .clone()
        .oneshot(
            http::Request::builder()
                .uri("/ps")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body, serde_json::json!([]));

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn unknown_backend_is_404() {
    let backend = Arc::new(FakeBackend::new("llamacpp"));
    let (scheduler, cancel, handle) = test_scheduler(&backend);
    let response = scheduler
        .router()
        .oneshot(post_json(
            "/missing/v1/chat/completions",
            r#"{"model":"ai/tiny"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), http::StatusCode::NOT_FOUND);
    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn missing_model_field_is_400() {
    let backend = Arc::new(FakeBackend::new("llamacpp"));
    let (scheduler, cancel, handle) = test_scheduler(&backend);
    let router = scheduler.router();

    let check = router.clone();
    eventually("envelope validation active", move || {
        let router = check.clone();
        async move {
            let response = router
                .oneshot(post_json("/v1/chat/completions", r#"{"messages":[]}"#))
                .await
                .unwrap();
            response.status() == http::StatusCode::BAD_REQUEST
        }
    })
    .await;

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn unknown_model_is_404() {
    let backend = Arc::new(FakeBackend::new("llamacpp"));
    let (scheduler, cancel, handle) = test_scheduler(&backend);
    let router = scheduler.router();

    let check = router.clone();
    eventually("model lookup active", move || {
        let router = check.clone();
        async move {
            let response = router
                .oneshot(post_json("/v1/chat/completions", r#"{"model":"ai/nope"}"#))
                .await
                .unwrap();
            response.status() == http::StatusCode::NOT_FOUND
        }
    })
    .await;

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn oversized_body_is_400_before_install_gate() {
    let backend = Arc::new(FakeBackend::new("llamacpp"));
    let (scheduler, cancel, handle) = test_scheduler(&backend);

    let oversize = vec![b'x'; MAX_REQUEST_BODY_BYTES + 1];
    let request = http::Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .body(Body::from(oversize))
        .unwrap();
    let response = scheduler.router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), http::StatusCode::BAD_REQUEST);

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn management_routes_respond() {
    let backend = Arc::new(FakeBackend::new("llamacpp"));
    let (scheduler, cancel, handle) = test_scheduler(&backend);
    let router = scheduler.router();

    let response = router
        .clone()
        .oneshot(
            http::Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), http::StatusCode::OK);

    let response = router
        .clone()
        .oneshot(
            http::Request::builder()
                .uri("/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["llamacpp"], "llamacpp running");

    let response = router
        .clone()
        .oneshot(
            http::Request::builder()
                .uri("/df")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["models_disk_usage"], 64);
    assert_eq!(body["default_backend_disk_usage"], 42);

    let response = router
        .clone()
        .oneshot(post_json(
            "/models/configure",
            r#"{"model":"ai/tiny","context_size":4096}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), http::StatusCode::OK);

    cancel.cancel();
    handle.await.unwrap();
}

//! kiln-server – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables.
//! 2. Initialise structured tracing (JSON in production, pretty in dev).
//! 3. Build the concrete adapters (exec backend, directory model manager,
//!    sysinfo memory probe) and the scheduling core.
//! 4. Start the scheduler run loop (installer + loader) in the background.
//! 5. Start the HTTP server with graceful shutdown; on SIGINT/SIGTERM the
//!    scheduler drains every runner before the process exits.

mod config;
mod exec_backend;
mod file_models;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use kiln_core::backend::Backend;
use kiln_core::{LoaderOptions, Scheduler, SysinfoMemory};

use crate::config::Config;
use crate::exec_backend::ExecBackend;
use crate::file_models::DirModelManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cfg = Config::from_env();

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(filter) => filter,
            Err(err) => {
                eprintln!(
                    "WARN: KILN_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, err
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);
    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "kiln-server starting");

    // ── 3. Components ──────────────────────────────────────────────────────────
    let command: Vec<String> = cfg
        .backend_command
        .as_deref()
        .map(|raw| raw.split_whitespace().map(str::to_owned).collect())
        .unwrap_or_default();
    let backend = Arc::new(ExecBackend::new(
        cfg.default_backend.clone(),
        &cfg.models_dir,
        command,
    ));
    let mut backends: HashMap<String, Arc<dyn Backend>> = HashMap::new();
    backends.insert(cfg.default_backend.clone(), backend);

    let models = Arc::new(DirModelManager::open(&cfg.models_dir));
    let memory = Arc::new(SysinfoMemory::probe());

    let cancel = CancellationToken::new();
    let scheduler = Scheduler::new(
        backends,
        cfg.default_backend.clone(),
        models,
        memory,
        LoaderOptions {
            slot_count: None,
            idle_timeout: Duration::from_secs(cfg.idle_timeout_secs),
            socket_dir: cfg.socket_dir.clone().into(),
        },
        cancel.clone(),
    );

    // ── 4. Scheduler run loop ──────────────────────────────────────────────────
    let run = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        async move { scheduler.run().await }
    });

    // ── 5. HTTP server with graceful shutdown ──────────────────────────────────
    let cors = match &cfg.cors_allowed_origins {
        Some(raw) => {
            let origins: Vec<axum::http::HeaderValue> = raw
                .split(',')
                .filter_map(|origin| origin.trim().parse().ok())
                .collect();
            if origins.is_empty() {
                CorsLayer::new().allow_origin(Any).allow_headers(Any).allow_methods(Any)
            } else {
                CorsLayer::new()
                    .allow_origin(origins)
                    .allow_headers(Any)
                    .allow_methods(Any)
            }
        }
        // Wildcard – suitable for development; set KILN_CORS_ORIGINS in production.
        None => CorsLayer::new().allow_origin(Any).allow_headers(Any).allow_methods(Any),
    };
    let app = scheduler.router().layer(cors);

    let addr: SocketAddr = cfg.bind_address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown({
            let cancel = cancel.clone();
            async move {
                shutdown_signal().await;
                cancel.cancel();
            }
        })
        .await?;

    // The serve loop can also end without a signal; make sure the scheduler
    // drains either way.
    cancel.cancel();
    run.await?;
    info!("kiln-server stopped");
    Ok(())
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => warn!(error = %err, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}

//! One-shot backend provisioning.
//!
//! Each backend's install step runs exactly once; the outcome is a
//! write-once state (`Installed` or `Failed`) that any number of request
//! handlers can wait on.  Installation interrupted by shutdown leaves the
//! backend `Pending`, so a restarted installer retries instead of pinning a
//! spurious permanent failure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::error::SchedulerError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum InstallState {
    Pending,
    Installed,
    Failed(String),
}

pub struct Installer {
    backends: Arc<HashMap<String, Arc<dyn Backend>>>,
    http: reqwest::Client,
    started: AtomicBool,
    installs: HashMap<String, watch::Sender<InstallState>>,
}

impl Installer {
    pub fn new(backends: Arc<HashMap<String, Arc<dyn Backend>>>, http: reqwest::Client) -> Self {
        let installs = backends
            .keys()
            .map(|name| (name.clone(), watch::Sender::new(InstallState::Pending)))
            .collect();
        Installer {
            backends,
            http,
            started: AtomicBool::new(false),
            installs,
        }
    }

    /// Install every backend that has not yet reached an outcome.
    ///
    /// Ordering between backends is unspecified; each runs independently.
    pub async fn run(&self, cancel: CancellationToken) {
        self.started.store(true, Ordering::SeqCst);
        let installs = self
            .backends
            .iter()
            .map(|(name, backend)| self.install_one(name, Arc::clone(backend), cancel.clone()));
        futures::future::join_all(installs).await;
    }

    async fn install_one(&self, name: &str, backend: Arc<dyn Backend>, cancel: CancellationToken) {
        let Some(state) = self.installs.get(name) else {
            return;
        };
        if *state.borrow() != InstallState::Pending {
            debug!(backend = name, "already installed; skipping");
            return;
        }
        info!(backend = name, "installing backend");
        match backend.install(&self.http, &cancel).await {
            Ok(()) => {
                info!(backend = name, "backend installed");
                state.send_replace(InstallState::Installed);
            }
            // Only an error that is itself a cancellation counts as a
            // shutdown interruption; a real failure that happens to land
            // during shutdown must still be recorded as failed.
            Err(err) if err.is_cancellation() => {
                // Deliberately stays Pending: a restarted installer retries.
                warn!(backend = name, "install interrupted by shutdown; backend stays retryable");
            }
            Err(err) => {
                error!(backend = name, error = %err, "backend install failed");
                state.send_replace(InstallState::Failed(err.to_string()));
            }
        }
    }

    /// Block until `backend_name`'s install has an outcome.
    pub async fn wait(
        &self,
        cancel: &CancellationToken,
        backend_name: &str,
    ) -> Result<(), SchedulerError> {
        let state = self
            .installs
            .get(backend_name)
            .ok_or_else(|| SchedulerError::BackendNotFound(backend_name.to_owned()))?;
        // An installer that never started would leave waiters hanging until
        // their deadline; fail fast instead.
        if !self.started.load(Ordering::SeqCst) {
            return Err(SchedulerError::InstallerNotStarted);
        }
        let mut rx = state.subscribe();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(SchedulerError::InstallerShuttingDown),
            changed = rx.wait_for(|state| *state != InstallState::Pending) => changed,
        };
        match outcome {
            Ok(state) => match &*state {
                InstallState::Installed => Ok(()),
                InstallState::Failed(reason) => Err(SchedulerError::InstallFailed(reason.clone())),
                InstallState::Pending => unreachable!("wait_for filtered Pending"),
            },
            Err(_) => Err(SchedulerError::InstallerShuttingDown),
        }
    }
}

//! Slot-based runner admission.
//!
//! The loader owns all scheduling state: a fixed slot table, per-slot
//! reference counts and memory allocations, the runner map keyed by
//! (backend, model id, mode), the persisted per-key configurations, and the
//! waiter set used to broadcast state changes.  Every mutation happens under
//! one `tokio::sync::Mutex`; acquiring it and waiting for a state change are
//! both cancellable, which is what the admission loop needs.
//!
//! Startup does not hold the critical section: an admission marks its key
//! and slot as starting, earmarks the memory, and releases the lock while
//! the child boots.  Same-key acquires park on the waiter set until the
//! start commits or rolls back, so a key can never be double-started, while
//! releases, other keys, and the read-only snapshots keep flowing past a
//! slow cold start.

use std::collections::HashMap;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kiln_types::{BackendConfig, BackendMode, RequiredMemory, RunnerKey, RunnerState};

use crate::backend::{Backend, BackendError, SystemMemoryInfo};
use crate::error::SchedulerError;
use crate::runner::Runner;
use crate::sysmem;

/// Default TTL after which an unused runner is evicted.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Slack added to the idle deadline so a runner is never inspected a hair
/// before its timeout elapses.
const IDLE_SLACK: Duration = Duration::from_millis(100);

/// Poll interval of the exit-time drain loop.
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Hard ceiling on the slot table; real memory is the binding constraint on
/// almost every host.
pub const MAX_SLOTS: usize = 8;

// ── Construction options ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LoaderOptions {
    /// Slot table size; defaults to `min(host_cpu_count, MAX_SLOTS)`.
    pub slot_count: Option<usize>,
    pub idle_timeout: Duration,
    /// Directory holding the per-slot runner sockets.
    pub socket_dir: PathBuf,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            slot_count: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            socket_dir: std::env::temp_dir().join("kiln-runners"),
        }
    }
}

// ── State ─────────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct RunnerInfo {
    slot: usize,
    /// The tag the client used, preserved for `/ps` and logs.
    model_ref: String,
}

#[derive(Clone, Copy)]
struct IdleStamp {
    at: Instant,
    wall: DateTime<Utc>,
}

impl IdleStamp {
    fn now() -> Self {
        Self {
            at: Instant::now(),
            wall: Utc::now(),
        }
    }
}

struct LoaderState {
    loads_enabled: bool,
    runners: HashMap<RunnerKey, RunnerInfo>,
    slots: Vec<Option<Arc<Runner>>>,
    references: Vec<usize>,
    allocations: Vec<RequiredMemory>,
    /// Wall-clock release times; only meaningful while `references[i] == 0`.
    timestamps: Vec<Option<IdleStamp>>,
    available: RequiredMemory,
    configs: HashMap<RunnerKey, BackendConfig>,
    /// In-flight startups: key → reserved slot.  The slot and its
    /// `allocations` entry are earmarked until the start commits or rolls
    /// back.
    starting: HashMap<RunnerKey, usize>,
    /// One single-slot channel per blocked acquire; broadcast never blocks.
    waiters: Vec<mpsc::Sender<()>>,
}

impl LoaderState {
    fn free_slot(&self) -> Option<usize> {
        (0..self.slots.len())
            .find(|&slot| self.slots[slot].is_none() && !self.slot_reserved(slot))
    }

    fn slot_reserved(&self, slot: usize) -> bool {
        self.starting.values().any(|&reserved| reserved == slot)
    }
}

// ── Loader ────────────────────────────────────────────────────────────────────

pub struct Loader {
    backends: Arc<HashMap<String, Arc<dyn Backend>>>,
    memory: Arc<dyn SystemMemoryInfo>,
    total: RequiredMemory,
    idle_timeout: Duration,
    socket_dir: PathBuf,
    state: Mutex<LoaderState>,
    idle_check_tx: mpsc::Sender<()>,
    idle_check_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl Loader {
    pub fn new(
        backends: Arc<HashMap<String, Arc<dyn Backend>>>,
        memory: Arc<dyn SystemMemoryInfo>,
        options: LoaderOptions,
    ) -> Self {
        let slot_count = options
            .slot_count
            .unwrap_or_else(sysmem::host_slot_count)
            .clamp(1, MAX_SLOTS);
        let total = memory.total_memory();
        if total.has_unknown() {
            warn!(%total, "host memory partially unknown; affected axes admit one runner at a time");
        }
        if let Err(err) = std::fs::create_dir_all(&options.socket_dir) {
            warn!(dir = %options.socket_dir.display(), error = %err, "cannot create socket directory");
        }
        let (idle_check_tx, idle_check_rx) = mpsc::channel(1);
        Loader {
            backends,
            memory,
            total,
            idle_timeout: options.idle_timeout,
            socket_dir: options.socket_dir,
            state: Mutex::new(LoaderState {
                loads_enabled: false,
                runners: HashMap::new(),
                slots: vec![None; slot_count],
                references: vec![0; slot_count],
                allocations: vec![RequiredMemory::ZERO; slot_count],
                timestamps: vec![None; slot_count],
                available: total,
                configs: HashMap::new(),
                starting: HashMap::new(),
                waiters: Vec::new(),
            }),
            idle_check_tx,
            idle_check_rx: std::sync::Mutex::new(Some(idle_check_rx)),
        }
    }

    async fn lock_cancellable(
        &self,
        cancel: &CancellationToken,
    ) -> Result<MutexGuard<'_, LoaderState>, SchedulerError> {
        tokio::select! {
            guard = self.state.lock() => Ok(guard),
            _ = cancel.cancelled() => Err(SchedulerError::Cancelled),
        }
    }

    /// Wake every registered waiter; pending signals coalesce.
    fn notify_waiters(state: &mut LoaderState) {
        state.waiters.retain(|waiter| match waiter.try_send(()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(())) => true,
            Err(mpsc::error::TrySendError::Closed(())) => false,
        });
    }

    // ── Acquire ──────────────────────────────────────────────────────────────

    /// Admit a runner for (backend, model, mode), starting a child process
    /// if none is live, and return a lease holding one reference.
    pub async fn acquire(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        backend_name: &str,
        model_id: &str,
        model_ref: &str,
        mode: BackendMode,
    ) -> Result<RunnerLease, SchedulerError> {
        let backend = self
            .backends
            .get(backend_name)
            .cloned()
            .ok_or_else(|| SchedulerError::BackendNotFound(backend_name.to_owned()))?;
        let key = RunnerKey::new(backend_name, model_id, mode);

        let config = {
            let state = self.lock_cancellable(cancel).await?;
            state.configs.get(&key).cloned()
        };

        let required = match backend.required_memory(model_id, config.as_ref()).await {
            Ok(required) => required,
            Err(BackendError::GgufParse(reason)) => {
                warn!(runner = %key, %reason, "cannot estimate model memory; scheduling without a reservation");
                RequiredMemory::ZERO
            }
            Err(err) => return Err(SchedulerError::Internal(err.to_string())),
        };
        if required.has_unknown() {
            warn!(runner = %key, "model memory unknown; runner will occupy its memory axis exclusively");
        }
        match self.memory.have_sufficient_memory(&required) {
            Ok(true) => {}
            Ok(false) => {
                return Err(SchedulerError::ModelTooBig(format!(
                    "{key} needs {required}, host has {}",
                    self.total
                )))
            }
            Err(err) => return Err(SchedulerError::Internal(err.to_string())),
        }
        // An unknown requirement fills its axis, admitting one such runner
        // at a time.
        let needed = required.resolved_against(&self.total);

        let mut state = self.lock_cancellable(cancel).await?;
        loop {
            if !state.loads_enabled {
                return Err(SchedulerError::LoadsDisabled);
            }

            if let Some(slot) = state.runners.get(&key).map(|info| info.slot) {
                if let Some(runner) = state.slots[slot].clone() {
                    if !runner.is_defunct() {
                        state.references[slot] += 1;
                        state.timestamps[slot] = None;
                        debug!(runner = %key, slot, references = state.references[slot], "joined live runner");
                        return Ok(RunnerLease::new(runner, Arc::clone(self)));
                    }
                    if state.references[slot] == 0 {
                        self.evict_key(&mut state, &key).await;
                        Self::notify_waiters(&mut state);
                        continue;
                    }
                    // Defunct but still referenced: wait for the holders to
                    // release, then reclaim on a later pass.
                }
            } else if !state.starting.contains_key(&key) {
                if state.free_slot().is_none() || !state.available.covers(&needed) {
                    self.evict_unused(&mut state, false).await;
                }
                if let Some(slot) = state.free_slot() {
                    if state.available.covers(&needed) {
                        return self
                            .admit(
                                state,
                                Arc::clone(&backend),
                                key.clone(),
                                model_ref,
                                slot,
                                needed,
                                cancel,
                            )
                            .await;
                    }
                }
            }
            // A start for this key is already in flight, or no capacity:
            // wait for the state to change.

            let (waiter_tx, mut waiter_rx) = mpsc::channel(1);
            state.waiters.push(waiter_tx);
            drop(state);
            tokio::select! {
                _ = waiter_rx.recv() => {}
                _ = cancel.cancelled() => return Err(SchedulerError::Cancelled),
            }
            state = self.lock_cancellable(cancel).await?;
        }
    }

    /// Reserve `slot` for `key`, start the child with the critical section
    /// released, then commit or roll back under a fresh lock.
    ///
    /// The `starting` marker keeps same-key acquires parked and the slot
    /// out of `free_slot`, so the lock is not needed while the child boots.
    #[allow(clippy::too_many_arguments)]
    async fn admit(
        self: &Arc<Self>,
        mut state: MutexGuard<'_, LoaderState>,
        backend: Arc<dyn Backend>,
        key: RunnerKey,
        model_ref: &str,
        slot: usize,
        needed: RequiredMemory,
        cancel: &CancellationToken,
    ) -> Result<RunnerLease, SchedulerError> {
        state.starting.insert(key.clone(), slot);
        state.allocations[slot] = needed;
        state.available = state.available.minus(&needed);
        state.timestamps[slot] = None;
        let config = state.configs.get(&key).cloned();
        drop(state);

        info!(runner = %key, slot, memory = %needed, "starting runner");
        let runner = Runner::start(
            &self.socket_dir,
            backend,
            key.clone(),
            model_ref.to_owned(),
            slot,
            config,
        );
        // If this future is dropped mid-wait (client disconnect), the child
        // must not outlive the admission attempt and the reservation must
        // not leak.
        let mut abort = StartupAbort {
            loader: Some(Arc::clone(self)),
            runner: Arc::clone(&runner),
            key: key.clone(),
            slot,
        };

        match runner.wait(cancel).await {
            Ok(()) => {
                let mut state = self.state.lock().await;
                abort.loader = None;
                if !state.loads_enabled {
                    // Shutdown won the race; the drain is waiting on this
                    // reservation.
                    Self::rollback_start(&mut state, &key, slot);
                    Self::notify_waiters(&mut state);
                    drop(state);
                    runner.terminate().await;
                    return Err(SchedulerError::LoadsDisabled);
                }
                state.starting.remove(&key);
                state.slots[slot] = Some(Arc::clone(&runner));
                state.references[slot] = 1;
                state.timestamps[slot] = None;
                state.runners.insert(
                    key.clone(),
                    RunnerInfo {
                        slot,
                        model_ref: model_ref.to_owned(),
                    },
                );
                Self::notify_waiters(&mut state);
                info!(runner = %key, slot, "runner ready");
                Ok(RunnerLease::new(runner, Arc::clone(self)))
            }
            Err(err) => {
                warn!(runner = %key, slot, error = %err, "runner failed to start");
                runner.terminate().await;
                let mut state = self.state.lock().await;
                abort.loader = None;
                Self::rollback_start(&mut state, &key, slot);
                Self::notify_waiters(&mut state);
                Err(err)
            }
        }
    }

    /// Undo a provisional startup reservation.
    fn rollback_start(state: &mut LoaderState, key: &RunnerKey, slot: usize) {
        if state.starting.remove(key).is_some() {
            state.available = state.available.plus(&state.allocations[slot]);
            state.allocations[slot] = RequiredMemory::ZERO;
            state.timestamps[slot] = None;
        }
    }

    // ── Release ──────────────────────────────────────────────────────────────

    /// Drop one reference; called by [`RunnerLease`] on drop.
    pub(crate) async fn release(&self, runner: &Arc<Runner>) {
        // Release is not cancellable: a lost decrement would pin the runner
        // forever.
        let mut state = self.state.lock().await;
        let slot = runner.slot();
        let held = matches!(&state.slots[slot], Some(current) if Arc::ptr_eq(current, runner));
        if !held {
            // Already evicted (drain or unload raced the lease drop).
            return;
        }
        state.references[slot] = state.references[slot].saturating_sub(1);
        debug!(runner = %runner.key(), slot, references = state.references[slot], "released");
        if state.references[slot] == 0 {
            if runner.is_defunct() {
                let key = runner.key().clone();
                self.evict_key(&mut state, &key).await;
            } else {
                state.timestamps[slot] = Some(IdleStamp::now());
                let _ = self.idle_check_tx.try_send(());
            }
        }
        Self::notify_waiters(&mut state);
    }

    // ── Eviction ─────────────────────────────────────────────────────────────

    /// Evict unused runners.  With `idle_only`, only runners idle past the
    /// TTL or already defunct go; otherwise every unused runner goes.
    async fn evict_unused(&self, state: &mut LoaderState, idle_only: bool) -> usize {
        let victims: Vec<RunnerKey> = state
            .runners
            .iter()
            .filter(|(_, info)| {
                let slot = info.slot;
                if state.references[slot] != 0 {
                    return false;
                }
                if !idle_only {
                    return true;
                }
                let defunct = state.slots[slot]
                    .as_ref()
                    .is_some_and(|runner| runner.is_defunct());
                let expired = state.timestamps[slot]
                    .is_some_and(|stamp| stamp.at.elapsed() >= self.idle_timeout);
                defunct || expired
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in &victims {
            self.evict_key(state, key).await;
        }
        victims.len()
    }

    /// Tear down one runner and return its slot and memory to the pool.
    async fn evict_key(&self, state: &mut LoaderState, key: &RunnerKey) {
        let Some(info) = state.runners.remove(key) else {
            return;
        };
        let slot = info.slot;
        if let Some(runner) = state.slots[slot].take() {
            runner.terminate().await;
        }
        state.references[slot] = 0;
        state.available = state.available.plus(&state.allocations[slot]);
        state.allocations[slot] = RequiredMemory::ZERO;
        state.timestamps[slot] = None;
        info!(runner = %key, slot, "evicted runner");
    }

    /// Evict every unused runner and drop every stored configuration.
    pub async fn unload_all(&self) -> usize {
        let mut state = self.state.lock().await;
        state.configs.clear();
        let evicted = self.evict_unused(&mut state, false).await;
        Self::notify_waiters(&mut state);
        evicted
    }

    /// Evict the runners of one model (both modes) and drop its stored
    /// configurations; `backend` narrows the sweep when given.
    pub async fn unload_model(&self, backend: Option<&str>, model_id: &str) -> usize {
        let mut state = self.state.lock().await;
        let matches_key = |key: &RunnerKey| {
            key.model_id == model_id && backend.is_none_or(|name| key.backend == name)
        };
        state.configs.retain(|key, _| !matches_key(key));

        let victims: Vec<RunnerKey> = state
            .runners
            .iter()
            .filter(|(key, info)| matches_key(key) && state.references[info.slot] == 0)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &victims {
            self.evict_key(&mut state, key).await;
        }
        Self::notify_waiters(&mut state);
        victims.len()
    }

    // ── Configuration ────────────────────────────────────────────────────────

    /// Store the startup configuration for a key.  A live unused runner is
    /// evicted so the next acquire picks the new configuration up; a runner
    /// still serving requests rejects the change.
    pub async fn set_runner_config(
        &self,
        backend_name: &str,
        model_id: &str,
        mode: BackendMode,
        config: BackendConfig,
    ) -> Result<(), SchedulerError> {
        let key = RunnerKey::new(backend_name, model_id, mode);
        let mut state = self.state.lock().await;
        if state.configs.get(&key) == Some(&config) {
            return Ok(());
        }
        if state.starting.contains_key(&key) {
            // The runner booting right now was launched with the old
            // configuration.
            return Err(SchedulerError::RunnerAlreadyActive(key.to_string()));
        }
        if let Some(slot) = state.runners.get(&key).map(|info| info.slot) {
            if state.references[slot] != 0 {
                return Err(SchedulerError::RunnerAlreadyActive(key.to_string()));
            }
            self.evict_key(&mut state, &key).await;
            Self::notify_waiters(&mut state);
        }
        info!(runner = %key, "runner configuration updated");
        state.configs.insert(key, config);
        Ok(())
    }

    // ── Observability ────────────────────────────────────────────────────────

    /// Snapshot of every live runner, for `GET /ps`.
    pub async fn running(&self) -> Vec<RunnerState> {
        let state = self.state.lock().await;
        state
            .runners
            .iter()
            .map(|(key, info)| RunnerState {
                backend_name: key.backend.clone(),
                model_name: info.model_ref.clone(),
                mode: key.mode,
                last_used: if state.references[info.slot] == 0 {
                    state.timestamps[info.slot].map(|stamp| stamp.wall)
                } else {
                    None
                },
            })
            .collect()
    }

    // ── Run loop ─────────────────────────────────────────────────────────────

    fn next_idle_deadline(&self, state: &LoaderState) -> Option<tokio::time::Instant> {
        state
            .timestamps
            .iter()
            .flatten()
            .map(|stamp| stamp.at)
            .min()
            .map(|oldest| tokio::time::Instant::from_std(oldest + self.idle_timeout + IDLE_SLACK))
    }

    async fn sleep_until(deadline: Option<tokio::time::Instant>) {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    /// Enable loads, evict idle runners until cancelled, then drain.
    ///
    /// After this returns the runner map is empty and every byte of the
    /// budget is back in `available`.
    pub async fn run(&self, cancel: CancellationToken) {
        let Some(mut idle_check_rx) = self
            .idle_check_rx
            .lock()
            .ok()
            .and_then(|mut guard| guard.take())
        else {
            warn!("loader run loop started twice; ignoring");
            return;
        };

        {
            let mut state = self.state.lock().await;
            state.loads_enabled = true;
            info!(
                slots = state.slots.len(),
                memory = %self.total,
                idle_timeout = ?self.idle_timeout,
                "loader running"
            );
        }

        loop {
            let deadline = {
                let state = self.state.lock().await;
                self.next_idle_deadline(&state)
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                // A release just happened; recompute the deadline only.
                _ = idle_check_rx.recv() => {}
                _ = Self::sleep_until(deadline) => {
                    let mut state = self.state.lock().await;
                    let evicted = self.evict_unused(&mut state, true).await;
                    if evicted > 0 {
                        Self::notify_waiters(&mut state);
                    }
                }
            }
        }

        // Drain: disable loads, then keep purging until every runner and
        // every in-flight startup reservation is gone.  Referenced runners
        // finish serving first; pending starts roll themselves back once
        // they observe loads are disabled.
        let mut state = self.state.lock().await;
        state.loads_enabled = false;
        Self::notify_waiters(&mut state);
        loop {
            self.evict_unused(&mut state, false).await;
            if state.runners.is_empty() && state.starting.is_empty() {
                break;
            }
            drop(state);
            tokio::time::sleep(DRAIN_POLL).await;
            state = self.state.lock().await;
        }
        info!("loader drained");
    }

    // ── Test accessors ───────────────────────────────────────────────────────

    #[cfg(test)]
    pub(crate) async fn loads_enabled(&self) -> bool {
        self.state.lock().await.loads_enabled
    }

    #[cfg(test)]
    pub(crate) async fn runner_count(&self) -> usize {
        self.state.lock().await.runners.len()
    }

    #[cfg(test)]
    pub(crate) async fn available_memory(&self) -> RequiredMemory {
        self.state.lock().await.available
    }

    #[cfg(test)]
    pub(crate) async fn references_for(&self, key: &RunnerKey) -> Option<usize> {
        let state = self.state.lock().await;
        state
            .runners
            .get(key)
            .map(|info| state.references[info.slot])
    }
}

/// Cleans up after an admission future dropped before commit: terminates
/// the half-started child and returns the reserved slot and memory to the
/// pool.
struct StartupAbort {
    /// `Some` while armed; cleared once the admission path commits or rolls
    /// back inline.
    loader: Option<Arc<Loader>>,
    runner: Arc<Runner>,
    key: RunnerKey,
    slot: usize,
}

impl Drop for StartupAbort {
    fn drop(&mut self) {
        let Some(loader) = self.loader.take() else {
            return;
        };
        let runner = Arc::clone(&self.runner);
        let key = self.key.clone();
        let slot = self.slot;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                runner.terminate().await;
                let mut state = loader.state.lock().await;
                Loader::rollback_start(&mut state, &key, slot);
                Loader::notify_waiters(&mut state);
            });
        }
    }
}

// ── Lease ─────────────────────────────────────────────────────────────────────

/// One reference to a live runner.  Dropping the lease releases the
/// reference, whether the request completed or the client vanished.
pub struct RunnerLease {
    runner: Arc<Runner>,
    loader: Arc<Loader>,
}

impl std::fmt::Debug for RunnerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerLease").finish()
    }
}

impl RunnerLease {
    fn new(runner: Arc<Runner>, loader: Arc<Loader>) -> Self {
        Self { runner, loader }
    }

    pub fn runner(&self) -> &Arc<Runner> {
        &self.runner
    }
}

impl Deref for RunnerLease {
    type Target = Runner;

    fn deref(&self) -> &Runner {
        &self.runner
    }
}

impl Drop for RunnerLease {
    fn drop(&mut self) {
        let runner = Arc::clone(&self.runner);
        let loader = Arc::clone(&self.loader);
        // Release must run to completion even though drop cannot await.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { loader.release(&runner).await });
        }
    }
}

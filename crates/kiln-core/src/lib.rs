//! kiln-core – the scheduling core of the kiln inference service.
//!
//! The [`scheduler::Scheduler`] admits OpenAI-compatible requests, the
//! [`installer::Installer`] provisions backends exactly once, and the
//! [`loader::Loader`] gates runner admission with slot and memory
//! accounting.  Inference engines, model storage, and memory probing are
//! consumed through the traits in [`backend`].

pub mod backend;
pub mod error;
pub mod installer;
pub mod loader;
pub mod runner;
pub mod scheduler;
pub mod sysmem;

#[cfg(test)]
mod tests;

pub use backend::{Backend, BackendError, Model, ModelError, ModelManager, SystemMemoryInfo};
pub use error::{SchedulerError, MAX_REQUEST_BODY_BYTES};
pub use installer::Installer;
pub use loader::{Loader, LoaderOptions, RunnerLease, DEFAULT_IDLE_TIMEOUT, MAX_SLOTS};
pub use runner::Runner;
pub use scheduler::Scheduler;
pub use sysmem::SysinfoMemory;

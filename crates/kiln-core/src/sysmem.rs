//! Host probing via sysinfo: total memory for the loader budget and the CPU
//! count that sizes the slot table.
//!
//! VRAM is reported as unknown here; a GPU-aware probe can replace this
//! implementation through the [`SystemMemoryInfo`] seam.

use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

use kiln_types::RequiredMemory;

use crate::backend::SystemMemoryInfo;
use crate::loader::MAX_SLOTS;

/// sysinfo-backed [`SystemMemoryInfo`].
pub struct SysinfoMemory {
    total: RequiredMemory,
}

impl SysinfoMemory {
    /// Probe the host once; the total does not change over process lifetime.
    pub fn probe() -> Self {
        let sys = System::new_with_specifics(
            RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()),
        );
        let ram = match sys.total_memory() {
            0 => RequiredMemory::UNKNOWN,
            bytes => bytes,
        };
        Self {
            total: RequiredMemory::new(ram, RequiredMemory::UNKNOWN),
        }
    }
}

impl SystemMemoryInfo for SysinfoMemory {
    fn total_memory(&self) -> RequiredMemory {
        self.total
    }

    fn have_sufficient_memory(&self, required: &RequiredMemory) -> anyhow::Result<bool> {
        Ok(!self.total.exceeded_by(required))
    }
}

/// Slot table size for this host: `min(cpu_count, MAX_SLOTS)`.
pub fn host_slot_count() -> usize {
    let sys = System::new_with_specifics(
        RefreshKind::nothing().with_cpu(CpuRefreshKind::everything()),
    );
    let cpus = sys.cpus().len().max(1);
    cpus.min(MAX_SLOTS)
}

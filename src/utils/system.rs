// src/utils/system.rs: System functions

use anyhow::{anyhow, Result};
use sysinfo::{MemoryRefreshKind, RefreshKind, System};


/// Threads and memory handed to the external tools through the
/// `{threads}` and `{memory_mb}` template placeholders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceAllocation {
    pub threads: usize,
    pub memory_mb: u64,
    /// Upper bound for `memory_mb` when a stage is retried with more memory.
    pub memory_cap_mb: u64,
}

impl Default for ResourceAllocation {
    fn default() -> Self {
        Self {
            threads: 1,
            memory_mb: 2048,
            memory_cap_mb: 4096,
        }
    }
}

impl ResourceAllocation {
    /// Sizes the allocation from the host: all physical cores (bounded by
    /// `max_threads`) and half of the available RAM, capped at total RAM.
    ///
    /// # Arguments
    ///
    /// * `max_threads` - Upper bound on threads, from the command line.
    ///
    /// # Returns
    /// ResourceAllocation for the first attempt of every stage.
    pub fn detect(max_threads: usize) -> Result<Self> {
        let threads = detect_cores(max_threads);
        let (total_ram, available_ram) = detect_ram()?;
        Ok(Self {
            threads,
            memory_mb: (available_ram / 2 / 1_048_576).max(1),
            memory_cap_mb: (total_ram / 1_048_576).max(1),
        })
    }

    /// Doubles memory for a retry after resource exhaustion, never beyond the cap.
    pub fn escalated(&self) -> Self {
        Self {
            memory_mb: self.memory_mb.saturating_mul(2).min(self.memory_cap_mb),
            ..*self
        }
    }
}


/// Determines number of cores that can be used for the external tools
///
/// # Arguments
///
/// * `max_threads` - Maximum threads allowed from args.
///
/// # Returns
///
/// usize number of usable cores, at least 1
pub fn detect_cores(max_threads: usize) -> usize {
    let physical_cores = System::physical_core_count().unwrap_or(1);
    physical_cores.min(max_threads).max(1)
}


/// Finds the amount of total and available RAM, keyed to OS
///
/// # Returns
///
/// Result<u64, u64> total ram, available ram (bytes)
pub fn detect_ram() -> Result<(u64, u64)> {
    let refresh_kind = RefreshKind::nothing().with_memory(MemoryRefreshKind::everything());
    let mut system = System::new_with_specifics(refresh_kind);
    system.refresh_memory_specifics(MemoryRefreshKind::everything());

    let total_ram = system.total_memory();
    let available_ram = if cfg!(target_os = "macos") {
        total_ram.saturating_sub(system.used_memory())
    } else {
        system.available_memory()
    };

    if total_ram == 0 || available_ram == 0 {
        return Err(anyhow!("Failed to detect valid RAM values"));
    }

    Ok((total_ram, available_ram))
}

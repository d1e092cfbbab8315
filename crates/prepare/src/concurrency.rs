//! Concurrency planning for the build pipeline
//!
//! Derives how many files are prepared at the same time from the CPU core
//! count, the size of the tree and configuration.

use crate::config::Config;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub logical_cores: u32,
    /// Number of files discovered in the target tree
    pub file_count: usize,
    /// Maximum number of files prepared concurrently
    pub max_concurrent_files: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan, detecting cores via num_cpus
    pub fn derive(cfg: &Config, file_count: usize) -> Self {
        Self::with_cores(cfg, file_count, num_cpus::get() as u32)
    }

    /// Derive a concurrency plan for a known core count
    ///
    /// Uses the following rules:
    /// - An explicit non-zero `max_concurrent_files` is used unchanged
    /// - Otherwise two files per core (each file keeps several encoders busy
    ///   but spends time waiting on disk), capped at the file count
    /// - Never less than one
    pub fn with_cores(cfg: &Config, file_count: usize, logical_cores: u32) -> Self {
        let logical_cores = logical_cores.max(1);

        let max_concurrent_files = if cfg.build.max_concurrent_files > 0 {
            cfg.build.max_concurrent_files
        } else {
            derive_max_files(logical_cores, file_count)
        };

        Self {
            logical_cores,
            file_count,
            max_concurrent_files,
        }
    }

    /// Permits for the file semaphore
    pub fn permits(&self) -> usize {
        self.max_concurrent_files.max(1) as usize
    }
}

fn derive_max_files(cores: u32, file_count: usize) -> u32 {
    let by_cores = cores.saturating_mul(2);
    let by_files = u32::try_from(file_count).unwrap_or(u32::MAX);
    by_cores.min(by_files).max(1)
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config, file_count: usize) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg, file_count)
}

//! Auto-tuning module
//!
//! Detects hardware capabilities and sizes the replica thread pools for
//! pools configured with `threads = 0`.

use sysinfo::System;

/// Thread counts derived from the detected hardware
#[derive(Debug, Clone)]
pub struct TunedConfig {
    /// Replica threads for the intra-colo pool
    pub intra_colo_threads: usize,
    /// Replica threads for the inter-colo pool
    pub inter_colo_threads: usize,
    /// Detected CPU cores
    pub detected_cores: usize,
    /// Detected RAM in MB
    pub detected_ram_mb: u64,
}

impl Default for TunedConfig {
    fn default() -> Self {
        Self::for_cores(4, 8192)
    }
}

impl TunedConfig {
    /// Allocation strategy:
    /// - intra-colo gets half the cores (min 1, max 16)
    /// - inter-colo gets a quarter (min 1, max 8); those peers are slow
    ///   and mostly wait on the network
    pub fn for_cores(cores: usize, ram_mb: u64) -> Self {
        Self {
            intra_colo_threads: (cores / 2).clamp(1, 16),
            inter_colo_threads: (cores / 4).clamp(1, 8),
            detected_cores: cores,
            detected_ram_mb: ram_mb,
        }
    }
}

/// Detect the number of available CPU cores
pub fn detect_cpu_cores() -> usize {
    let sys = System::new_all();
    sys.cpus().len().max(1)
}

/// Detect total RAM in megabytes
pub fn detect_ram_mb() -> u64 {
    let sys = System::new_all();
    sys.total_memory() / 1024 / 1024
}

/// Auto-tune thread counts based on detected hardware
pub fn auto_tune() -> TunedConfig {
    let config = TunedConfig::for_cores(detect_cpu_cores(), detect_ram_mb());

    tracing::info!(
        cores = config.detected_cores,
        ram_mb = config.detected_ram_mb,
        intra_colo_threads = config.intra_colo_threads,
        inter_colo_threads = config.inter_colo_threads,
        "Auto-tuned replica thread pools based on hardware"
    );

    config
}

/// Get a human-readable summary of the tuned configuration
pub fn tuning_summary(config: &TunedConfig) -> String {
    format!(
        "Detected: {} cores, {} MB RAM\n\
         Replica threads: {} intra-colo, {} inter-colo",
        config.detected_cores,
        config.detected_ram_mb,
        config.intra_colo_threads,
        config.inter_colo_threads,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_counts() {
        let small = TunedConfig::for_cores(1, 1024);
        assert_eq!(small.intra_colo_threads, 1);
        assert_eq!(small.inter_colo_threads, 1);

        let medium = TunedConfig::for_cores(16, 65536);
        assert_eq!(medium.intra_colo_threads, 8);
        assert_eq!(medium.inter_colo_threads, 4);

        let large = TunedConfig::for_cores(128, 1 << 20);
        assert_eq!(large.intra_colo_threads, 16);
        assert_eq!(large.inter_colo_threads, 8);
    }

    #[test]
    fn test_summary() {
        let summary = tuning_summary(&TunedConfig::for_cores(8, 16384));
        assert!(summary.contains("8 cores"));
        assert!(summary.contains("4 intra-colo, 2 inter-colo"));
    }
}

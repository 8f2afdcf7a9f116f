use serde::{Deserialize, Serialize};
use sysinfo::System;

use super::device_count;

/// Host hardware as seen by one rank.
///
/// Detected at runtime using the `sysinfo` crate. `host_name` doubles as the
/// node id ranks compare to decide whether shared memory is reachable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostCapabilities {
    pub host_name: String,

    /// Number of logical CPUs
    pub cpu_cores: usize,

    /// Total RAM in bytes
    pub ram_bytes: u64,

    /// Accelerator devices visible to this process
    pub device_count: usize,

    pub os: String,
    pub arch: String,
}

impl HostCapabilities {
    /// Detect current host capabilities.
    ///
    /// A failing device query is reported as zero devices here; call
    /// [`device_count`] directly to see the error.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let device_count = match device_count() {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(error = %e, "Device query failed");
                0
            }
        };

        Self {
            host_name: Self::node_id(),
            cpu_cores: sys.cpus().len(),
            ram_bytes: sys.total_memory(),
            device_count,
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }

    /// Node id of this host
    pub fn node_id() -> String {
        System::host_name().unwrap_or_else(|| "localhost".to_string())
    }
}

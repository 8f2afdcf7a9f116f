//! Accelerator device discovery and host capability detection.

pub mod capabilities;

use std::path::Path;

pub use capabilities::HostCapabilities;

use crate::errors::Result;

/// Directory listing one entry per NVIDIA device known to the kernel driver
pub const NVIDIA_PROC_DIR: &str = "/proc/driver/nvidia/gpus";

/// Number of accelerator devices visible to this process.
///
/// A host without the driver reports zero devices; any other discovery failure is
/// returned as an error rather than aborting the process.
pub fn device_count() -> Result<usize> {
    device_count_in(Path::new(NVIDIA_PROC_DIR))
}

/// Count device entries under `dir`.
pub fn device_count_in(dir: &Path) -> Result<usize> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut count = 0;
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            count += 1;
        }
    }

    tracing::debug!(dir = %dir.display(), count, "Counted accelerator devices");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_driver_means_zero_devices() {
        let dir = TempDir::new().unwrap();
        assert_eq!(device_count_in(&dir.path().join("absent")).unwrap(), 0);
    }

    #[test]
    fn test_counts_device_directories() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("0000:3b:00.0")).unwrap();
        std::fs::create_dir(dir.path().join("0000:af:00.0")).unwrap();
        std::fs::write(dir.path().join("README"), b"not a device").unwrap();

        assert_eq!(device_count_in(dir.path()).unwrap(), 2);
    }

    #[test]
    fn test_device_count_on_this_host() {
        assert!(device_count().is_ok());
    }
}

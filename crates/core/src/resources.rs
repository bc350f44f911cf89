use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Resources requested for a VM.
///
/// All fields are optional on the wire; absent fields take the documented
/// defaults (2 cores, 2048 MiB memory, 10 GiB storage, unbounded runtime).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runtime_seconds: Option<u64>,
}

impl ResourceRequirements {
    pub const DEFAULT_CPU_CORES: u32 = 2;
    pub const DEFAULT_MEMORY_MB: u64 = 2048;
    pub const DEFAULT_STORAGE_MB: u64 = 10 * 1024;

    pub fn cpu_cores(&self) -> u32 {
        self.cpu_cores.unwrap_or(Self::DEFAULT_CPU_CORES)
    }

    pub fn memory_mb(&self) -> u64 {
        self.memory_mb.unwrap_or(Self::DEFAULT_MEMORY_MB)
    }

    pub fn storage_mb(&self) -> u64 {
        self.storage_mb.unwrap_or(Self::DEFAULT_STORAGE_MB)
    }

    /// Requested runtime cap, if any. `None` means unbounded.
    pub fn max_runtime(&self) -> Option<Duration> {
        self.max_runtime_seconds.map(Duration::from_secs)
    }
}

//! Types that mirror the host's JSON schema, plus the per-facet fetch state.

use serde::{Deserialize, Serialize};

/// Cumulative CPU counters since host boot, in USER_HZ ticks. The host omits
/// counters it could not read.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(default)]
pub struct CpuStats {
    pub user_norm: u64,
    pub user_nice: u64,
    pub kernel: u64,
    pub idle: u64,
    #[serde(rename = "iowait")]
    pub io_wait: u64,
    pub irq: u64,
    pub soft_irq: u64,
}

impl CpuStats {
    pub fn total(&self) -> u64 {
        self.user_norm
            .saturating_add(self.user_nice)
            .saturating_add(self.kernel)
            .saturating_add(self.idle)
            .saturating_add(self.io_wait)
            .saturating_add(self.irq)
            .saturating_add(self.soft_irq)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CoreStats {
    pub core_id: u32,
    #[serde(flatten)]
    pub stats: CpuStats,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CpuUsage {
    pub full: CpuStats,
    #[serde(default)]
    pub cores: Vec<CoreStats>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CpuResponse {
    #[serde(default)]
    pub cpu_temperature: Option<f32>,
    pub cpu_usage: CpuUsage,
}

// kB, straight from /proc/meminfo
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(default)]
pub struct MemoryResponse {
    pub total: u64,
    pub available: u64,
    pub free: u64,
}

// memory and swap in kB, utime in clock ticks
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub state_code: String,
    pub state_description: String,
    pub user: String,
    pub group: String,
    pub memory_rss: u64,
    pub memory_virt: u64,
    pub swap: u64,
    pub threads: u32,
    pub utime: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
pub struct ProcessList {
    pub processes: Vec<ProcessInfo>,
}

impl ProcessList {
    pub fn contains(&self, pid: u32) -> bool {
        self.processes.iter().any(|p| p.pid == pid)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
pub struct ExternalTemperature {
    pub temperature: f32,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct KillRequest {
    pub pid: u32,
}

/// Fetch lifecycle of one value.
#[derive(Debug, Clone, PartialEq)]
pub enum Resource<T> {
    Loading,
    Success(T),
    Error(String),
}

impl<T> Resource<T> {
    pub fn is_loading(&self) -> bool {
        matches!(self, Resource::Loading)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Resource::Error(_))
    }

    pub fn success(&self) -> Option<&T> {
        match self {
            Resource::Success(v) => Some(v),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Resource::Error(m) => Some(m),
            _ => None,
        }
    }
}

impl<T> Default for Resource<T> {
    fn default() -> Self {
        Resource::Loading
    }
}

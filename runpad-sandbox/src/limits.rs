//! Resource limits configuration for supervised processes

use serde::{Deserialize, Serialize};
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Resource limits for one supervised process tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Wall-clock limit before the process tree is terminated
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Time between SIGTERM and SIGKILL when terminating
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,

    /// CPU time limit (RLIMIT_CPU)
    #[serde(with = "humantime_serde")]
    pub max_cpu_time: Option<Duration>,

    /// Address space limit in bytes (RLIMIT_AS)
    pub max_memory_bytes: Option<u64>,

    /// Largest file the process may write (RLIMIT_FSIZE)
    pub max_file_size_bytes: Option<u64>,

    /// Process count limit for the user (RLIMIT_NPROC)
    pub max_processes: Option<u64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            grace_period: Self::default_grace(),
            max_cpu_time: None,
            max_memory_bytes: None,
            max_file_size_bytes: Some(256 * MIB),
            max_processes: None,
        }
    }
}

impl ResourceLimits {
    fn default_grace() -> Duration {
        Duration::from_secs(2)
    }

    /// Limits applied to the dependency installer
    ///
    /// Package resolution can stall indefinitely, so the deadline is hard
    /// even though it is longer than a program run. Memory, file size and
    /// process count are capped so a runaway build cannot exhaust the host.
    pub fn installer() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            grace_period: Duration::from_secs(5),
            max_cpu_time: None,
            max_memory_bytes: Some(4096 * MIB),
            max_file_size_bytes: Some(512 * MIB),
            max_processes: Some(2048),
        }
    }

    /// Create strict limits for untrusted code
    pub fn strict() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            grace_period: Duration::from_secs(1),
            max_cpu_time: Some(Duration::from_secs(5)),
            max_memory_bytes: Some(512 * MIB),
            max_file_size_bytes: Some(16 * MIB),
            max_processes: Some(64),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Effective deadline for a request that asked for `requested`
    ///
    /// Requests may shorten the configured timeout but never extend it.
    pub fn clamp_timeout(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(requested) if !requested.is_zero() => requested.min(self.timeout),
            _ => self.timeout,
        }
    }

    /// rlimits to install in the child before exec
    #[cfg(unix)]
    pub(crate) fn rlimits(&self) -> Vec<(nix::sys::resource::Resource, u64)> {
        use nix::sys::resource::Resource;

        let mut limits = Vec::new();
        if let Some(cpu) = self.max_cpu_time {
            limits.push((Resource::RLIMIT_CPU, cpu.as_secs().max(1)));
        }
        if let Some(bytes) = self.max_memory_bytes {
            limits.push((Resource::RLIMIT_AS, bytes));
        }
        if let Some(bytes) = self.max_file_size_bytes {
            limits.push((Resource::RLIMIT_FSIZE, bytes));
        }
        if let Some(count) = self.max_processes {
            limits.push((Resource::RLIMIT_NPROC, count));
        }
        limits
    }
}

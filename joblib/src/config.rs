//! Per-job configuration: resource limits and isolation toggles.

use std::path::PathBuf;

/// Server-side defaults for the per-job knobs.
pub mod defaults {
    /// 16 MiB expressed in KiB.
    pub const MEMORY_KIB: u64 = 16 * 1024;
    /// 10% of one CPU: 100ms of quota per 1000ms period.
    pub const CPU_QUOTA_MS: u64 = 100;
    pub const CPU_PERIOD_MS: u64 = 1000;
    /// 4 MiB/s reads, 1 MiB/s writes against the probed device.
    pub const IO_RBPS: u64 = 4 * 1024 * 1024;
    pub const IO_WBPS: u64 = 1024 * 1024;
}

/// Read/write bandwidth cap bound to one block device.
#[derive(Clone, Copy, Debug)]
pub struct IoLimit {
    pub major: u32,
    pub minor: u32,
    pub rbps: u64,
    pub wbps: u64,
}

/// Cgroup v2 knobs for one job. A zero quota, period, or size means the
/// corresponding knob is left unset.
#[derive(Clone, Copy, Debug, Default)]
pub struct ResourceLimits {
    pub cpu_quota_ms: u64,
    pub cpu_period_ms: u64,
    pub memory_kib: u64,
    pub io: Option<IoLimit>,
}

impl ResourceLimits {
    /// True when no knob is set at all, in which case no cgroup is created
    /// for the job.
    pub fn is_unlimited(&self) -> bool {
        self.cpu_quota_ms == 0
            && self.cpu_period_ms == 0
            && self.memory_kib == 0
            && self
                .io
                .map(|io| io.rbps == 0 && io.wbps == 0)
                .unwrap_or(true)
    }
}

/// Everything a job launch can be configured with. The default is a bare
/// child process: no limits, no new root, no namespaces.
#[derive(Clone, Debug, Default)]
pub struct JobOptions {
    pub limits: ResourceLimits,
    /// Per-job chroot roots are created under this directory, named by the
    /// job id. `None` disables the new root (and the mount namespace).
    pub root_base: Option<PathBuf>,
    pub isolate_pid: bool,
    pub isolate_net: bool,
}

//! Controller-specific operations for CPU, Cpuset, Memory and Pids

use std::fmt::Display;
use std::path::Path;

use tracing::debug;

use super::error::Result;
use super::limits::{CpuLimits, CpusetLimits, MemoryLimits, PidsLimits};
use super::utils::write_cgroup_file;

/// Destination of control file writes
pub trait ControlSink: Send + Sync {
    fn write(&self, path: &Path, value: &str) -> Result<()>;
}

/// Writes straight to the cgroup filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct FsSink;

impl ControlSink for FsSink {
    fn write(&self, path: &Path, value: &str) -> Result<()> {
        write_cgroup_file(path, value)
    }
}

/// Serialize `value` and overwrite `dir/file`
pub fn write_limit<V: Display>(
    sink: &dyn ControlSink,
    dir: &Path,
    file: &str,
    value: V,
) -> Result<()> {
    let path = dir.join(file);
    let value = value.to_string();
    debug!("write {:?} <- {}", path, value);
    sink.write(&path, &value)
}

/// CPU controller operations
pub struct CpuController;

impl CpuController {
    pub const RT_PERIOD: &'static str = "cpu.rt_period_us";
    pub const RT_RUNTIME: &'static str = "cpu.rt_runtime_us";
    pub const SHARES: &'static str = "cpu.shares";
    pub const CFS_PERIOD: &'static str = "cpu.cfs_period_us";
    pub const CFS_QUOTA: &'static str = "cpu.cfs_quota_us";

    /// Write RT period, RT runtime, shares, CFS period and CFS quota, in that order
    ///
    /// The first failing write aborts the rest.
    pub fn apply(sink: &dyn ControlSink, cgroup_path: &Path, limits: &CpuLimits) -> Result<()> {
        write_limit(sink, cgroup_path, Self::RT_PERIOD, limits.rt_period)?;
        write_limit(sink, cgroup_path, Self::RT_RUNTIME, limits.rt_runtime)?;
        write_limit(sink, cgroup_path, Self::SHARES, limits.shares)?;
        write_limit(sink, cgroup_path, Self::CFS_PERIOD, limits.cfs_period)?;
        write_limit(sink, cgroup_path, Self::CFS_QUOTA, limits.cfs_quota)?;
        Ok(())
    }
}

/// Cpuset controller operations
pub struct CpusetController;

impl CpusetController {
    pub const CPUS: &'static str = "cpuset.cpus";
    pub const MEMS: &'static str = "cpuset.mems";

    /// Lists are written verbatim
    pub fn apply(sink: &dyn ControlSink, cgroup_path: &Path, limits: &CpusetLimits) -> Result<()> {
        write_limit(sink, cgroup_path, Self::CPUS, &limits.cpus)?;
        write_limit(sink, cgroup_path, Self::MEMS, &limits.mems)?;
        Ok(())
    }
}

/// Memory controller operations
pub struct MemoryController;

impl MemoryController {
    pub const LIMIT: &'static str = "memory.limit_in_bytes";
    pub const SOFT_LIMIT: &'static str = "memory.soft_limit_in_bytes";
    pub const SWAP_LIMIT: &'static str = "memory.memsw.limit_in_bytes";
    pub const SWAPPINESS: &'static str = "memory.swappiness";

    /// Hard limit goes first: the kernel requires memsw >= limit at every step
    pub fn apply(sink: &dyn ControlSink, cgroup_path: &Path, limits: &MemoryLimits) -> Result<()> {
        write_limit(sink, cgroup_path, Self::LIMIT, limits.limit)?;
        write_limit(sink, cgroup_path, Self::SOFT_LIMIT, limits.soft_limit)?;
        write_limit(sink, cgroup_path, Self::SWAP_LIMIT, limits.swap_limit)?;
        write_limit(sink, cgroup_path, Self::SWAPPINESS, limits.swappiness)?;
        Ok(())
    }
}

/// Pids controller operations
pub struct PidsController;

impl PidsController {
    pub const MAX: &'static str = "pids.max";

    /// 0 means unlimited, which the kernel spells `max`
    pub fn apply(sink: &dyn ControlSink, cgroup_path: &Path, limits: &PidsLimits) -> Result<()> {
        match limits.max {
            0 => write_limit(sink, cgroup_path, Self::MAX, "max"),
            n => write_limit(sink, cgroup_path, Self::MAX, n),
        }
    }
}

/// Membership file present in every controller directory
pub const PROCS_FILE: &str = "cgroup.procs";

/// Move `pid` into the cgroup at `cgroup_path`
pub fn attach_pid(sink: &dyn ControlSink, cgroup_path: &Path, pid: u32) -> Result<()> {
    write_limit(sink, cgroup_path, PROCS_FILE, pid)
}

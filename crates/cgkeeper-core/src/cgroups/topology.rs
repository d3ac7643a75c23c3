//! Host CPU and NUMA node counts used to bound limit values

use std::path::Path;

use nix::sched::{sched_getaffinity, CpuSet};
use nix::unistd::Pid;
use serde::Serialize;
use sysinfo::{CpuRefreshKind, RefreshKind, System};
use tracing::warn;

use super::error::{CgroupError, Result};
use super::types::{ControllerMountPoints, Subsystem};
use super::utils::{highest_list_index, read_cgroup_file};

const CPUSET_MEMS: &str = "cpuset.mems";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HostTopology {
    cpu_count: u32,
    mem_node_count: u32,
}

impl HostTopology {
    /// Both counts are at least 1
    pub fn new(cpu_count: u32, mem_node_count: u32) -> Self {
        Self {
            cpu_count: cpu_count.max(1),
            mem_node_count: mem_node_count.max(1),
        }
    }

    /// Probe the running host
    ///
    /// NUMA nodes are counted from the cpuset hierarchy root; when that is
    /// not available a single node is assumed.
    pub fn detect(mounts: &ControllerMountPoints) -> Self {
        let mem_node_count = match mounts.root(Subsystem::Cpuset) {
            Ok(root) => mem_nodes_from_cpuset_root(root).unwrap_or_else(|e| {
                warn!("Could not count memory nodes, assuming 1: {}", e);
                1
            }),
            Err(_) => {
                warn!("cpuset hierarchy not resolved, assuming 1 memory node");
                1
            }
        };

        Self::new(logical_cpu_count(), mem_node_count)
    }

    pub fn cpu_count(&self) -> u32 {
        self.cpu_count
    }

    pub fn mem_node_count(&self) -> u32 {
        self.mem_node_count
    }
}

/// Logical CPUs this process may run on
///
/// Counts the scheduler affinity mask; every CPU of the host when the mask
/// cannot be read.
pub fn logical_cpu_count() -> u32 {
    match affinity_cpu_count() {
        Some(count) => count,
        None => {
            warn!("CPU affinity unavailable, counting all host CPUs");
            host_cpu_count()
        }
    }
}

fn affinity_cpu_count() -> Option<u32> {
    let mask = sched_getaffinity(Pid::from_raw(0)).ok()?;
    let allowed = (0..CpuSet::count())
        .filter(|&cpu| mask.is_set(cpu).unwrap_or(false))
        .count();
    u32::try_from(allowed).ok().filter(|&n| n > 0)
}

/// Logical CPUs present on the host
pub fn host_cpu_count() -> u32 {
    let sys = System::new_with_specifics(RefreshKind::new().with_cpu(CpuRefreshKind::new()));
    u32::try_from(sys.cpus().len()).unwrap_or(u32::MAX).max(1)
}

/// Read `cpuset.mems` at the hierarchy root: highest node index + 1
pub fn mem_nodes_from_cpuset_root(root: &Path) -> Result<u32> {
    let content = read_cgroup_file(&root.join(CPUSET_MEMS))?;
    highest_list_index(&content)?
        .checked_add(1)
        .ok_or_else(|| {
            CgroupError::ParseError(format!(
                "Memory node index out of range: {:?}",
                content.trim()
            ))
        })
}

//! cgkeeper core library
//!
//! Applies cgroup v1 resource limits (cpu, cpuset, memory, pids) to a
//! dedicated cgroup and keeps one child process running inside it,
//! restarting it after a cooldown whenever it exits.

pub mod cgroups;
pub mod error;
pub mod executor;
pub mod supervisor;

pub use cgroups::{
    AttachScope, CgroupError, CgroupHandle, CgroupIdentity, ControllerMountPoints, HostTopology,
    LimitsSpec, MountResolver, ResourceLimits, Subsystem,
};
pub use error::{Error, Result};
pub use executor::ProcessExecutor;
pub use supervisor::{
    CommandSpec, ExitRecord, ProcessSupervisor, StopReason, SupervisorConfig, SupervisorState,
    SupervisorSummary,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

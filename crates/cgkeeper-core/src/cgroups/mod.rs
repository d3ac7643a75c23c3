//! Cgroup v1 integration module
//!
//! Resolves per-controller hierarchy mounts, validates resource limits and
//! writes them into a dedicated cgroup for the cpu, cpuset, memory and pids
//! controllers.
//!
//! # Ordering
//! - Limits are validated before any directory is created
//! - Controllers are applied in the order CPU, Cpuset, Memory, Pids
//! - A pid is attached only after every limit write succeeded

pub mod controller;
pub mod error;
pub mod handle;
pub mod limits;
pub mod mount;
pub mod topology;
pub mod types;
mod utils;

pub use controller::{
    ControlSink, CpuController, CpusetController, FsSink, MemoryController, PidsController,
};
pub use error::{CgroupError, Result};
pub use handle::{AttachScope, CgroupHandle};
pub use limits::{LimitsSpec, ListKind, ResourceLimits};
pub use mount::MountResolver;
pub use topology::HostTopology;
pub use types::{CgroupIdentity, ControllerMountPoints, Subsystem};

//! Startup sequence: resolve, validate, then supervise

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use cgkeeper_core::cgroups::{
    CgroupHandle, CgroupIdentity, ControllerMountPoints, HostTopology, MountResolver,
    ResourceLimits, Subsystem,
};
use cgkeeper_core::{CommandSpec, ProcessSupervisor, SupervisorConfig, SupervisorSummary};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;

/// Everything resolved and validated before the first cgroup write
#[derive(Debug, Clone, Serialize)]
pub struct LaunchPlan {
    pub identity: CgroupIdentity,
    pub mounts: BTreeMap<Subsystem, PathBuf>,
    pub active: BTreeMap<Subsystem, bool>,
    pub topology: HostTopology,
    pub limits: ResourceLimits,
    pub command: Option<CommandSpec>,
    #[serde(skip)]
    mount_points: ControllerMountPoints,
    #[serde(skip)]
    resolver: MountResolver,
}

impl LaunchPlan {
    /// Resolve mounts, probe the host and validate limits; writes nothing
    pub fn prepare(config: &Config) -> Result<Self> {
        let resolver = MountResolver::with_paths(&config.procfs.mountinfo, &config.procfs.cgroup);
        let mount_points = resolver
            .resolve_all()
            .context("Failed to resolve cgroup v1 controller mounts")?;

        let topology = HostTopology::detect(&mount_points);
        let limits = config
            .limits
            .validate(&topology)
            .context("Invalid resource limits")?;

        let identity = CgroupIdentity::derive(config.command.name.as_deref());

        let mounts = mount_points
            .iter()
            .map(|(subsystem, root)| (subsystem, root.to_path_buf()))
            .collect();
        let active = Subsystem::ALL
            .iter()
            .map(|&subsystem| (subsystem, resolver.controller_is_active(subsystem)))
            .collect();

        info!(
            "Cgroup {}: {} CPUs, {} memory node(s)",
            identity,
            topology.cpu_count(),
            topology.mem_node_count()
        );

        Ok(Self {
            identity,
            mounts,
            active,
            topology,
            limits,
            command: config.command_spec(),
            mount_points,
            resolver,
        })
    }

    /// Pretty JSON rendering for `cgkeeper check`
    pub fn render(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to render launch plan")
    }

    fn into_parts(self) -> (CgroupHandle, Option<CommandSpec>) {
        let handle = CgroupHandle::new(self.identity, self.mount_points, self.limits, self.resolver);
        (handle, self.command)
    }
}

/// Apply limits and keep the command running until `shutdown` is cancelled
/// or the restart limit is reached
pub async fn supervise(
    plan: LaunchPlan,
    settings: SupervisorConfig,
    shutdown: CancellationToken,
) -> Result<SupervisorSummary> {
    let (handle, command) = plan.into_parts();
    let command = command.ok_or_else(|| {
        anyhow!("No command to run: pass --exec, append it after --, or set [command] exec")
    })?;

    info!("Supervising {} in cgroup {}", command, handle.identity());

    let supervisor =
        ProcessSupervisor::new(handle, command, settings).with_stop_token(shutdown);

    supervisor.run().await.context("Supervisor stopped with error")
}

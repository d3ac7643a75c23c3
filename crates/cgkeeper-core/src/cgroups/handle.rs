//! One logical cgroup spread over the cpu, cpuset, memory and pids hierarchies

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::controller::{
    attach_pid, ControlSink, CpuController, CpusetController, FsSink, MemoryController,
    PidsController, PROCS_FILE,
};
use super::error::{CgroupError, Result};
use super::limits::ResourceLimits;
use super::mount::MountResolver;
use super::types::{CgroupIdentity, ControllerMountPoints, Subsystem};
use super::utils::{ensure_dir, parse_procs, read_cgroup_file, remove_cgroup_dir};

/// Which controller directories receive the child's pid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttachScope {
    /// Only the memory hierarchy
    MemoryOnly,
    /// Every managed hierarchy, so each controller constrains the process
    AllControllers,
}

impl AttachScope {
    pub fn subsystems(&self) -> &'static [Subsystem] {
        match self {
            AttachScope::MemoryOnly => &[Subsystem::Memory],
            AttachScope::AllControllers => &Subsystem::ALL,
        }
    }
}

/// Owns the on-disk cgroup directories for one supervised run
///
/// Directories created by the handle are removed by [`CgroupHandle::teardown`],
/// or on drop if teardown was never called.
pub struct CgroupHandle {
    identity: CgroupIdentity,
    mounts: ControllerMountPoints,
    limits: ResourceLimits,
    resolver: MountResolver,
    sink: Arc<dyn ControlSink>,
    dirs: HashMap<Subsystem, PathBuf>,
    created: Vec<(Subsystem, PathBuf)>,
    torn_down: bool,
}

impl std::fmt::Debug for CgroupHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CgroupHandle")
            .field("identity", &self.identity)
            .field("mounts", &self.mounts)
            .field("dirs", &self.dirs)
            .field("created", &self.created)
            .finish()
    }
}

impl CgroupHandle {
    pub fn new(
        identity: CgroupIdentity,
        mounts: ControllerMountPoints,
        limits: ResourceLimits,
        resolver: MountResolver,
    ) -> Self {
        Self {
            identity,
            mounts,
            limits,
            resolver,
            sink: Arc::new(FsSink),
            dirs: HashMap::new(),
            created: Vec::new(),
            torn_down: false,
        }
    }

    /// Route control file writes through another sink
    pub fn with_sink(mut self, sink: Arc<dyn ControlSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn identity(&self) -> &CgroupIdentity {
        &self.identity
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn mounts(&self) -> &ControllerMountPoints {
        &self.mounts
    }

    /// Directory of this cgroup under `subsystem`, if already created
    pub fn dir(&self, subsystem: Subsystem) -> Option<&Path> {
        self.dirs.get(&subsystem).map(PathBuf::as_path)
    }

    /// Directories created by this handle, outermost first
    pub fn created_dirs(&self) -> impl Iterator<Item = &Path> {
        self.created.iter().map(|(_, p)| p.as_path())
    }

    /// Create (if needed) and return `<mount root>/<identity>` for `subsystem`
    pub fn ensure_path(&mut self, subsystem: Subsystem) -> Result<PathBuf> {
        if let Some(dir) = self.dirs.get(&subsystem) {
            return Ok(dir.clone());
        }

        let root = self.mounts.root(subsystem)?.to_path_buf();
        let (dir, created) = ensure_dir(&root, self.identity.as_path())?;
        for path in created {
            debug!("Created cgroup directory {:?}", path);
            self.created.push((subsystem, path));
        }

        self.dirs.insert(subsystem, dir.clone());
        self.torn_down = false;
        Ok(dir)
    }

    fn require_active(&self, subsystem: Subsystem) -> Result<()> {
        if !self.resolver.controller_is_active(subsystem) {
            return Err(CgroupError::ControllerUnavailable(subsystem.name().to_string()));
        }
        Ok(())
    }

    pub fn apply_cpu(&mut self) -> Result<()> {
        self.require_active(Subsystem::Cpu)?;
        let dir = self.ensure_path(Subsystem::Cpu)?;
        CpuController::apply(self.sink.as_ref(), &dir, self.limits.cpu())
    }

    pub fn apply_cpuset(&mut self) -> Result<()> {
        self.require_active(Subsystem::Cpuset)?;
        let dir = self.ensure_path(Subsystem::Cpuset)?;
        CpusetController::apply(self.sink.as_ref(), &dir, self.limits.cpuset())
    }

    pub fn apply_memory(&mut self) -> Result<()> {
        self.require_active(Subsystem::Memory)?;
        let dir = self.ensure_path(Subsystem::Memory)?;
        MemoryController::apply(self.sink.as_ref(), &dir, self.limits.memory())
    }

    pub fn apply_pids(&mut self) -> Result<()> {
        self.require_active(Subsystem::Pids)?;
        let dir = self.ensure_path(Subsystem::Pids)?;
        PidsController::apply(self.sink.as_ref(), &dir, self.limits.pids())
    }

    /// Apply every controller in the fixed order CPU, Cpuset, Memory, Pids
    ///
    /// Stops at the first failure; earlier writes are left in place.
    pub fn apply_all(&mut self) -> Result<()> {
        self.apply_cpu()?;
        self.apply_cpuset()?;
        self.apply_memory()?;
        self.apply_pids()?;
        info!("Limits applied to cgroup {}", self.identity);
        Ok(())
    }

    /// Write `pid` into `cgroup.procs` of each directory in `scope`
    pub fn attach(&mut self, pid: u32, scope: AttachScope) -> Result<()> {
        for &subsystem in scope.subsystems() {
            let dir = self.ensure_path(subsystem)?;
            attach_pid(self.sink.as_ref(), &dir, pid)?;
        }
        info!("Attached pid {} to cgroup {} ({:?})", pid, self.identity, scope);
        Ok(())
    }

    /// Migrate leftover processes to each hierarchy root and remove the
    /// directories this handle created, innermost first.
    ///
    /// Every directory is attempted; the first error is returned.
    pub fn teardown(&mut self) -> Result<()> {
        let mut first_error = None;

        while let Some((subsystem, dir)) = self.created.pop() {
            if let Err(e) = self.migrate_out(subsystem, &dir) {
                warn!("Failed to migrate processes out of {:?}: {}", dir, e);
            }

            match remove_cgroup_dir(&dir) {
                Ok(()) => debug!("Removed cgroup directory {:?}", dir),
                Err(e) => {
                    warn!("Failed to remove cgroup directory {:?}: {}", dir, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        self.dirs.clear();
        self.torn_down = true;

        match first_error {
            None => {
                info!("Cgroup {} removed", self.identity);
                Ok(())
            }
            Some(e) => Err(e),
        }
    }

    fn migrate_out(&self, subsystem: Subsystem, dir: &Path) -> Result<()> {
        let pids = match read_cgroup_file(&dir.join(PROCS_FILE)) {
            Ok(content) => parse_procs(&content),
            Err(CgroupError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        let root = self.mounts.root(subsystem)?;
        for pid in pids {
            attach_pid(self.sink.as_ref(), root, pid)?;
            debug!("Moved process {} back to {:?}", pid, root);
        }
        Ok(())
    }
}

impl Drop for CgroupHandle {
    fn drop(&mut self) {
        if self.torn_down || self.created.is_empty() {
            return;
        }
        if let Err(e) = self.teardown() {
            warn!("Cgroup {} cleanup incomplete: {}", self.identity, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroups::limits::LimitsSpec;
    use crate::cgroups::topology::HostTopology;
    use std::fs;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _tmp: TempDir,
        mounts: ControllerMountPoints,
        resolver: MountResolver,
    }

    fn fixture(active: &str) -> Fixture {
        let tmp = tempdir().unwrap();
        let mut mounts = ControllerMountPoints::new();
        for subsystem in Subsystem::ALL {
            let root = tmp.path().join(subsystem.name());
            fs::create_dir_all(&root).unwrap();
            mounts = mounts.with_root(subsystem, root);
        }

        let cgroup_info = tmp.path().join("self-cgroup");
        fs::write(&cgroup_info, active).unwrap();
        let resolver = MountResolver::with_paths(tmp.path().join("mountinfo"), cgroup_info);

        Fixture {
            _tmp: tmp,
            mounts,
            resolver,
        }
    }

    const ALL_ACTIVE: &str = "5:pids:/\n4:memory:/\n3:cpuset:/\n2:cpu,cpuacct:/\n";

    fn handle(fx: &Fixture) -> CgroupHandle {
        let limits = LimitsSpec::new().validate(&HostTopology::new(2, 1)).unwrap();
        CgroupHandle::new(
            CgroupIdentity::new("abc").unwrap(),
            fx.mounts.clone(),
            limits,
            fx.resolver.clone(),
        )
    }

    #[test]
    fn test_apply_all_writes_files() {
        let fx = fixture(ALL_ACTIVE);
        let mut cg = handle(&fx);
        cg.apply_all().unwrap();

        let cpu = cg.dir(Subsystem::Cpu).unwrap().to_path_buf();
        assert_eq!(fs::read_to_string(cpu.join("cpu.shares")).unwrap(), "1024");
        let pids = cg.dir(Subsystem::Pids).unwrap().to_path_buf();
        assert_eq!(fs::read_to_string(pids.join("pids.max")).unwrap(), "max");
    }

    #[test]
    fn test_inactive_controller_writes_nothing() {
        let fx = fixture("4:memory:/\n");
        let mut cg = handle(&fx);

        let err = cg.apply_cpu().unwrap_err();
        assert!(matches!(err, CgroupError::ControllerUnavailable(_)));
        assert!(cg.dir(Subsystem::Cpu).is_none());
        assert_eq!(cg.created_dirs().count(), 0);

        cg.apply_memory().unwrap();
        assert!(cg.dir(Subsystem::Memory).is_some());
    }

    #[test]
    fn test_attach_scope() {
        let fx = fixture(ALL_ACTIVE);
        let mut cg = handle(&fx);
        cg.attach(77, AttachScope::MemoryOnly).unwrap();

        let mem = cg.dir(Subsystem::Memory).unwrap().join("cgroup.procs");
        assert_eq!(fs::read_to_string(mem).unwrap(), "77");
        assert!(cg.dir(Subsystem::Cpu).is_none());

        cg.attach(78, AttachScope::AllControllers).unwrap();
        for subsystem in Subsystem::ALL {
            let procs = cg.dir(subsystem).unwrap().join("cgroup.procs");
            assert_eq!(fs::read_to_string(procs).unwrap(), "78");
        }
    }

    #[test]
    fn test_teardown_removes_created_dirs() {
        let fx = fixture(ALL_ACTIVE);
        let mut cg = handle(&fx);
        let dirs: Vec<PathBuf> = Subsystem::ALL
            .iter()
            .map(|s| cg.ensure_path(*s).unwrap())
            .collect();

        cg.teardown().unwrap();
        for dir in dirs {
            assert!(!dir.exists());
        }
        assert_eq!(cg.created_dirs().count(), 0);
    }

    #[test]
    fn test_drop_cleans_up() {
        let fx = fixture(ALL_ACTIVE);
        let dir = {
            let mut cg = handle(&fx);
            cg.ensure_path(Subsystem::Memory).unwrap()
        };
        assert!(!dir.exists());
    }

    #[test]
    fn test_teardown_migrates_processes() {
        let fx = fixture(ALL_ACTIVE);
        let mut cg = handle(&fx);
        let dir = cg.ensure_path(Subsystem::Memory).unwrap();
        fs::write(dir.join("cgroup.procs"), "31\n").unwrap();

        // Regular files keep the fake directory non-empty, so rmdir fails here
        assert!(cg.teardown().is_err());

        let root = fx.mounts.root(Subsystem::Memory).unwrap();
        assert_eq!(fs::read_to_string(root.join("cgroup.procs")).unwrap(), "31");
    }

    #[test]
    fn test_preexisting_dir_is_kept() {
        let fx = fixture(ALL_ACTIVE);
        let existing = fx.mounts.root(Subsystem::Pids).unwrap().join("abc");
        fs::create_dir_all(&existing).unwrap();

        let mut cg = handle(&fx);
        cg.ensure_path(Subsystem::Pids).unwrap();
        cg.teardown().unwrap();
        assert!(existing.exists());
    }
}

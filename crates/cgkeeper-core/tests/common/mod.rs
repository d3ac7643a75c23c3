// Shared fixtures: a fake cgroup v1 tree under a temp directory
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use cgkeeper_core::cgroups::{
    CgroupError, CgroupHandle, CgroupIdentity, ControlSink, HostTopology, LimitsSpec,
    MountResolver, Subsystem,
};
use tempfile::TempDir;

pub const ALL_ACTIVE: &str = "12:pids:/user.slice\n\
                              9:memory:/user.slice\n\
                              5:cpuset:/\n\
                              3:cpu,cpuacct:/user.slice\n";

pub struct FakeTree {
    pub tmp: TempDir,
    pub resolver: MountResolver,
}

impl FakeTree {
    /// Hierarchy roots for every subsystem plus matching procfs snapshots
    pub fn new(active: &str) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let mut mountinfo = String::from(
            "25 27 0:23 / /sys/fs/cgroup ro,nosuid - tmpfs tmpfs ro,mode=755\n",
        );

        for (id, subsystem) in Subsystem::ALL.iter().enumerate() {
            let root = tmp.path().join(subsystem.name());
            fs::create_dir_all(&root).unwrap();
            mountinfo.push_str(&format!(
                "{} 25 0:{} / {} rw,nosuid,nodev,noexec,relatime shared:{} - cgroup cgroup rw,{}\n",
                30 + id,
                27 + id,
                root.display(),
                13 + id,
                subsystem.name()
            ));
        }
        fs::write(tmp.path().join("cpuset").join("cpuset.mems"), "0\n").unwrap();

        let mountinfo_path = tmp.path().join("mountinfo");
        let cgroup_path = tmp.path().join("self-cgroup");
        fs::write(&mountinfo_path, mountinfo).unwrap();
        fs::write(&cgroup_path, active).unwrap();

        Self {
            resolver: MountResolver::with_paths(mountinfo_path, cgroup_path),
            tmp,
        }
    }

    pub fn root(&self, subsystem: Subsystem) -> PathBuf {
        self.tmp.path().join(subsystem.name())
    }

    pub fn handle(&self, name: &str, spec: &LimitsSpec, sink: Arc<dyn ControlSink>) -> CgroupHandle {
        let mounts = self.resolver.resolve_all().unwrap();
        let limits = spec.validate(&HostTopology::new(4, 1)).unwrap();
        CgroupHandle::new(
            CgroupIdentity::new(name).unwrap(),
            mounts,
            limits,
            self.resolver.clone(),
        )
        .with_sink(sink)
    }
}

/// Records every control file write in order
#[derive(Default)]
pub struct RecordingSink {
    writes: Mutex<Vec<(PathBuf, String)>>,
}

impl RecordingSink {
    pub fn writes(&self) -> Vec<(PathBuf, String)> {
        self.writes.lock().unwrap().clone()
    }

    /// File names of the recorded writes, e.g. `cpu.shares`
    pub fn files(&self) -> Vec<String> {
        self.writes()
            .iter()
            .map(|(path, _)| file_name(path))
            .collect()
    }
}

impl ControlSink for RecordingSink {
    fn write(&self, path: &Path, value: &str) -> Result<(), CgroupError> {
        self.writes
            .lock()
            .unwrap()
            .push((path.to_path_buf(), value.to_string()));
        Ok(())
    }
}

pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

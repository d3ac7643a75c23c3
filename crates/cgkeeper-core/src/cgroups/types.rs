//! Data types shared by the cgroup modules

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use super::error::{CgroupError, Result};

/// Length of the hex digest prefix used as the cgroup directory name
pub const IDENTITY_LEN: usize = 12;

/// Cgroup v1 subsystem (controller) handled by cgkeeper
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subsystem {
    Cpu,
    Cpuset,
    Memory,
    Pids,
}

impl Subsystem {
    /// Every subsystem, in the order limits are applied
    pub const ALL: [Subsystem; 4] = [
        Subsystem::Cpu,
        Subsystem::Cpuset,
        Subsystem::Memory,
        Subsystem::Pids,
    ];

    /// Hierarchy name as it appears in mountinfo and /proc/self/cgroup
    pub fn name(&self) -> &'static str {
        match self {
            Subsystem::Cpu => "cpu,cpuacct",
            Subsystem::Cpuset => "cpuset",
            Subsystem::Memory => "memory",
            Subsystem::Pids => "pids",
        }
    }

    /// Does a hierarchy name refer to this subsystem?
    ///
    /// The kernel may list the CPU pair as `cpuacct,cpu`.
    pub fn matches(&self, name: &str) -> bool {
        name == self.name() || (*self == Subsystem::Cpu && name == "cpuacct,cpu")
    }

    /// Individual controller names joined in the hierarchy name
    pub fn controllers(&self) -> impl Iterator<Item = &'static str> {
        self.name().split(',')
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Path segment naming our cgroup under every controller hierarchy
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CgroupIdentity(String);

impl CgroupIdentity {
    /// Use an explicit segment verbatim
    pub fn new(segment: impl Into<String>) -> Result<Self> {
        let segment = segment.into();
        let valid = !segment.is_empty()
            && segment != "."
            && segment != ".."
            && !segment.contains('/')
            && !segment.contains('\0');

        if !valid {
            return Err(CgroupError::InvalidIdentity(segment));
        }
        Ok(Self(segment))
    }

    /// Derive an identity from a user supplied name, or from a random value
    ///
    /// The name (or random UUID) is SHA-256 hashed and the hex digest
    /// truncated to [`IDENTITY_LEN`] characters.
    pub fn derive(name: Option<&str>) -> Self {
        let seed = match name {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => uuid::Uuid::new_v4().to_string(),
        };

        let digest = format!("{:x}", Sha256::digest(seed.as_bytes()));
        Self(digest[..IDENTITY_LEN].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_path(&self) -> &Path {
        Path::new(&self.0)
    }
}

impl fmt::Display for CgroupIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CgroupIdentity {
    type Error = CgroupError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<CgroupIdentity> for String {
    fn from(identity: CgroupIdentity) -> Self {
        identity.0
    }
}

/// Controller -> hierarchy root, resolved once per run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerMountPoints {
    roots: HashMap<Subsystem, PathBuf>,
}

impl ControllerMountPoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(mut self, subsystem: Subsystem, root: impl Into<PathBuf>) -> Self {
        self.roots.insert(subsystem, root.into());
        self
    }

    /// Hierarchy root for a subsystem
    pub fn root(&self, subsystem: Subsystem) -> Result<&Path> {
        self.roots
            .get(&subsystem)
            .map(PathBuf::as_path)
            .ok_or_else(|| CgroupError::NotMounted(subsystem.name().to_string()))
    }

    pub fn contains(&self, subsystem: Subsystem) -> bool {
        self.roots.contains_key(&subsystem)
    }

    /// Resolved roots in application order
    pub fn iter(&self) -> impl Iterator<Item = (Subsystem, &Path)> {
        Subsystem::ALL
            .into_iter()
            .filter_map(|s| self.roots.get(&s).map(|p| (s, p.as_path())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subsystem_names() {
        assert_eq!(Subsystem::Cpu.name(), "cpu,cpuacct");
        assert_eq!(Subsystem::Pids.to_string(), "pids");
        assert!(Subsystem::Cpu.matches("cpuacct,cpu"));
        assert!(Subsystem::Cpu.matches("cpu,cpuacct"));
        assert!(!Subsystem::Cpuset.matches("cpu,cpuacct"));
        assert_eq!(
            Subsystem::Cpu.controllers().collect::<Vec<_>>(),
            vec!["cpu", "cpuacct"]
        );
    }

    #[test]
    fn test_identity_derive_is_stable() {
        let a = CgroupIdentity::derive(Some("web"));
        let b = CgroupIdentity::derive(Some("web"));
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), IDENTITY_LEN);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a.as_str(), &format!("{:x}", Sha256::digest(b"web"))[..12]);
    }

    #[test]
    fn test_identity_derive_random() {
        let a = CgroupIdentity::derive(None);
        let b = CgroupIdentity::derive(None);
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), IDENTITY_LEN);

        // Empty name counts as absent
        assert_eq!(CgroupIdentity::derive(Some("")).as_str().len(), IDENTITY_LEN);
    }

    #[test]
    fn test_identity_new_rejects_bad_segments() {
        assert!(CgroupIdentity::new("").is_err());
        assert!(CgroupIdentity::new("..").is_err());
        assert!(CgroupIdentity::new("a/b").is_err());
        assert_eq!(CgroupIdentity::new("abc").unwrap().as_str(), "abc");
    }

    #[test]
    fn test_identity_serde() {
        let id = CgroupIdentity::new("abc123").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, r#""abc123""#);

        let bad: std::result::Result<CgroupIdentity, _> = serde_json::from_str(r#""""#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_mount_points_lookup() {
        let mounts = ControllerMountPoints::new()
            .with_root(Subsystem::Memory, "/sys/fs/cgroup/memory")
            .with_root(Subsystem::Cpu, "/sys/fs/cgroup/cpu,cpuacct");

        assert_eq!(
            mounts.root(Subsystem::Memory).unwrap(),
            Path::new("/sys/fs/cgroup/memory")
        );
        assert!(matches!(
            mounts.root(Subsystem::Pids),
            Err(CgroupError::NotMounted(_))
        ));

        let order: Vec<_> = mounts.iter().map(|(s, _)| s).collect();
        assert_eq!(order, vec![Subsystem::Cpu, Subsystem::Memory]);
    }
}

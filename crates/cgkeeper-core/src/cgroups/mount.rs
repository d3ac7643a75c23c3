//! Locating cgroup v1 hierarchies from procfs
//!
//! Two pseudo-files are consulted:
//!
//! ```text
//! /proc/self/mountinfo
//! 35 25 0:30 / /sys/fs/cgroup/memory rw,nosuid,nodev,noexec,relatime shared:17 - cgroup cgroup rw,memory
//!
//! /proc/self/cgroup
//! 4:memory:/user.slice
//! ```
//!
//! Both reads fail closed: an unreadable file means "not mounted".

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::{CgroupError, Result};
use super::types::{ControllerMountPoints, Subsystem};

pub const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";
pub const CGROUP_INFO_PATH: &str = "/proc/self/cgroup";

const CGROUP_FS_TYPE: &str = "cgroup";

/// The fields of one mountinfo line we care about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub source: String,
    pub super_options: String,
}

impl MountEntry {
    /// Parse a mountinfo line
    ///
    /// Optional fields between the mount options and the `-` separator are
    /// variable in number, so the filesystem fields are located relative to
    /// the separator rather than by fixed index.
    pub fn parse(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            return None;
        }

        let separator = fields.iter().skip(6).position(|f| *f == "-")? + 6;
        let tail = fields.get(separator + 1..separator + 4)?;

        Some(Self {
            mount_point: PathBuf::from(unescape_octal(fields[4])),
            fs_type: tail[0].to_string(),
            source: tail[1].to_string(),
            super_options: tail[2].to_string(),
        })
    }

    fn is_cgroup_v1(&self) -> bool {
        self.fs_type == CGROUP_FS_TYPE
    }

    /// Mount point's last component names the subsystem
    fn named_for(&self, subsystem: Subsystem) -> bool {
        self.mount_point
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| subsystem.matches(n))
            .unwrap_or(false)
    }

    /// Superblock options list every controller of the subsystem
    fn carries(&self, subsystem: Subsystem) -> bool {
        let options: Vec<&str> = self.super_options.split(',').collect();
        subsystem.controllers().all(|c| options.contains(&c))
    }
}

/// Mountinfo escapes space, tab, newline and backslash as `\ooo`
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits
                    .iter()
                    .fold(0u16, |acc, b| acc * 8 + u16::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// Find the hierarchy root of `subsystem` in mountinfo content
///
/// A mount named after the subsystem wins; otherwise the first cgroup mount
/// whose superblock options carry all of the subsystem's controllers.
pub fn find_mount_point(mountinfo: &str, subsystem: Subsystem) -> Option<PathBuf> {
    let entries: Vec<MountEntry> = mountinfo
        .lines()
        .filter_map(MountEntry::parse)
        .filter(MountEntry::is_cgroup_v1)
        .collect();

    entries
        .iter()
        .find(|e| e.named_for(subsystem))
        .or_else(|| entries.iter().find(|e| e.carries(subsystem)))
        .map(|e| e.mount_point.clone())
}

/// Does /proc/self/cgroup content list `subsystem` as a hierarchy?
pub fn is_listed(cgroup_info: &str, subsystem: Subsystem) -> bool {
    cgroup_info.lines().any(|line| {
        let mut fields = line.splitn(3, ':');
        let _id = fields.next();
        matches!(fields.next(), Some(controllers) if subsystem.matches(controllers))
    })
}

/// Resolves controller mount points from procfs snapshots
#[derive(Debug, Clone)]
pub struct MountResolver {
    mountinfo_path: PathBuf,
    cgroup_info_path: PathBuf,
}

impl Default for MountResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl MountResolver {
    /// Resolver reading this process's own procfs entries
    pub fn new() -> Self {
        Self::with_paths(MOUNTINFO_PATH, CGROUP_INFO_PATH)
    }

    /// Resolver reading alternative snapshot files
    pub fn with_paths(mountinfo: impl Into<PathBuf>, cgroup_info: impl Into<PathBuf>) -> Self {
        Self {
            mountinfo_path: mountinfo.into(),
            cgroup_info_path: cgroup_info.into(),
        }
    }

    pub fn mountinfo_path(&self) -> &Path {
        &self.mountinfo_path
    }

    pub fn cgroup_info_path(&self) -> &Path {
        &self.cgroup_info_path
    }

    /// Absolute path of the subsystem's hierarchy mount
    pub fn resolve_mount(&self, subsystem: Subsystem) -> Result<PathBuf> {
        let content = fs::read_to_string(&self.mountinfo_path).map_err(|e| {
            debug!("Failed to read {:?}: {}", self.mountinfo_path, e);
            CgroupError::NotMounted(subsystem.name().to_string())
        })?;

        find_mount_point(&content, subsystem)
            .ok_or_else(|| CgroupError::NotMounted(subsystem.name().to_string()))
    }

    /// Is the subsystem active for this process?
    pub fn controller_is_active(&self, subsystem: Subsystem) -> bool {
        match fs::read_to_string(&self.cgroup_info_path) {
            Ok(content) => is_listed(&content, subsystem),
            Err(e) => {
                debug!("Failed to read {:?}: {}", self.cgroup_info_path, e);
                false
            }
        }
    }

    /// Resolve every subsystem cgkeeper manages
    pub fn resolve_all(&self) -> Result<ControllerMountPoints> {
        Subsystem::ALL
            .into_iter()
            .try_fold(ControllerMountPoints::new(), |mounts, subsystem| {
                let root = self.resolve_mount(subsystem)?;
                debug!("Subsystem {} mounted at {:?}", subsystem, root);
                Ok(mounts.with_root(subsystem, root))
            })
    }
}

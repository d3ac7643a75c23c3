//! Utility functions for cgroup operations

use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use super::error::{CgroupError, Result};

/// Mode for cgroup directories we create (rwxr-xr-x)
const CGROUP_DIR_MODE: u32 = 0o755;

fn map_io_error(path: &Path, e: io::Error) -> CgroupError {
    match e.kind() {
        io::ErrorKind::NotFound => CgroupError::NotFound(format!("{:?}", path)),
        io::ErrorKind::PermissionDenied => CgroupError::PermissionDenied(format!("{:?}", path)),
        _ => CgroupError::io(path, e),
    }
}

/// Safe read file to string
pub fn read_cgroup_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| map_io_error(path, e))
}

/// Safe write file
///
/// Control files are overwritten, never appended to.
pub fn write_cgroup_file(path: &Path, content: &str) -> Result<()> {
    fs::write(path, content).map_err(|e| match e.kind() {
        io::ErrorKind::PermissionDenied => CgroupError::PermissionDenied(format!("{:?}", path)),
        _ => CgroupError::io(path, e),
    })
}

/// Create `root/segment` including any missing intermediate directories.
///
/// Returns the joined path and the directories that did not exist before the
/// call, outermost first. Directories at or above `root` are never reported.
pub fn ensure_dir(root: &Path, segment: &Path) -> Result<(PathBuf, Vec<PathBuf>)> {
    let target = root.join(segment);

    let mut missing = Vec::new();
    let mut cursor = target.as_path();
    while cursor != root && cursor.starts_with(root) && !cursor.exists() {
        missing.push(cursor.to_path_buf());
        match cursor.parent() {
            Some(parent) => cursor = parent,
            None => break,
        }
    }
    missing.reverse();

    DirBuilder::new()
        .recursive(true)
        .mode(CGROUP_DIR_MODE)
        .create(&target)
        .map_err(|e| map_io_error(&target, e))?;

    Ok((target, missing))
}

/// Remove an (empty) cgroup directory, treating "already gone" as success
pub fn remove_cgroup_dir(path: &Path) -> Result<()> {
    match fs::remove_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(map_io_error(path, e)),
    }
}

/// Parse the pid list of a `cgroup.procs` file
pub fn parse_procs(content: &str) -> Vec<u32> {
    content
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .collect()
}

/// Highest index named by a cpu/mem list such as `0-3,8,10-11`.
///
/// Used to count NUMA nodes from the root `cpuset.mems`.
pub fn highest_list_index(list: &str) -> Result<u32> {
    let list = list.trim();
    let tail = list
        .rsplit(|c| c == ',' || c == '-')
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CgroupError::ParseError(format!("Empty list: {:?}", list)))?;

    tail.parse::<u32>()
        .map_err(|e| CgroupError::ParseError(format!("Invalid list tail {:?}: {}", tail, e)))
}

//! Error types for cgroup operations

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Cgroup operation errors
#[derive(Debug, Error)]
pub enum CgroupError {
    #[error("Subsystem {0} is not mounted")]
    NotMounted(String),

    #[error("Controller {0} is not active for this process")]
    ControllerUnavailable(String),

    #[error("Invalid limit value: {0}")]
    InvalidLimit(String),

    #[error("Invalid cgroup identity: {0:?}")]
    InvalidIdentity(String),

    #[error("Failed to parse cgroup file: {0}")]
    ParseError(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Cgroup not found: {0}")]
    NotFound(String),

    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CgroupError {
    /// Wrap an IO error with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CgroupError::Io {
            path: path.into(),
            source,
        }
    }

    /// True for errors raised before anything touched the filesystem
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CgroupError::InvalidLimit(_) | CgroupError::InvalidIdentity(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CgroupError>;

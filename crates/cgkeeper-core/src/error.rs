use thiserror::Error;

use crate::cgroups::CgroupError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Cgroup error: {0}")]
    Cgroup(#[from] CgroupError),

    #[error("Failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to attach pid {pid}: {source}")]
    Attach {
        pid: u32,
        #[source]
        source: CgroupError,
    },

    #[error("Executor error: {0}")]
    Executor(String),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

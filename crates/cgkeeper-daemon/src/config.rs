use cgkeeper_core::cgroups::mount::{CGROUP_INFO_PATH, MOUNTINFO_PATH};
use cgkeeper_core::cgroups::{AttachScope, LimitsSpec};
use cgkeeper_core::{CommandSpec, SupervisorConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/cgkeeper/config.toml";

/// Prefix of environment overrides, e.g. `CGKEEPER_SUPERVISOR__COOLDOWN_SECS=2`
pub const ENV_PREFIX: &str = "CGKEEPER";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Main configuration for cgkeeper
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Command to supervise
    pub command: CommandConfig,

    /// Raw resource limits, validated against the host at startup
    pub limits: LimitsSpec,

    /// Restart and shutdown behaviour
    pub supervisor: SupervisorSettings,

    /// Kernel snapshot files used for mount resolution
    pub procfs: ProcfsConfig,

    /// Logging configuration
    pub logging: LogConfig,
}

/// Supervised command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Executable to run
    pub exec: Option<String>,

    /// Arguments passed to `exec`
    pub args: Vec<String>,

    /// Cgroup name; hashed into the directory name. Random when unset.
    pub name: Option<String>,
}

/// Supervisor settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Pause between an exit and the next spawn (default: 5)
    pub cooldown_secs: u64,

    /// Restarts allowed after the first spawn (default: unlimited)
    pub max_restarts: Option<u32>,

    /// Seconds between SIGTERM and SIGKILL on shutdown (default: 10)
    pub stop_grace_secs: u64,

    /// Attach the child to every controller, not just memory (default: true)
    pub attach_all_controllers: bool,
}

/// Procfs snapshot locations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcfsConfig {
    pub mountinfo: PathBuf,
    pub cgroup: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter when RUST_LOG is unset (default: info)
    pub level: String,

    /// Also write a daily-rotated log file (default: false)
    pub file_enabled: bool,

    /// Log directory path (default: /var/log/cgkeeper)
    pub log_dir: PathBuf,

    /// Log file name prefix (default: cgkeeper.log)
    pub file_name: String,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            cooldown_secs: 5,
            max_restarts: None,
            stop_grace_secs: 10,
            attach_all_controllers: true,
        }
    }
}

impl Default for ProcfsConfig {
    fn default() -> Self {
        Self {
            mountinfo: PathBuf::from(MOUNTINFO_PATH),
            cgroup: PathBuf::from(CGROUP_INFO_PATH),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_enabled: false,
            log_dir: PathBuf::from("/var/log/cgkeeper"),
            file_name: "cgkeeper.log".to_string(),
        }
    }
}

impl SupervisorSettings {
    pub fn to_supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            cooldown: Duration::from_secs(self.cooldown_secs),
            max_restarts: self.max_restarts,
            stop_grace: Duration::from_secs(self.stop_grace_secs),
            attach_scope: if self.attach_all_controllers {
                AttachScope::AllControllers
            } else {
                AttachScope::MemoryOnly
            },
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file plus `CGKEEPER_*` environment
    ///
    /// A missing file is not an error; every field has a default.
    ///
    /// # Example
    /// ```no_run
    /// use cgkeeper_daemon::config::Config;
    /// use std::path::Path;
    ///
    /// let config = Config::load(Path::new("/etc/cgkeeper/config.toml")).unwrap();
    /// println!("Cooldown: {}s", config.supervisor.cooldown_secs);
    /// ```
    pub fn load(path: &Path) -> Result<Self, ::config::ConfigError> {
        ::config::Config::builder()
            .add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Load configuration from a TOML file only
    pub fn load_from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate structural settings
    ///
    /// Limit values are checked separately against the host topology.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(exec) = &self.command.exec {
            if exec.trim().is_empty() {
                return Err("Command exec must not be empty".to_string());
            }
        }

        if self.supervisor.stop_grace_secs == 0 {
            return Err("Stop grace period must be > 0".to_string());
        }

        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(format!(
                "Log level must be one of {:?}, got: {}",
                LOG_LEVELS, self.logging.level
            ));
        }

        if self.logging.file_enabled && self.logging.file_name.is_empty() {
            return Err("Log file name must not be empty when file logging is enabled".to_string());
        }

        Ok(())
    }

    /// The command to supervise, if one is configured
    pub fn command_spec(&self) -> Option<CommandSpec> {
        self.command
            .exec
            .as_ref()
            .map(|exec| CommandSpec::new(exec.clone(), self.command.args.clone()))
    }
}

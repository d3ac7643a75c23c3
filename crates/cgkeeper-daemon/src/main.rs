use anyhow::{anyhow, Context, Result};
use cgkeeper_core::cgroups::LimitsSpec;
use cgkeeper_core::{SupervisorConfig, VERSION};
use cgkeeper_daemon::config::DEFAULT_CONFIG_PATH;
use cgkeeper_daemon::{init_logging, supervise, Config, LaunchPlan};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// cgkeeper - run a command inside a cgroup v1 sandbox and keep it running
///
/// Limits are validated and applied before the command starts; the command
/// is restarted after a cooldown whenever it exits.
#[derive(Parser, Debug)]
#[command(name = "cgkeeper")]
#[command(version = VERSION)]
#[command(about = "cgkeeper - cgroup v1 limits and a restarting supervisor", long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply limits and supervise the command (default)
    Run(RunArgs),

    /// Resolve mounts, validate limits and print the plan without writing
    Check(RunArgs),

    /// Generate default configuration file
    GenerateConfig {
        /// Output path for config file
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "CGKEEPER_CONFIG")]
    config: PathBuf,

    /// Executable to supervise
    #[arg(long)]
    exec: Option<String>,

    /// Argument for --exec (repeatable)
    #[arg(long = "args", allow_hyphen_values = true)]
    args: Vec<String>,

    /// Cgroup name, hashed into the directory name
    #[arg(long)]
    name: Option<String>,

    /// Quota/runtime headroom multiplier
    #[arg(long)]
    cpu_exceed_rate: Option<f64>,

    /// CFS period in microseconds (0 or 1000-1000000)
    #[arg(long)]
    cpu_cfs_period: Option<u64>,

    /// CFS quota in microseconds
    #[arg(long)]
    cpu_cfs_quota: Option<u64>,

    /// RT period in microseconds
    #[arg(long)]
    cpu_rt_period: Option<u64>,

    /// RT runtime in microseconds
    #[arg(long)]
    cpu_rt_runtime: Option<u64>,

    /// Relative CPU weight (0 or >= 2)
    #[arg(long)]
    cpu_shares: Option<u64>,

    /// Allowed CPUs, e.g. 0-3,6
    #[arg(long)]
    cpuset_cpus: Option<String>,

    /// Allowed memory nodes, e.g. 0
    #[arg(long)]
    cpuset_mems: Option<String>,

    /// Hard memory limit in bytes (-1 = unlimited)
    #[arg(long, allow_negative_numbers = true)]
    memory_limit: Option<i64>,

    /// Soft memory limit in bytes (-1 = unlimited)
    #[arg(long, allow_negative_numbers = true)]
    memory_soft_limit: Option<i64>,

    /// Memory + swap limit in bytes (-1 = unlimited)
    #[arg(long, allow_negative_numbers = true)]
    memory_swap_limit: Option<i64>,

    /// Swappiness, clamped to 100
    #[arg(long)]
    memory_swappiness: Option<u64>,

    /// Maximum number of tasks (0 = unlimited)
    #[arg(long)]
    pids_max: Option<u64>,

    /// Pause between restarts, e.g. 5s or 500ms
    #[arg(long, value_parser = humantime::parse_duration)]
    cooldown: Option<Duration>,

    /// Restarts allowed after the first spawn (default: unlimited)
    #[arg(long)]
    max_restarts: Option<u32>,

    /// Time between SIGTERM and SIGKILL on shutdown
    #[arg(long, value_parser = humantime::parse_duration)]
    stop_grace: Option<Duration>,

    /// Attach the child to the memory controller only
    #[arg(long)]
    attach_memory_only: bool,

    /// Default log filter when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,

    /// Command and arguments, given after --
    #[arg(last = true, conflicts_with = "exec", value_name = "COMMAND")]
    trailing: Vec<String>,
}

impl RunArgs {
    fn limits(&self) -> LimitsSpec {
        LimitsSpec {
            cpu_exceed_rate: self.cpu_exceed_rate,
            cpu_cfs_period: self.cpu_cfs_period,
            cpu_cfs_quota: self.cpu_cfs_quota,
            cpu_rt_period: self.cpu_rt_period,
            cpu_rt_runtime: self.cpu_rt_runtime,
            cpu_shares: self.cpu_shares,
            cpuset_cpus: self.cpuset_cpus.clone(),
            cpuset_mems: self.cpuset_mems.clone(),
            memory_limit: self.memory_limit,
            memory_soft_limit: self.memory_soft_limit,
            memory_swap_limit: self.memory_swap_limit,
            memory_swappiness: self.memory_swappiness,
            pids_max: self.pids_max,
        }
    }

    /// Command-line values win over file and environment values
    fn apply(&self, config: &mut Config) {
        if let Some(exec) = &self.exec {
            config.command.exec = Some(exec.clone());
            config.command.args = self.args.clone();
        } else if let Some((exec, args)) = self.trailing.split_first() {
            config.command.exec = Some(exec.clone());
            config.command.args = args.to_vec();
        } else if !self.args.is_empty() {
            config.command.args = self.args.clone();
        }

        if let Some(name) = &self.name {
            config.command.name = Some(name.clone());
        }

        config.limits = std::mem::take(&mut config.limits).merge(self.limits());

        if let Some(max) = self.max_restarts {
            config.supervisor.max_restarts = Some(max);
        }
        if self.attach_memory_only {
            config.supervisor.attach_all_controllers = false;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
    }

    /// Supervisor settings with sub-second flag durations applied
    fn supervisor_config(&self, config: &Config) -> SupervisorConfig {
        let mut settings = config.supervisor.to_supervisor_config();
        if let Some(cooldown) = self.cooldown {
            settings.cooldown = cooldown;
        }
        if let Some(grace) = self.stop_grace {
            settings.stop_grace = grace;
        }
        settings
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run(args)) => run(args).await,
        Some(Commands::Check(args)) => run_check(args),
        Some(Commands::GenerateConfig { output }) => generate_config(&output),
        None => run(cli.run).await,
    }
}

/// Apply limits and supervise until interrupted
async fn run(args: RunArgs) -> Result<()> {
    let config = load_config(&args)?;
    let _guard = init_logging(&config.logging)?;

    info!("cgkeeper v{} starting...", VERSION);

    let plan = logged(LaunchPlan::prepare(&config))?;
    let settings = args.supervisor_config(&config);
    info!(
        "Cooldown: {:?}, max restarts: {}",
        settings.cooldown,
        settings
            .max_restarts
            .map_or_else(|| "unlimited".to_string(), |n| n.to_string())
    );

    let shutdown = CancellationToken::new();
    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, stopping supervisor...");
                interrupt.cancel();
            }
            Err(e) => warn!("Failed to listen for interrupt: {}", e),
        }
    });

    let summary = logged(supervise(plan, settings, shutdown).await)?;
    info!(
        "cgkeeper finished: {} spawn(s), reason {:?}",
        summary.spawns, summary.reason
    );
    Ok(())
}

/// Validate everything and print the plan; no cgroup writes
fn run_check(args: RunArgs) -> Result<()> {
    let config = load_config(&args)?;
    let _guard = init_logging(&config.logging)?;

    let plan = logged(LaunchPlan::prepare(&config))?;
    if plan.command.is_none() {
        warn!("No command configured; `run` would refuse to start");
    }

    println!("{}", plan.render()?);
    Ok(())
}

/// Generate default configuration file
fn generate_config(output: &Path) -> Result<()> {
    let config = Config::default();
    config
        .save_to_file(output)
        .map_err(|e| anyhow!("Failed to save configuration file: {}", e))?;

    println!("Configuration written to {:?}", output);
    Ok(())
}

/// Load file + environment configuration, then apply command-line overrides
fn load_config(args: &RunArgs) -> Result<Config> {
    let mut config = Config::load(&args.config)
        .with_context(|| format!("Failed to load configuration from {:?}", args.config))?;

    args.apply(&mut config);

    config
        .validate()
        .map_err(|e| anyhow!("Configuration validation failed: {}", e))?;

    Ok(config)
}

fn logged<T>(result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

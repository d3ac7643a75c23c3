//! Restarting supervisor for a single cgroup-constrained child process
//!
//! Lifecycle of one run:
//!
//! ```text
//! Idle -> LimitsApplied -> Spawned -> Running -> Exited -> Sleeping -> Spawned -> ...
//!   \-> Failed (limit application error)
//! ```
//!
//! The child's pid is written to `cgroup.procs` only after every limit write
//! succeeded and the child was started. While a generation runs, SIGINT and
//! SIGTERM received by the supervisor are forwarded to it; the forwarding task
//! is cancelled and joined before the next generation is spawned.

use std::fmt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cgroups::{AttachScope, CgroupHandle};
use crate::executor::ProcessExecutor;
use crate::{Error, Result};

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5);
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// Program and arguments of the supervised child
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Restart policy and shutdown behaviour
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Pause between a child's exit and the next spawn
    pub cooldown: Duration,
    /// Restarts allowed after the first spawn; `None` restarts forever
    pub max_restarts: Option<u32>,
    /// Time a child gets to exit after SIGTERM on stop before SIGKILL
    pub stop_grace: Duration,
    /// Controllers the child's pid is written into
    pub attach_scope: AttachScope,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_COOLDOWN,
            max_restarts: None,
            stop_grace: DEFAULT_STOP_GRACE,
            attach_scope: AttachScope::AllControllers,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SupervisorState {
    Idle,
    LimitsApplied,
    Spawned,
    Running,
    Exited,
    Sleeping,
    Stopped,
    Failed,
}

/// Outcome of one child generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitRecord {
    pub generation: u32,
    pub pid: u32,
    /// Exit code, absent when the child died from a signal
    pub code: Option<i32>,
    /// Number of the terminating signal, if any
    pub signal: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub exited_at: DateTime<Utc>,
    /// Set when the exit status could not be obtained
    pub wait_error: Option<String>,
}

impl ExitRecord {
    fn from_wait(
        generation: u32,
        pid: u32,
        started_at: DateTime<Utc>,
        status: io::Result<ExitStatus>,
    ) -> Self {
        let (code, signal, wait_error) = match status {
            Ok(status) => (status.code(), status.signal(), None),
            Err(e) => (None, None, Some(e.to_string())),
        };

        Self {
            generation,
            pid,
            code,
            signal,
            started_at,
            exited_at: Utc::now(),
            wait_error,
        }
    }

    /// Terminating signal as a typed value
    pub fn terminating_signal(&self) -> Option<Signal> {
        self.signal.and_then(|s| Signal::try_from(s).ok())
    }

    pub fn killed(&self) -> bool {
        self.terminating_signal() == Some(Signal::SIGKILL)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    /// The stop token was cancelled
    Requested,
    /// `max_restarts` was used up
    RestartLimit,
}

/// What a finished supervisor run did
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorSummary {
    pub spawns: u32,
    pub exits: Vec<ExitRecord>,
    pub reason: StopReason,
}

/// Owns the lifecycle of exactly one child process
pub struct ProcessSupervisor {
    handle: CgroupHandle,
    command: CommandSpec,
    config: SupervisorConfig,
    stop: CancellationToken,
    state: watch::Sender<SupervisorState>,
}

impl ProcessSupervisor {
    pub fn new(handle: CgroupHandle, command: CommandSpec, config: SupervisorConfig) -> Self {
        Self {
            handle,
            command,
            config,
            stop: CancellationToken::new(),
            state: watch::channel(SupervisorState::Idle).0,
        }
    }

    /// Stop when `token` is cancelled instead of a private token
    pub fn with_stop_token(mut self, token: CancellationToken) -> Self {
        self.stop = token;
        self
    }

    /// Token that stops the supervisor when cancelled
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Current lifecycle state
    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition, usable while `run` owns the supervisor
    pub fn watch_state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    pub fn handle(&self) -> &CgroupHandle {
        &self.handle
    }

    /// Apply limits, then spawn and restart the child until stopped
    ///
    /// Limit, spawn and attach failures are returned as errors. The cgroup
    /// directories are torn down on every path out of this function.
    pub async fn run(mut self) -> Result<SupervisorSummary> {
        let result = self.supervise().await;

        if let Err(e) = self.handle.teardown() {
            warn!("Cgroup teardown incomplete: {}", e);
        }

        match &result {
            Ok(summary) => info!(
                "Supervisor stopped after {} spawn(s): {:?}",
                summary.spawns, summary.reason
            ),
            Err(e) => error!("Supervisor failed: {}", e),
        }
        result
    }

    async fn supervise(&mut self) -> Result<SupervisorSummary> {
        if let Err(e) = self.handle.apply_all() {
            self.transition(SupervisorState::Failed);
            return Err(e.into());
        }
        self.transition(SupervisorState::LimitsApplied);

        let mut exits = Vec::new();
        let mut spawns: u32 = 0;

        loop {
            if self.stop.is_cancelled() {
                return Ok(self.finish(spawns, exits, StopReason::Requested));
            }

            let (record, stopped) = self.run_generation(spawns).await?;
            spawns += 1;
            self.report(&record);
            exits.push(record);

            if stopped {
                return Ok(self.finish(spawns, exits, StopReason::Requested));
            }

            if self.config.max_restarts.is_some_and(|max| spawns > max) {
                info!("Restart limit reached ({} spawns)", spawns);
                return Ok(self.finish(spawns, exits, StopReason::RestartLimit));
            }

            self.transition(SupervisorState::Sleeping);
            tokio::select! {
                _ = sleep(self.config.cooldown) => {}
                _ = self.stop.cancelled() => {
                    return Ok(self.finish(spawns, exits, StopReason::Requested));
                }
            }

            info!("Restarting {}...", self.command);
        }
    }

    async fn run_generation(&mut self, generation: u32) -> Result<(ExitRecord, bool)> {
        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| Error::Spawn {
                command: self.command.to_string(),
                source,
            })?;
        let started_at = Utc::now();
        self.transition(SupervisorState::Spawned);

        let pid = match child.id() {
            Some(pid) => pid,
            None => {
                self.transition(SupervisorState::Failed);
                return Err(Error::Other(format!(
                    "{} exited before its pid could be read",
                    self.command
                )));
            }
        };
        info!("Spawned {} (pid {}, generation {})", self.command, pid, generation);

        if let Err(source) = self.handle.attach(pid, self.config.attach_scope) {
            error!("Attaching pid {} failed, killing it: {}", pid, source);
            if let Err(e) = child.kill().await {
                warn!("Failed to kill unattached pid {}: {}", pid, e);
            }
            self.transition(SupervisorState::Failed);
            return Err(Error::Attach { pid, source });
        }
        self.transition(SupervisorState::Running);

        let listener = self.stop.child_token();
        let forwarder = tokio::spawn(forward_signals(pid, listener.clone()));

        let (status, stopped) = tokio::select! {
            status = child.wait() => (status, false),
            _ = self.stop.cancelled() => {
                (stop_child(&mut child, pid, self.config.stop_grace).await, true)
            }
        };

        listener.cancel();
        if let Err(e) = forwarder.await {
            warn!("Signal forwarder for pid {} ended abnormally: {}", pid, e);
        }

        if let Err(e) = &status {
            warn!("Waiting for pid {} failed: {}", pid, e);
        }
        self.transition(SupervisorState::Exited);

        Ok((ExitRecord::from_wait(generation, pid, started_at, status), stopped))
    }

    fn report(&self, record: &ExitRecord) {
        match (record.terminating_signal(), record.code) {
            (Some(Signal::SIGKILL), _) => {
                info!("pid {} was killed by the system (SIGKILL)", record.pid)
            }
            (Some(signal), _) => info!("pid {} terminated by {}", record.pid, signal),
            (None, Some(code)) => info!("{} exited with code {}", self.command, code),
            (None, None) => info!("{} exited with unknown status", self.command),
        }
    }

    fn finish(
        &mut self,
        spawns: u32,
        exits: Vec<ExitRecord>,
        reason: StopReason,
    ) -> SupervisorSummary {
        self.transition(SupervisorState::Stopped);
        SupervisorSummary {
            spawns,
            exits,
            reason,
        }
    }

    fn transition(&mut self, next: SupervisorState) {
        let previous = self.state.send_replace(next);
        debug!("Supervisor state {:?} -> {:?}", previous, next);
    }
}

/// SIGTERM, then SIGKILL once `grace` has passed
async fn stop_child(child: &mut Child, pid: u32, grace: Duration) -> io::Result<ExitStatus> {
    info!("Stopping pid {}", pid);
    if let Err(e) = ProcessExecutor::send_signal(pid, Signal::SIGTERM) {
        warn!("{}", e);
    }

    match timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!("pid {} still running after {:?}, killing", pid, grace);
            child.kill().await?;
            child.wait().await
        }
    }
}

/// Forward SIGINT/SIGTERM to `pid` until `token` is cancelled
async fn forward_signals(pid: u32, token: CancellationToken) {
    let (mut interrupt, mut terminate, mut child_exit) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::child()),
    ) {
        (Ok(i), Ok(t), Ok(c)) => (i, t, c),
        _ => {
            warn!("Signal forwarding unavailable for pid {}", pid);
            return;
        }
    };

    loop {
        let forwarded = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            Some(()) = interrupt.recv() => Signal::SIGINT,
            Some(()) = terminate.recv() => Signal::SIGTERM,
            Some(()) = child_exit.recv() => {
                debug!("SIGCHLD while supervising pid {}", pid);
                continue;
            }
            else => break,
        };

        info!("Forwarding {} to pid {}", forwarded, pid);
        if let Err(e) = ProcessExecutor::send_signal(pid, forwarded) {
            warn!("{}", e);
        }
    }
}

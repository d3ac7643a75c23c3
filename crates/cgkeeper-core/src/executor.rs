use crate::{Error, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// Process signal executor
pub struct ProcessExecutor;

impl ProcessExecutor {
    /// Deliver `signal` to `pid`
    pub fn send_signal(pid: u32, signal: Signal) -> Result<()> {
        let process_pid = Self::to_pid(pid)?;

        kill(process_pid, signal).map_err(|e| {
            Error::Executor(format!("Failed to send {} to process {}: {}", signal, pid, e))
        })
    }

    // pid 0 and anything above i32::MAX would address a process group
    fn to_pid(pid: u32) -> Result<Pid> {
        match i32::try_from(pid) {
            Ok(raw) if raw > 0 => Ok(Pid::from_raw(raw)),
            _ => Err(Error::Executor(format!("Invalid pid {}", pid))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::Command;

    #[test]
    fn test_rejects_group_pids() {
        assert!(ProcessExecutor::send_signal(0, Signal::SIGTERM).is_err());
        assert!(ProcessExecutor::send_signal(u32::MAX, Signal::SIGTERM).is_err());
    }

    #[test]
    fn test_send_signal_terminates_child() {
        let mut child = Command::new("sleep")
            .arg("60")
            .spawn()
            .expect("Failed to spawn test process");

        ProcessExecutor::send_signal(child.id(), Signal::SIGTERM).unwrap();
        let status = child.wait().unwrap();

        assert_eq!(status.signal(), Some(Signal::SIGTERM as i32));
    }

    #[test]
    fn test_signal_nonexistent_process() {
        let result = ProcessExecutor::send_signal(999999, Signal::SIGTERM);
        assert!(result.is_err());
    }
}

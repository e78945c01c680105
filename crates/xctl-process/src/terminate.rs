//! Process-group termination.
//!
//! Both functions treat "no such process" as success: the goal is that
//! nothing in the group is left running, and an empty group satisfies it.

use tracing::debug;
use xctl_common::ProcessResult;

/// Ask every process in the group led by `pid` to exit (SIGTERM).
pub fn terminate_group(pid: u32) -> ProcessResult<()> {
    #[cfg(unix)]
    {
        signal_group(pid, nix::sys::signal::Signal::SIGTERM)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        Err(xctl_common::ProcessError::Unsupported {
            operation: "terminate_group".to_string(),
        })
    }
}

/// Force kill every process in the group led by `pid` (SIGKILL).
pub fn kill_group(pid: u32) -> ProcessResult<()> {
    #[cfg(unix)]
    {
        signal_group(pid, nix::sys::signal::Signal::SIGKILL)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        Err(xctl_common::ProcessError::Unsupported {
            operation: "kill_group".to_string(),
        })
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) -> ProcessResult<()> {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) => {
            debug!(pid, signal = %signal, "Signalled process group");
            Ok(())
        }
        Err(nix::errno::Errno::ESRCH) => {
            debug!(pid, signal = %signal, "Process group already gone");
            Ok(())
        }
        Err(e) => Err(xctl_common::ProcessError::signal_failed(
            pid,
            signal.as_str(),
            e.to_string(),
        )),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;

    #[test]
    fn test_kill_group_reaches_leader() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();

        kill_group(child.id()).unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn test_signal_missing_group_is_ok() {
        let mut child = std::process::Command::new("true")
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id();
        child.wait().unwrap();

        assert!(terminate_group(pid).is_ok());
        assert!(kill_group(pid).is_ok());
    }
}

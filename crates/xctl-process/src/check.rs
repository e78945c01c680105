//! Process existence checking.

use xctl_common::ProcessResult;

/// Check if a process with the given PID exists.
///
/// On Unix this uses `kill(pid, 0)`, which sends no signal but reports
/// whether the process exists. Zombies still count as existing until
/// they are reaped.
///
/// # Returns
///
/// * `Ok(true)` - Process exists
/// * `Ok(false)` - Process does not exist
/// * `Err(_)` - Existence could not be determined
pub fn process_exists(pid: u32) -> ProcessResult<bool> {
    #[cfg(unix)]
    {
        process_exists_unix(pid)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        Err(xctl_common::ProcessError::Unsupported {
            operation: "process_exists".to_string(),
        })
    }
}

#[cfg(unix)]
fn process_exists_unix(pid: u32) -> ProcessResult<bool> {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let nix_pid = Pid::from_raw(pid as i32);

    match kill(nix_pid, None) {
        Ok(_) => Ok(true),
        Err(nix::errno::Errno::ESRCH) => Ok(false),
        // Exists, but owned by someone else
        Err(nix::errno::Errno::EPERM) => Ok(true),
        Err(e) => Err(xctl_common::ProcessError::check_failed(
            pid,
            format!("Failed to check process: {}", e),
        )),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_exists() {
        assert!(process_exists(std::process::id()).unwrap());
    }

    #[test]
    fn test_reaped_child_does_not_exist() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!process_exists(pid).unwrap());
    }
}

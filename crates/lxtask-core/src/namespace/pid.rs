//! Liveness probing of processes living in another PID namespace.
//!
//! A container's init process is reparented inside its own PID namespace
//! and is never a child of the supervisor, so `waitpid(2)` cannot report
//! its exit. Delivering the null signal is the probe instead: the kernel
//! performs the permission and existence checks without sending anything.

use lxtask_common::error::{LxtaskError, Result};

/// Result of probing a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The process exists.
    Alive,
    /// No process with that identifier exists anymore.
    Gone,
}

/// Probes `pid` with the null signal.
///
/// `EPERM` means the process exists but belongs to someone else, so it
/// counts as alive.
///
/// # Errors
///
/// Returns an observation error for a non-positive PID or an unexpected
/// `kill(2)` failure.
#[cfg(target_os = "linux")]
pub fn probe(pid: i32) -> Result<Liveness> {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid <= 0 {
        return Err(LxtaskError::Observation {
            pid,
            message: "no init process recorded".into(),
        });
    }

    match kill(Pid::from_raw(pid), None) {
        Ok(()) | Err(Errno::EPERM) => Ok(Liveness::Alive),
        Err(Errno::ESRCH) => Ok(Liveness::Gone),
        Err(e) => Err(LxtaskError::Observation {
            pid,
            message: e.to_string(),
        }),
    }
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error, process probing requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn probe(pid: i32) -> Result<Liveness> {
    Err(LxtaskError::Observation {
        pid,
        message: "Linux required for native container operations".into(),
    })
}

/// Asks the process to terminate with `SIGTERM`.
///
/// A process that is already gone is not an error.
///
/// # Errors
///
/// Returns an observation error if the signal cannot be delivered.
#[cfg(target_os = "linux")]
pub fn terminate(pid: i32) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if pid <= 0 {
        return Err(LxtaskError::Observation {
            pid,
            message: "no init process recorded".into(),
        });
    }

    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => {
            tracing::debug!(pid, "sent SIGTERM");
            Ok(())
        }
        Err(e) => Err(LxtaskError::Observation {
            pid,
            message: format!("SIGTERM failed: {e}"),
        }),
    }
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error, signalling requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn terminate(pid: i32) -> Result<()> {
    Err(LxtaskError::Observation {
        pid,
        message: "Linux required for native container operations".into(),
    })
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        let pid = i32::try_from(std::process::id()).unwrap();
        assert_eq!(probe(pid).unwrap(), Liveness::Alive);
    }

    #[test]
    fn non_positive_pid_is_an_observation_error() {
        assert!(matches!(
            probe(0),
            Err(LxtaskError::Observation { pid: 0, .. })
        ));
        assert!(probe(-1).is_err());
    }

    #[test]
    fn reaped_child_is_gone() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = i32::try_from(child.id()).unwrap();
        let _ = child.wait().unwrap();
        assert_eq!(probe(pid).unwrap(), Liveness::Gone);
    }

    #[test]
    fn terminating_a_gone_process_is_not_an_error() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = i32::try_from(child.id()).unwrap();
        let _ = child.wait().unwrap();
        terminate(pid).unwrap();
    }
}

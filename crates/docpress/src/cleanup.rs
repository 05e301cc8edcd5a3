//! Best-effort termination of orphaned native processes.
//!
//! When a native call outlives its deadline the instance is evicted, but the
//! process behind it may still be running. The reaper terminates it by pid,
//! and only while the instance's [`ProcessToken`] still names that pid.

use std::time::Duration;

use crate::backend::ProcessToken;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReapError {
    #[error("process {0} not found")]
    NotFound(u32),
    #[error("refusing to signal process {0}")]
    Refused(u32),
    #[error("failed to signal process {pid}: {reason}")]
    Signal { pid: u32, reason: String },
    #[error("process termination is not supported on this platform")]
    Unsupported,
}

pub trait ProcessReaper: Send + Sync + 'static {
    /// Ask the process to terminate. Must not block for long.
    ///
    /// `owner` is cleared once the process has been waited on; after that
    /// the pid may belong to someone else and must not be signalled.
    fn terminate(&self, pid: u32, owner: &ProcessToken) -> Result<(), ReapError>;
}

/// Log-only wrapper: cleanup failures never reach the caller.
pub fn reap_best_effort(reaper: &dyn ProcessReaper, pid: u32, owner: &ProcessToken) {
    match reaper.terminate(pid, owner) {
        Ok(()) => tracing::info!(pid, "Terminated orphaned process"),
        Err(ReapError::NotFound(_)) => tracing::debug!(pid, "Orphaned process already gone"),
        Err(e) => tracing::warn!(pid, error = %e, "Failed to terminate orphaned process"),
    }
}

/// SIGTERM, then SIGKILL if the process is still owned after `grace`.
///
/// Signals go to the process group led by `pid` when there is one, so helper
/// processes spawned by the office application go down with it.
#[derive(Debug, Clone)]
pub struct SignalReaper {
    grace: Duration,
}

impl Default for SignalReaper {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl SignalReaper {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) -> nix::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg};
    use nix::unistd::Pid;

    let target = Pid::from_raw(pid as i32);
    match killpg(target, signal) {
        Err(Errno::ESRCH) => kill(target, signal),
        other => other,
    }
}

#[cfg(unix)]
impl ProcessReaper for SignalReaper {
    fn terminate(&self, pid: u32, owner: &ProcessToken) -> Result<(), ReapError> {
        use nix::errno::Errno;
        use nix::sys::signal::Signal;

        if pid <= 1 || pid == std::process::id() || i32::try_from(pid).is_err() {
            return Err(ReapError::Refused(pid));
        }
        if owner.current() != Some(pid) {
            return Err(ReapError::NotFound(pid));
        }

        match signal_group(pid, Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Err(ReapError::NotFound(pid)),
            Err(e) => {
                return Err(ReapError::Signal {
                    pid,
                    reason: e.to_string(),
                });
            }
        }

        let grace = self.grace;
        let owner = owner.clone();
        let spawned = std::thread::Builder::new()
            .name("docpress-reaper".to_string())
            .spawn(move || {
                std::thread::sleep(grace);
                if owner.current() == Some(pid) {
                    tracing::warn!(pid, "Process ignored SIGTERM - sending SIGKILL");
                    let _ = signal_group(pid, Signal::SIGKILL);
                }
            });
        if let Err(e) = spawned {
            tracing::warn!(pid, error = %e, "Failed to spawn SIGKILL follow-up");
        }
        Ok(())
    }
}

#[cfg(not(unix))]
impl ProcessReaper for SignalReaper {
    fn terminate(&self, _pid: u32, _owner: &ProcessToken) -> Result<(), ReapError> {
        Err(ReapError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn spawn(script: &str) -> std::process::Child {
        use std::os::unix::process::CommandExt;
        std::process::Command::new("sh")
            .args(["-c", script])
            .process_group(0)
            .spawn()
            .unwrap()
    }

    #[test]
    fn refuses_init_and_self() {
        let reaper = SignalReaper::default();
        let token = ProcessToken::new();
        assert_eq!(reaper.terminate(0, &token), Err(ReapError::Refused(0)));
        assert_eq!(reaper.terminate(1, &token), Err(ReapError::Refused(1)));
        let me = std::process::id();
        assert_eq!(reaper.terminate(me, &token), Err(ReapError::Refused(me)));
    }

    #[cfg(unix)]
    #[test]
    fn terminates_child_process() {
        let mut child = spawn("exec sleep 30");
        let token = ProcessToken::fixed(child.id());

        let reaper = SignalReaper::new(Duration::from_millis(100));
        reaper.terminate(child.id(), &token).unwrap();

        let status = child.wait().unwrap();
        assert!(!status.success());
    }

    #[cfg(unix)]
    #[test]
    fn kills_process_ignoring_sigterm_while_owned() {
        let mut child = spawn("trap '' TERM; exec sleep 30");
        std::thread::sleep(Duration::from_millis(200));
        let token = ProcessToken::fixed(child.id());

        let reaper = SignalReaper::new(Duration::from_millis(100));
        reaper.terminate(child.id(), &token).unwrap();

        let status = child.wait().unwrap();
        assert!(!status.success());
    }

    #[cfg(unix)]
    #[test]
    fn no_sigkill_once_token_released() {
        let mut child = spawn("trap '' TERM; exec sleep 30");
        std::thread::sleep(Duration::from_millis(200));
        let token = ProcessToken::fixed(child.id());

        let reaper = SignalReaper::new(Duration::from_millis(100));
        reaper.terminate(child.id(), &token).unwrap();
        token.clear();

        std::thread::sleep(Duration::from_millis(400));
        assert!(child.try_wait().unwrap().is_none());

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn unowned_pid_is_left_alone() {
        let mut child = spawn("exec sleep 30");
        let token = ProcessToken::new();

        let reaper = SignalReaper::default();
        assert_eq!(
            reaper.terminate(child.id(), &token),
            Err(ReapError::NotFound(child.id()))
        );
        assert!(child.try_wait().unwrap().is_none());

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn reaped_process_is_not_found_afterwards() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let reaper = SignalReaper::default();
        let token = ProcessToken::fixed(pid);
        assert_eq!(reaper.terminate(pid, &token), Err(ReapError::NotFound(pid)));
    }
}

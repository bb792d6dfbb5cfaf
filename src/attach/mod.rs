//! Ptrace-based quiescing of the target process
//!
//! Before probes are installed, every thread of the target must be stopped so
//! that no instrumentation races a fork or an in-flight call. The target may
//! keep spawning threads while we stop it, so attaching loops until one full
//! enumeration finds no thread that is not already stopped.

use std::collections::HashSet;
use std::thread::sleep;
use std::time::{Duration, Instant};

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid as NixPid;

use crate::domain::{CaptureError, Pid, Tid};
use crate::inspect;

/// Default time to wait for a single thread to report its ptrace stop.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_millis(1000);

/// Outcome of a single-thread attach attempt.
enum AttachOutcome {
    Stopped,
    /// The thread exited between enumeration and attach. Not an error.
    Vanished,
}

/// Stops and resumes all threads of one process.
///
/// `attach_and_stop` and `detach_and_resume` are idempotent with respect to
/// threads that have already exited.
pub struct AttachController {
    pid: Pid,
    halted: HashSet<Tid>,
    stop_timeout: Duration,
}

impl AttachController {
    #[must_use]
    pub fn new(pid: Pid) -> Self {
        Self { pid, halted: HashSet::new(), stop_timeout: DEFAULT_STOP_TIMEOUT }
    }

    #[must_use]
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Threads currently held in a ptrace stop.
    #[must_use]
    pub fn halted(&self) -> &HashSet<Tid> {
        &self.halted
    }

    /// Attach to every thread of the target and wait for each to stop.
    ///
    /// Loops over `/proc/<pid>/task` until a full enumeration finds zero new
    /// threads, so threads spawned mid-attach are caught. A thread that
    /// disappears between enumeration and attach is skipped.
    ///
    /// # Errors
    /// Any failure other than thread disappearance aborts the attach; threads
    /// stopped so far are resumed before the error is returned.
    pub fn attach_and_stop(&mut self) -> Result<(), CaptureError> {
        loop {
            let tids = inspect::list_threads(self.pid)?;
            let mut new_stops = 0usize;

            for tid in tids {
                if self.halted.contains(&tid) {
                    continue;
                }
                match self.attach_one(tid) {
                    Ok(AttachOutcome::Stopped) => {
                        self.halted.insert(tid);
                        new_stops += 1;
                    }
                    Ok(AttachOutcome::Vanished) => {
                        debug!("thread {tid} vanished during attach");
                    }
                    Err(err) => {
                        self.detach_and_resume();
                        return Err(err);
                    }
                }
            }

            if new_stops == 0 {
                break;
            }
        }
        debug!("attached and stopped {} threads of {}", self.halted.len(), self.pid);
        Ok(())
    }

    /// Detach from every halted thread, resuming it. Threads that exited
    /// while stopped are tolerated.
    pub fn detach_and_resume(&mut self) {
        for tid in self.halted.drain() {
            match ptrace::detach(NixPid::from_raw(tid.0 as i32), None) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(err) => warn!("detaching from thread {tid}: {err}"),
            }
        }
    }

    fn attach_one(&self, tid: Tid) -> Result<AttachOutcome, CaptureError> {
        let nix_tid = NixPid::from_raw(tid.0 as i32);
        match ptrace::attach(nix_tid) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Ok(AttachOutcome::Vanished),
            Err(Errno::EPERM) => {
                return Err(CaptureError::PermissionDenied(format!(
                    "ptrace attach to thread {tid}"
                )))
            }
            Err(err) => {
                return Err(CaptureError::AttachFailed { tid: tid.0, reason: err.to_string() })
            }
        }
        self.wait_for_stop(tid)
    }

    /// Wait for the attach-induced stop with a per-thread deadline.
    fn wait_for_stop(&self, tid: Tid) -> Result<AttachOutcome, CaptureError> {
        let nix_tid = NixPid::from_raw(tid.0 as i32);
        let deadline = Instant::now() + self.stop_timeout;
        let flags = WaitPidFlag::WNOHANG | WaitPidFlag::__WALL;

        loop {
            match waitpid(nix_tid, Some(flags)) {
                Ok(WaitStatus::Stopped(_, _)) | Ok(WaitStatus::PtraceEvent(_, _, _)) => {
                    return Ok(AttachOutcome::Stopped)
                }
                Ok(WaitStatus::Exited(_, _)) | Ok(WaitStatus::Signaled(_, _, _)) => {
                    return Ok(AttachOutcome::Vanished)
                }
                Ok(_) => {}
                Err(Errno::ESRCH) | Err(Errno::ECHILD) => return Ok(AttachOutcome::Vanished),
                Err(err) => {
                    return Err(CaptureError::AttachFailed { tid: tid.0, reason: err.to_string() })
                }
            }

            if Instant::now() >= deadline {
                return Err(CaptureError::AttachFailed {
                    tid: tid.0,
                    reason: format!("no stop within {:?}", self.stop_timeout),
                });
            }
            sleep(Duration::from_millis(1));
        }
    }
}

impl Drop for AttachController {
    fn drop(&mut self) {
        if !self.halted.is_empty() {
            self.detach_and_resume();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_gone_process() {
        let mut controller = AttachController::new(Pid(-1));
        assert!(matches!(controller.attach_and_stop(), Err(CaptureError::ProcessGone(_))));
    }

    #[test]
    fn test_detach_empty_is_noop() {
        let mut controller = AttachController::new(Pid(1));
        controller.detach_and_resume();
        assert!(controller.halted().is_empty());
    }
}

//! # Task and thread handles
//!
//! A [`Task`] is a reference to a process we inspect; a [`ThreadId`] names a
//! kernel thread inside it. Neither owns the underlying process: the caller
//! controls its lifetime. "This task is the calling process" is recognized
//! everywhere and switches to cheaper code paths that need no ptrace
//! attachment.
//!
//! [`SuspendGuard`] stops every thread of a target for as long as it lives,
//! the strongly recommended pattern while inspecting a process that is not
//! the calling one.

use std::path::PathBuf;

use nix::sys::ptrace;
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::{gettid, Pid};
use tracing::{debug, warn};

use crate::errors::{Result, TraceError};

/// An inspectable process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Task {
    pid: Pid,
}

/// A kernel thread within a [`Task`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(Pid);

impl Task {
    #[must_use]
    pub fn new(pid: Pid) -> Self {
        Task { pid }
    }

    /// The calling process itself
    #[must_use]
    pub fn current() -> Self {
        Task { pid: Pid::this() }
    }

    /// Whether this task refers to the calling process
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.pid == Pid::this()
    }

    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[must_use]
    pub fn raw_pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// Enumerates the task's threads from `/proc/<pid>/task`, sorted by tid
    ///
    /// # Errors
    ///
    /// Fails if the procfs directory cannot be read, typically because the
    /// process exited or access was denied.
    pub fn threads(&self) -> Result<Vec<ThreadId>> {
        let dir = format!("/proc/{}/task", self.pid);
        let mut tids = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(tid) = entry
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<i32>().ok())
            {
                tids.push(ThreadId(Pid::from_raw(tid)));
            }
        }
        tids.sort_unstable();
        Ok(tids)
    }

    /// Path of the main executable, from `/proc/<pid>/exe`
    ///
    /// # Errors
    ///
    /// Fails if the link cannot be read.
    pub fn exe_path(&self) -> Result<PathBuf> {
        Ok(std::fs::read_link(format!("/proc/{}/exe", self.pid))?)
    }
}

impl ThreadId {
    #[must_use]
    pub fn from_raw(tid: i32) -> Self {
        ThreadId(Pid::from_raw(tid))
    }

    /// The calling thread
    #[must_use]
    pub fn current() -> Self {
        ThreadId(gettid())
    }

    #[must_use]
    pub fn raw(&self) -> i32 {
        self.0.as_raw()
    }

    pub(crate) fn pid(&self) -> Pid {
        self.0
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Keeps every thread of a target stopped until dropped
///
/// Attaches to each thread with ptrace and waits for it to stop. Threads
/// spawned after the attach pass are caught by one follow-up sweep; a target
/// that keeps spawning threads faster than we attach is not defended against.
#[derive(Debug)]
pub struct SuspendGuard {
    attached: Vec<ThreadId>,
}

impl SuspendGuard {
    /// Suspends all threads of `task`
    ///
    /// # Errors
    ///
    /// [`TraceError::SuspendSelf`] when `task` is the calling process; an OS
    /// error when attaching fails (permissions, vanished process). On error,
    /// any thread already attached is detached again.
    pub fn attach(task: Task) -> Result<Self> {
        if task.is_current() {
            return Err(TraceError::SuspendSelf);
        }

        let mut guard = SuspendGuard {
            attached: Vec::new(),
        };

        // two sweeps so threads spawned during the first one get stopped too
        for _ in 0..2 {
            for tid in task.threads()? {
                if guard.attached.contains(&tid) {
                    continue;
                }
                match attach_and_wait(tid) {
                    Ok(()) => guard.attached.push(tid),
                    Err(e) => {
                        // the thread may have exited between readdir and attach
                        debug!("could not attach to thread {tid}: {e}");
                    }
                }
            }
        }

        if guard.attached.is_empty() {
            return Err(TraceError::Os(nix::Error::ESRCH));
        }
        Ok(guard)
    }

    /// The threads this guard holds stopped
    #[must_use]
    pub fn threads(&self) -> &[ThreadId] {
        &self.attached
    }

    pub(crate) fn holds(&self, tid: ThreadId) -> bool {
        self.attached.contains(&tid)
    }
}

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        for tid in &self.attached {
            if let Err(e) = ptrace::detach(tid.pid(), None) {
                warn!("could not detach from thread {tid}: {e}");
            }
        }
    }
}

fn attach_and_wait(tid: ThreadId) -> Result<()> {
    ptrace::attach(tid.pid())?;
    match waitpid(tid.pid(), Some(WaitPidFlag::__WALL)) {
        Ok(_) => Ok(()),
        Err(e) => {
            let _ = ptrace::detach(tid.pid(), None);
            Err(e.into())
        }
    }
}

/// Runs `f` with `tid` stopped, attaching transiently when `already_stopped`
/// is false
pub(crate) fn with_stopped_thread<T>(
    tid: ThreadId,
    already_stopped: bool,
    f: impl FnOnce(ThreadId) -> Result<T>,
) -> Result<T> {
    if already_stopped {
        return f(tid);
    }
    attach_and_wait(tid)?;
    let out = f(tid);
    if let Err(e) = ptrace::detach(tid.pid(), None) {
        warn!("could not detach from thread {tid}: {e}");
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_current_task_is_recognized() {
        let task = Task::current();
        assert!(task.is_current());
        assert!(!Task::new(Pid::from_raw(1)).is_current());
    }

    #[test]
    fn test_thread_enumeration_includes_calling_thread() {
        let tids = Task::current().threads().unwrap();
        assert!(tids.contains(&ThreadId::current()));
    }

    #[test]
    fn test_suspending_self_is_rejected() {
        let err = SuspendGuard::attach(Task::current()).unwrap_err();
        assert!(matches!(err, TraceError::SuspendSelf));
    }

    #[test]
    fn test_exe_path_of_self() {
        let exe = Task::current().exe_path().unwrap();
        assert!(exe.is_absolute());
    }
}

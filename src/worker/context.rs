use std::{
    collections::HashSet,
    io,
    process::{Child, Command, ExitStatus, Output, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use log::{debug, warn};

use crate::models::task::TaskId;
use crate::utils::lock;

/// A cancellation flag polled by work closures at safe points.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Handed to work closures. Child processes launched through it are killed
/// when the owning task is terminated.
#[derive(Debug, Clone)]
pub struct TaskContext {
    id: TaskId,
    cancel: CancelToken,
    children: Arc<Mutex<HashSet<u32>>>,
}

impl TaskContext {
    pub(crate) fn new(id: TaskId) -> Self {
        Self {
            id,
            cancel: CancelToken::new(),
            children: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Spawns `command` and tracks its pid until [`TaskContext::wait`] reaps it.
    pub fn spawn(&self, command: &mut Command) -> io::Result<Child> {
        if self.is_cancelled() {
            return Err(cancelled_error());
        }
        let child = command.spawn()?;
        let pid = child.id();
        let mut children = lock(&self.children);
        children.insert(pid);
        // terminate() cancels before it takes the lock, so either it sees the
        // pid or we see the flag here.
        if self.is_cancelled() {
            children.remove(&pid);
            drop(children);
            kill_pid(self.id, pid);
            return Err(cancelled_error());
        }
        debug!("Task '{}' launched child process {}.", self.id, pid);
        Ok(child)
    }

    pub fn wait(&self, mut child: Child) -> io::Result<ExitStatus> {
        let pid = child.id();
        let status = child.wait();
        lock(&self.children).remove(&pid);
        status
    }

    /// Runs `command` to completion with captured stdout and stderr.
    pub fn output(&self, command: &mut Command) -> io::Result<Output> {
        let child = self.spawn(
            command
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped()),
        )?;
        let pid = child.id();
        let output = child.wait_with_output();
        lock(&self.children).remove(&pid);
        output
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Kills every tracked child. Returns how many kill signals were sent.
    pub(crate) fn kill_children(&self) -> usize {
        let pids: Vec<u32> = lock(&self.children).drain().collect();
        let count = pids.len();
        for pid in pids {
            kill_pid(self.id, pid);
        }
        count
    }

    #[cfg(test)]
    pub(crate) fn tracked_children(&self) -> usize {
        lock(&self.children).len()
    }
}

fn cancelled_error() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "task was cancelled")
}

#[cfg(unix)]
fn kill_pid(task: TaskId, pid: u32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        warn!("Task '{}': pid {} out of range, not killed.", task, pid);
        return;
    };
    let rc = unsafe { libc::kill(pid, libc::SIGKILL) };
    if rc == 0 {
        debug!("Task '{}': killed child process {}.", task, pid);
    } else {
        debug!(
            "Task '{}': kill({}) failed: {}",
            task,
            pid,
            io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn kill_pid(task: TaskId, pid: u32) {
    warn!(
        "Task '{}': forced kill of child process {} is not supported on this platform.",
        task, pid
    );
}

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Terminated,
}

impl TaskStatus {
    /// Whether the task will never run work or callbacks again.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Terminated
        )
    }
}

/// What a finished task surfaces to its listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Work returned. Carries the exit code if the work reported one.
    Completed(Option<i32>),
    /// Work panicked; the panic payload rendered as text.
    Failed(String),
    Terminated,
}

impl TaskOutcome {
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskOutcome::Completed(_) => TaskStatus::Completed,
            TaskOutcome::Failed(_) => TaskStatus::Failed,
            TaskOutcome::Terminated => TaskStatus::Terminated,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            TaskOutcome::Completed(code) => *code,
            _ => None,
        }
    }

    /// A completed task without an exit code, or with exit code 0.
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Completed(None) | TaskOutcome::Completed(Some(0)))
    }
}

/// Registry partition key. Lane 0 carries mutating work, lane 1 read-only queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Lane(pub u8);

impl Lane {
    pub const SERIAL: Lane = Lane(0);
    pub const CONCURRENT: Lane = Lane(1);
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

use std::{
    fmt, mem,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::Duration,
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};

use super::{
    context::TaskContext,
    dispatcher::{panic_message, run_guarded, Dispatcher},
};
use crate::error::TaskError;
use crate::models::task::{TaskId, TaskOutcome, TaskStatus};
use crate::utils::lock;

type WorkFn = Box<dyn FnOnce(&TaskContext) -> Option<i32> + Send + 'static>;
type StartFn = Box<dyn FnOnce() + Send + 'static>;
type FinishFn = Box<dyn FnOnce(&TaskOutcome) + Send + 'static>;

struct State {
    status: TaskStatus,
    work: Option<WorkFn>,
    on_start: Vec<StartFn>,
    on_finish: Vec<FinishFn>,
    outcome: Option<TaskOutcome>,
    dispatcher: Dispatcher,
    // Never sent on. Dropping it wakes every joiner with `Disconnected`.
    done: Option<Sender<()>>,
}

struct Inner {
    id: TaskId,
    state: Mutex<State>,
    done_rx: Receiver<()>,
    context: TaskContext,
}

/// A unit of background work running on its own thread.
///
/// `Task` is a cheap handle; clones refer to the same task. Start callbacks
/// run on the thread calling [`Task::start`], before the work is spawned.
/// Finish callbacks run through the task's [`Dispatcher`] after the work
/// returns or panics, and are skipped when the task is terminated.
#[derive(Clone)]
pub struct Task {
    inner: Arc<Inner>,
}

impl Task {
    pub fn new<F>(work: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_context(move |_| {
            work();
            None
        })
    }

    /// Like [`Task::new`], but the work sees its [`TaskContext`] and may
    /// report an exit code.
    pub fn with_context<F>(work: F) -> Self
    where
        F: FnOnce(&TaskContext) -> Option<i32> + Send + 'static,
    {
        let id = TaskId::next();
        let (done_tx, done_rx) = bounded(0);
        debug!("Task '{}' created.", id);
        Task {
            inner: Arc::new(Inner {
                id,
                state: Mutex::new(State {
                    status: TaskStatus::Pending,
                    work: Some(Box::new(work)),
                    on_start: Vec::new(),
                    on_finish: Vec::new(),
                    outcome: None,
                    dispatcher: Dispatcher::Inline,
                    done: Some(done_tx),
                }),
                done_rx,
                context: TaskContext::new(id),
            }),
        }
    }

    /// Routes finish callbacks through `dispatcher` instead of running them
    /// on the worker thread.
    pub fn dispatch_to(self, dispatcher: Dispatcher) -> Self {
        {
            let mut state = self.inner.lock();
            if state.status == TaskStatus::Pending {
                state.dispatcher = dispatcher;
            } else {
                warn!("Task '{}' already started, dispatcher unchanged.", self.inner.id);
            }
        }
        self
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.lock().status
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_finished()
    }

    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.inner.lock().outcome.clone()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.outcome().and_then(|outcome| outcome.exit_code())
    }

    pub fn on_start<F>(&self, callback: F) -> &Self
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.lock();
        if state.status == TaskStatus::Pending {
            state.on_start.push(Box::new(callback));
        } else {
            warn!(
                "Task '{}' is already {:?}, start callback ignored.",
                self.inner.id, state.status
            );
        }
        self
    }

    pub fn on_finish<F>(&self, callback: F) -> &Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_outcome(move |_| callback())
    }

    /// Finish callback receiving the outcome. Same ordering as [`Task::on_finish`].
    pub fn on_outcome<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(&TaskOutcome) + Send + 'static,
    {
        let mut state = self.inner.lock();
        if state.status.is_finished() {
            warn!(
                "Task '{}' is already {:?}, finish callback ignored.",
                self.inner.id, state.status
            );
        } else {
            state.on_finish.push(Box::new(callback));
        }
        self
    }

    pub fn start(&self) -> Result<(), TaskError> {
        let id = self.inner.id;
        let (work, on_start) = {
            let mut state = self.inner.lock();
            let work = match (state.status, state.work.take()) {
                (TaskStatus::Pending, Some(work)) => work,
                (_, work) => {
                    state.work = work;
                    return Err(TaskError::AlreadyStarted(id));
                }
            };
            state.status = TaskStatus::Running;
            (work, mem::take(&mut state.on_start))
        };

        info!("Starting task '{}'.", id);
        for callback in on_start {
            run_guarded(id, callback);
        }

        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name(format!("task-{}", id))
            .spawn(move || {
                let context = inner.context.clone();
                let outcome = match panic::catch_unwind(AssertUnwindSafe(|| work(&context))) {
                    Ok(code) => TaskOutcome::Completed(code),
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        error!("Task '{}' failed: {}", inner.id, message);
                        TaskOutcome::Failed(message)
                    }
                };
                inner.finish(outcome);
            });

        match spawned {
            Ok(_) => Ok(()),
            Err(source) => {
                error!("Failed to spawn worker for task '{}': {}", id, source);
                self.inner
                    .finish(TaskOutcome::Failed(format!("worker thread not spawned: {}", source)));
                Err(TaskError::Spawn { id, source })
            }
        }
    }

    /// Blocks until the work has returned and its finish callbacks were handed
    /// to the dispatcher, or until the task is terminated.
    ///
    /// Returns at once for a task that was never started. Calling it from the
    /// task's own work deadlocks.
    pub fn join(&self) {
        if self.status() == TaskStatus::Pending {
            warn!("Join on task '{}' that was never started.", self.inner.id);
            return;
        }
        // Err(Disconnected) is the completion signal.
        let _ = self.inner.done_rx.recv();
    }

    /// [`Task::join`] with a deadline. Returns whether the task finished.
    pub fn join_timeout(&self, timeout: Duration) -> bool {
        if self.status() == TaskStatus::Pending {
            return false;
        }
        match self.inner.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }

    /// Forcibly stops a running task.
    ///
    /// Trips the cancellation token, kills child processes launched through
    /// the task's context and releases joiners. Finish callbacks never run.
    /// The worker thread cannot be killed and is left to return on its own.
    /// Returns `false` (and does nothing) for pending or finished tasks.
    pub fn terminate(&self) -> bool {
        let id = self.inner.id;
        let done = {
            let mut state = self.inner.lock();
            if state.status != TaskStatus::Running {
                debug!("Terminate on task '{}' in state {:?} ignored.", id, state.status);
                return false;
            }
            state.status = TaskStatus::Terminated;
            state.outcome = Some(TaskOutcome::Terminated);
            state.on_finish.clear();
            state.done.take()
        };

        self.inner.context.cancel();
        let killed = self.inner.context.kill_children();
        drop(done);
        info!("Task '{}' terminated, {} child processes killed.", id, killed);
        true
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    fn finish(&self, outcome: TaskOutcome) {
        let (callbacks, dispatcher, done) = {
            let mut state = self.lock();
            if state.status == TaskStatus::Terminated {
                debug!("Task '{}' returned after termination, result dropped.", self.id);
                return;
            }
            state.status = outcome.status();
            state.outcome = Some(outcome.clone());
            (
                mem::take(&mut state.on_finish),
                state.dispatcher.clone(),
                state.done.take(),
            )
        };
        info!("Task '{}' finished: {:?}", self.id, outcome);

        if !callbacks.is_empty() {
            let id = self.id;
            let job = Box::new(move || {
                for callback in callbacks {
                    let outcome = outcome.clone();
                    run_guarded(id, Box::new(move || callback(&outcome)));
                }
            });
            if let Err(e) = dispatcher.dispatch(id, job) {
                error!("{}", e);
            }
        }
        drop(done);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use super::Notices;
use crate::error::{EnvError, TaskError};
use crate::manager::registry::TaskRegistry;
use crate::models::task::{Lane, TaskOutcome};
use crate::utils::lock;
use crate::worker::{context::TaskContext, dispatcher::Dispatcher, task::Task};

/// Exit code a work result maps to.
pub(crate) trait Verdict {
    fn exit_code(&self) -> Option<i32>;
}

impl Verdict for i32 {
    fn exit_code(&self) -> Option<i32> {
        Some(*self)
    }
}

impl Verdict for Vec<(String, bool)> {
    fn exit_code(&self) -> Option<i32> {
        Some(i32::from(self.iter().any(|(_, ok)| !ok)))
    }
}

impl Verdict for Vec<PathBuf> {
    fn exit_code(&self) -> Option<i32> {
        Some(0)
    }
}

impl<T> Verdict for Result<T, EnvError> {
    fn exit_code(&self) -> Option<i32> {
        Some(i32::from(self.is_err()))
    }
}

/// Launch bookkeeping shared by the controllers: registry, busy flag,
/// activity text and the notice queue.
///
/// Work closures only compute. Their result is handed to the finish callback,
/// which applies it on the thread pumping the event loop, so a terminated
/// task never publishes anything.
pub(crate) struct Runner {
    name: &'static str,
    registry: TaskRegistry,
    dispatcher: Dispatcher,
    busy: Arc<AtomicBool>,
    activity: Arc<Mutex<Option<String>>>,
    notices: Notices,
}

impl Runner {
    pub(crate) fn new(name: &'static str, registry: TaskRegistry, dispatcher: Dispatcher, notices: Notices) -> Self {
        Runner {
            name,
            registry,
            dispatcher,
            busy: Arc::new(AtomicBool::new(false)),
            activity: Arc::new(Mutex::new(None)),
            notices,
        }
    }

    pub(crate) fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub(crate) fn notices(&self) -> &Notices {
        &self.notices
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub(crate) fn activity(&self) -> Option<String> {
        lock(&self.activity).clone()
    }

    pub(crate) fn ensure_idle(&self) -> Result<(), TaskError> {
        if self.is_busy() {
            return Err(TaskError::Busy(self.name));
        }
        Ok(())
    }

    /// Registers and starts one operation.
    pub(crate) fn launch<R, W, A>(&self, lane: Lane, activity: &str, work: W, apply: A) -> Result<Task, TaskError>
    where
        R: Verdict + Send + 'static,
        W: FnOnce(&TaskContext) -> R + Send + 'static,
        A: FnOnce(R) + Send + 'static,
    {
        self.ensure_idle()?;
        let task = self.prepare(activity, work, apply);
        self.registry.put(task.clone(), lane)?;
        task.start()?;
        Ok(task)
    }

    /// Builds a task with the busy/activity hooks, without registering it.
    pub(crate) fn prepare<R, W, A>(&self, activity: &str, work: W, apply: A) -> Task
    where
        R: Verdict + Send + 'static,
        W: FnOnce(&TaskContext) -> R + Send + 'static,
        A: FnOnce(R) + Send + 'static,
    {
        let slot: Arc<Mutex<Option<R>>> = Arc::new(Mutex::new(None));
        let filled = Arc::clone(&slot);
        let task = Task::with_context(move |ctx| {
            let result = work(ctx);
            let code = result.exit_code();
            *lock(&filled) = Some(result);
            code
        })
        .dispatch_to(self.dispatcher.clone());

        let busy = Arc::clone(&self.busy);
        let current = Arc::clone(&self.activity);
        let text = format!("{}...", activity);
        task.on_start(move || {
            busy.store(true, Ordering::SeqCst);
            *lock(&current) = Some(text);
        });

        let busy = Arc::clone(&self.busy);
        let current = Arc::clone(&self.activity);
        let notices = self.notices.clone();
        let label = activity.to_string();
        task.on_outcome(move |outcome| {
            *lock(&current) = None;
            busy.store(false, Ordering::SeqCst);
            if let TaskOutcome::Failed(reason) = outcome {
                notices.push(format!("{} failed: {}", label, reason));
            }
            let result = lock(&slot).take();
            if let Some(result) = result {
                apply(result);
            }
        });
        task
    }

    pub(crate) fn stop_all(&self) -> usize {
        let stopped = self.registry.stop_all();
        self.reset();
        stopped
    }

    pub(crate) fn kill_all(&self) -> usize {
        let killed = self.registry.kill_all();
        self.reset();
        killed
    }

    fn reset(&self) {
        // finish callbacks of terminated tasks never run
        self.busy.store(false, Ordering::SeqCst);
        *lock(&self.activity) = None;
    }
}

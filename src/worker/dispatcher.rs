use std::{
    any::Any,
    cell::Cell,
    panic::{self, AssertUnwindSafe},
    time::Duration,
};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{error, warn};

use crate::error::TaskError;
use crate::models::{
    message::{Job, UiMessage},
    task::TaskId,
};

/// Where finish callbacks are executed.
#[derive(Debug, Clone, Default)]
pub enum Dispatcher {
    /// On the worker thread, right after the work returns.
    #[default]
    Inline,
    /// Posted to an [`EventLoop`] and run by whichever thread pumps it.
    Queued(Sender<UiMessage>),
}

impl Dispatcher {
    pub fn dispatch(&self, id: TaskId, job: Job) -> Result<(), TaskError> {
        match self {
            Dispatcher::Inline => {
                run_guarded(id, job);
                Ok(())
            }
            Dispatcher::Queued(sender) => sender
                .send(UiMessage::Invoke(id, job))
                .map_err(|_| TaskError::DispatcherClosed(id)),
        }
    }
}

/// The UI-affinity side of [`Dispatcher::Queued`]. Whoever owns it owns the UI
/// thread: every job it runs executes on the thread calling `pump`/`run`.
pub struct EventLoop {
    sender: Sender<UiMessage>,
    receiver: Receiver<UiMessage>,
    quit: Cell<bool>,
}

impl EventLoop {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        EventLoop {
            sender,
            receiver,
            quit: Cell::new(false),
        }
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::Queued(self.sender.clone())
    }

    /// Sender usable from any thread to stop [`EventLoop::run`].
    pub fn quit_sender(&self) -> Sender<UiMessage> {
        self.sender.clone()
    }

    pub fn quit_requested(&self) -> bool {
        self.quit.get()
    }

    /// Runs every job already queued without blocking. Returns the number run.
    pub fn pump(&self) -> usize {
        let mut ran = 0;
        loop {
            match self.receiver.try_recv() {
                Ok(message) => {
                    if self.handle(message) {
                        ran += 1;
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return ran,
            }
        }
    }

    /// Waits up to `timeout` for the first job, then drains the queue.
    pub fn pump_timeout(&self, timeout: Duration) -> usize {
        match self.receiver.recv_timeout(timeout) {
            Ok(message) => usize::from(self.handle(message)) + self.pump(),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => 0,
        }
    }

    /// Blocks running jobs until a [`UiMessage::Quit`] arrives.
    pub fn run(&self) {
        while !self.quit.get() {
            match self.receiver.recv() {
                Ok(message) => {
                    self.handle(message);
                }
                Err(e) => {
                    error!("Event loop channel failed: {}", e);
                    break;
                }
            }
        }
    }

    fn handle(&self, message: UiMessage) -> bool {
        match message {
            UiMessage::Invoke(id, job) => {
                run_guarded(id, job);
                true
            }
            UiMessage::Quit => {
                self.quit.set(true);
                false
            }
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        let pending = self.receiver.len();
        if pending > 0 {
            warn!("Event loop dropped with {} pending callbacks.", pending);
        }
    }
}

/// Runs a callback, logging instead of unwinding if it panics.
pub(crate) fn run_guarded(id: TaskId, job: Job) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        error!(
            "Callback of task '{}' panicked: {}",
            id,
            panic_message(payload.as_ref())
        );
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

use std::fmt;

use super::task::TaskId;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Messages posted to the UI-affinity event loop.
pub enum UiMessage {
    Invoke(TaskId, Job),
    Quit,
}

impl fmt::Debug for UiMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UiMessage::Invoke(id, _) => f.debug_tuple("Invoke").field(id).finish(),
            UiMessage::Quit => f.write_str("Quit"),
        }
    }
}

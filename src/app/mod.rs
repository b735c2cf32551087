pub mod cli;
pub mod context;
pub mod freezer;
pub mod package_manager;
pub(crate) mod runner;

use std::sync::{Arc, Mutex};

use crate::utils::lock;

/// Messages for the user, queued by controllers and shown by the front-end.
#[derive(Debug, Clone, Default)]
pub struct Notices(Arc<Mutex<Vec<String>>>);

impl Notices {
    pub fn push(&self, message: impl Into<String>) {
        lock(&self.0).push(message.into());
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *lock(&self.0))
    }
}

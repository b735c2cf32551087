//! Background tasks for a desktop front-end to Python tooling.
//!
//! A [`Task`] runs one unit of work on its own thread, with start callbacks
//! on the launching thread and finish callbacks delivered through a
//! [`Dispatcher`]. A [`TaskRegistry`] keeps track of what a controller has
//! launched so it can answer "is anything still running" and stop it all.

pub mod app;
pub mod config;
pub mod env;
pub mod error;
pub mod manager;
pub mod models;
mod utils;
pub mod worker;

pub use manager::registry::{OverflowPolicy, TaskRegistry};
pub use models::task::{Lane, TaskId, TaskOutcome, TaskStatus};
pub use worker::context::{CancelToken, TaskContext};
pub use worker::dispatcher::{Dispatcher, EventLoop};
pub use worker::task::Task;

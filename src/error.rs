use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::models::task::{Lane, TaskId};

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("task {0} was already started")]
    AlreadyStarted(TaskId),

    #[error("failed to spawn worker thread for task {id}: {source}")]
    Spawn {
        id: TaskId,
        #[source]
        source: io::Error,
    },

    #[error("registry is full ({capacity} live tasks), task {id} rejected from lane {lane}")]
    CapacityExhausted {
        id: TaskId,
        lane: Lane,
        capacity: usize,
    },

    #[error("event loop is gone, callbacks for task {0} dropped")]
    DispatcherClosed(TaskId),

    #[error("{0} is busy with another task")]
    Busy(&'static str),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot access config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid TOML config: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("cannot serialize TOML config: {0}")]
    TomlWrite(#[from] toml::ser::Error),

    #[error("invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum EnvError {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {code:?}: {stderr}")]
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("unexpected output from package manager: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("cancelled")]
    Cancelled,

    #[error("no interpreter configured")]
    NoInterpreter,

    #[error("no program entry configured")]
    NoEntry,

    #[error("no project directory configured")]
    NoProject,

    #[error("project directory {0} does not exist")]
    MissingProject(PathBuf),

    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{0} did not complete")]
    Incomplete(&'static str),
}

#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("mirror name is empty")]
    EmptyName,

    #[error("mirror URL is empty")]
    EmptyUrl,

    #[error("'{0}' is not a valid index URL")]
    InvalidUrl(String),

    #[error("a mirror named '{0}' already exists")]
    Duplicate(String),

    #[error("no mirror named '{0}'")]
    Unknown(String),
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Env(#[from] EnvError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Mirror(#[from] MirrorError),
}

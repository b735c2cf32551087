//! Persistent settings, stored as TOML (or JSON when the file ends in `.json`).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::env::index::Mirrors;
use crate::error::ConfigError;
use crate::manager::registry::{OverflowPolicy, DEFAULT_CAPACITY};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub packages: PackagesConfig,

    #[serde(default)]
    pub freeze: FreezeConfig,

    /// Named package-index mirrors
    #[serde(default)]
    pub mirrors: Mirrors,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Maximum number of live tasks a controller tracks
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    #[serde(default)]
    pub overflow: OverflowPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// One of error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log to this file instead of stderr
    #[serde(default)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PackagesConfig {
    /// Interpreters the package manager knows about
    #[serde(default)]
    pub interpreters: Vec<PathBuf>,

    /// Mirror used instead of the default package index
    #[serde(default)]
    pub index_url: Option<String>,

    #[serde(default)]
    pub include_pre: bool,

    #[serde(default)]
    pub user: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FreezeConfig {
    #[serde(default)]
    pub entry: Option<PathBuf>,

    #[serde(default)]
    pub project_root: Option<PathBuf>,

    #[serde(default)]
    pub output_dir: Option<PathBuf>,

    #[serde(default)]
    pub one_file: bool,

    /// Passed through to the freezing tool verbatim
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_capacity() -> usize { DEFAULT_CAPACITY }
fn default_log_level() -> String { "info".to_string() }

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            overflow: OverflowPolicy::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl LoggingConfig {
    /// The configured level, falling back to `Info` on unknown names.
    pub fn level_filter(&self) -> log::LevelFilter {
        self.level.parse().unwrap_or(log::LevelFilter::Info)
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == "json")
}

pub fn load(path: &Path) -> Result<AppConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let config = if is_json(path) {
        serde_json::from_str(&content)?
    } else {
        toml::from_str(&content)?
    };
    Ok(config)
}

/// Loads `path`, or returns the defaults when the file does not exist yet.
pub fn load_or_default(path: &Path) -> Result<AppConfig, ConfigError> {
    if path.exists() {
        load(path)
    } else {
        Ok(AppConfig::default())
    }
}

pub fn save(config: &AppConfig, path: &Path) -> Result<(), ConfigError> {
    let content = if is_json(path) {
        serde_json::to_string_pretty(config)?
    } else {
        toml::to_string_pretty(config)?
    };

    fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub fn generate_sample() -> String {
    toml::to_string_pretty(&AppConfig::default()).unwrap_or_default()
}

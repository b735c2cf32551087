use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::{error, info, warn};

use super::freezer::Freezer;
use super::package_manager::PackageManager;
use super::Notices;
use crate::config::{self, AppConfig};
use crate::env::discover::search_dirs;
use crate::env::freeze::FreezeTool;
use crate::env::index::{self, Mirrors};
use crate::env::pip::{InstallOptions, PackageEnv, PipEnv};
use crate::error::{AppError, TaskError};
use crate::manager::registry::TaskRegistry;
use crate::utils::lock;
use crate::worker::dispatcher::EventLoop;
use crate::worker::task::Task;

const DEFAULT_INTERPRETER: &str = "python3";

/// Everything one front-end session owns: the event loop that runs finish
/// callbacks, and the controllers that launch tasks through it.
///
/// The config is shared with finish callbacks that record what a task found.
/// With a config path set, such changes are written back to it.
pub struct AppContext {
    config: Arc<Mutex<AppConfig>>,
    config_path: Option<PathBuf>,
    event_loop: EventLoop,
    packages: PackageManager,
    freezer: Freezer,
    notices: Notices,
}

impl AppContext {
    pub fn new(config: AppConfig, env: Arc<dyn PackageEnv>, tool: FreezeTool) -> Self {
        let event_loop = EventLoop::new();
        let notices = Notices::default();
        let packages = PackageManager::new(
            Arc::clone(&env),
            install_options(&config),
            registry(&config),
            event_loop.dispatcher(),
            notices.clone(),
        );
        let freezer = Freezer::new(tool, env, registry(&config), event_loop.dispatcher(), notices.clone());
        AppContext {
            config: Arc::new(Mutex::new(config)),
            config_path: None,
            event_loop,
            packages,
            freezer,
            notices,
        }
    }

    /// Uses the first configured interpreter, or `python3` from `PATH`.
    pub fn from_config(config: AppConfig) -> Self {
        let python = config
            .packages
            .interpreters
            .first()
            .cloned()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_INTERPRETER));
        info!("Using interpreter {}.", python.display());
        let env = Arc::new(PipEnv::new(python.clone()));
        Self::new(config, env, FreezeTool::new(python))
    }

    /// Saves config changes made by the session to `path`.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn config(&self) -> AppConfig {
        lock(&self.config).clone()
    }

    pub fn packages(&self) -> &PackageManager {
        &self.packages
    }

    pub fn freezer(&self) -> &Freezer {
        &self.freezer
    }

    pub fn freezer_mut(&mut self) -> &mut Freezer {
        &mut self.freezer
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    /// Configured interpreters, in the order `use_interpreter` indexes them.
    pub fn interpreters(&self) -> Vec<PathBuf> {
        lock(&self.config).packages.interpreters.clone()
    }

    pub fn use_interpreter(&mut self, index: usize) -> Result<Option<PathBuf>, TaskError> {
        let Some(python) = self.interpreters().get(index).cloned() else {
            warn!("No interpreter with index {}.", index);
            return Ok(None);
        };
        let env: Arc<dyn PackageEnv> = Arc::new(PipEnv::new(python.clone()));
        self.packages.ensure_idle()?;
        self.freezer.switch(Arc::clone(&env), FreezeTool::new(python.clone()))?;
        self.packages.set_env(env)?;
        Ok(Some(python))
    }

    /// Searches `PATH` for interpreters not configured yet and appends what it
    /// finds to the config.
    pub fn search_interpreters(&self) -> Result<Task, TaskError> {
        let known = self.interpreters();
        let config = Arc::clone(&self.config);
        let path = self.config_path.clone();
        self.packages.search_interpreters(search_dirs(), known, move |found| {
            if found.is_empty() {
                return;
            }
            let mut config = lock(&config);
            config.packages.interpreters.extend(found);
            persist(&config, path.as_deref());
        })
    }

    pub fn mirrors(&self) -> Mirrors {
        lock(&self.config).mirrors.clone()
    }

    pub fn add_mirror(&self, name: &str, url: &str) -> Result<(), AppError> {
        let mut config = lock(&self.config);
        index::add_mirror(&mut config.mirrors, name, url)?;
        info!("Added mirror '{}'.", name.trim());
        persist(&config, self.config_path.as_deref());
        Ok(())
    }

    pub fn remove_mirror(&self, name: &str) -> Result<String, AppError> {
        let mut config = lock(&self.config);
        let url = index::remove_mirror(&mut config.mirrors, name)?;
        persist(&config, self.config_path.as_deref());
        Ok(url)
    }

    /// Sets the interpreter's global index URL to a named mirror or a URL.
    pub fn use_mirror(&self, name_or_url: &str) -> Result<Task, AppError> {
        let url = {
            let config = lock(&self.config);
            index::resolve(&config.mirrors, name_or_url)?.to_string()
        };
        self.packages.set_global_index(&url)
    }

    pub fn show_index(&self) -> Result<Task, TaskError> {
        self.packages.show_global_index()
    }

    /// Runs the finish callbacks that arrived since the last call.
    pub fn pump(&self) -> usize {
        self.event_loop.pump()
    }

    pub fn take_notices(&self) -> Vec<String> {
        self.notices.take()
    }

    pub fn is_busy(&self) -> bool {
        self.packages.is_busy() || self.freezer.is_busy()
    }

    /// True when no controller has an unfinished task.
    pub fn can_close(&self) -> bool {
        self.packages.registry().is_empty() && self.freezer.registry().is_empty()
    }

    /// Closes the session. With tasks still running, `confirm` decides whether
    /// to kill them; declining keeps the session open and returns false.
    pub fn close<F>(&self, confirm: F) -> bool
    where
        F: FnOnce() -> bool,
    {
        if self.can_close() {
            return true;
        }
        if !confirm() {
            info!("Close cancelled, tasks keep running.");
            return false;
        }
        let killed = self.packages.kill_all() + self.freezer.kill_all();
        info!("Closing with {} tasks killed.", killed);
        true
    }
}

fn persist(config: &AppConfig, path: Option<&std::path::Path>) {
    let Some(path) = path else {
        return;
    };
    if let Err(e) = config::save(config, path) {
        error!("Failed to save config to {}: {}", path.display(), e);
    }
}

fn registry(config: &AppConfig) -> TaskRegistry {
    TaskRegistry::with_policy(config.registry.capacity, config.registry.overflow)
}

fn install_options(config: &AppConfig) -> InstallOptions {
    InstallOptions {
        upgrade: false,
        pre: config.packages.include_pre,
        user: config.packages.user,
        index_url: config.packages.index_url.clone(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::FreezeConfig;
    use crate::error::MirrorError;
    use tempfile::TempDir;

    fn app(pip_script: &str, freeze_script: &str) -> AppContext {
        let mut config = AppConfig::default();
        config.packages.interpreters = vec![PathBuf::from("/usr/bin/python3"), PathBuf::from("/opt/py/bin/python")];
        config.freeze = FreezeConfig {
            entry: Some(PathBuf::from("main.py")),
            ..FreezeConfig::default()
        };
        AppContext::new(
            config,
            Arc::new(PipEnv::with_command("sh", ["-c", pip_script, "pip"])),
            FreezeTool::with_command("sh", ["-c", freeze_script, "freeze"]),
        )
    }

    #[test]
    fn test_idle_app_closes_without_asking() {
        let app = app("exit 0", "exit 0");
        assert!(app.can_close());
        assert!(app.close(|| panic!("should not ask")));
    }

    #[test]
    fn test_declined_close_keeps_tasks_running() {
        let mut app = app("exit 0", "sleep 30");
        let config = app.config().freeze.clone();
        let task = app.freezer_mut().build(&config).unwrap();

        assert!(!app.can_close());
        assert!(!app.close(|| false));
        assert!(!task.is_finished());

        assert!(app.close(|| true));
        assert!(app.can_close());
        task.join();
    }

    #[test]
    fn test_refresh_fills_table_after_pump() {
        let app = app(
            r#"echo '[{"name": "requests", "version": "2.31.0"}]'"#,
            "exit 0",
        );
        app.packages().refresh().unwrap().join();
        assert!(app.packages().is_busy());

        assert_eq!(app.pump(), 1);
        assert!(!app.packages().is_busy());
        assert!(app.can_close());
        assert_eq!(app.packages().table()["requests"].version, "2.31.0");
    }

    #[test]
    fn test_use_interpreter_switches_env() {
        let mut app = app("exit 0", "exit 0");
        let python = app.use_interpreter(1).unwrap();
        assert_eq!(python, Some(PathBuf::from("/opt/py/bin/python")));
        assert!(app.packages().env_description().contains("/opt/py/bin/python"));
        assert_eq!(app.use_interpreter(5).unwrap(), None);
    }

    #[test]
    fn test_registry_settings_come_from_config() {
        let mut config = AppConfig::default();
        config.registry.capacity = 3;
        let app = AppContext::new(
            config,
            Arc::new(PipEnv::with_command("true", Vec::<String>::new())),
            FreezeTool::with_command("true", Vec::<String>::new()),
        );
        assert_eq!(app.packages().registry().capacity(), 3);
        assert_eq!(app.freezer().registry().capacity(), 3);
    }

    #[test]
    fn test_mirrors_are_saved_to_config_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pykit.toml");
        let app = app("exit 0", "exit 0").with_config_path(&path);

        app.add_mirror("tuna", "https://pypi.tuna.tsinghua.edu.cn/simple").unwrap();
        app.add_mirror("aliyun", "https://mirrors.aliyun.com/pypi/simple").unwrap();
        assert!(matches!(
            app.add_mirror("tuna", "https://other.example/simple"),
            Err(AppError::Mirror(MirrorError::Duplicate(_)))
        ));
        assert_eq!(
            app.remove_mirror("aliyun").unwrap(),
            "https://mirrors.aliyun.com/pypi/simple"
        );

        let saved = config::load(&path).unwrap();
        assert_eq!(saved.mirrors, app.mirrors());
        assert_eq!(saved.mirrors.len(), 1);
    }

    #[test]
    fn test_use_mirror_sets_global_index() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("pip-args");
        let script = format!("echo \"$@\" > {}", log.display());
        let app = app(&script, "exit 0");
        app.add_mirror("tuna", "https://pypi.tuna.tsinghua.edu.cn/simple").unwrap();

        assert!(matches!(
            app.use_mirror("douban"),
            Err(AppError::Mirror(MirrorError::Unknown(_)))
        ));
        app.use_mirror("tuna").unwrap().join();
        app.pump();

        let args = std::fs::read_to_string(&log).unwrap();
        assert!(args.contains("config set global.index-url https://pypi.tuna.tsinghua.edu.cn/simple"));
        assert_eq!(
            app.take_notices(),
            vec!["Global index URL set to https://pypi.tuna.tsinghua.edu.cn/simple."]
        );
    }
}

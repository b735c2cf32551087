use std::sync::{Arc, Mutex};

use crossbeam_channel::{never, unbounded, Receiver};
use log::{info, warn};

use super::runner::Runner;
use super::Notices;
use crate::config::FreezeConfig;
use crate::env::freeze::FreezeTool;
use crate::env::imports::project_imports;
use crate::env::pip::{install_each, InstallOptions, PackageEnv};
use crate::error::{AppError, EnvError, TaskError};
use crate::manager::registry::TaskRegistry;
use crate::models::task::Lane;
use crate::utils::lock;
use crate::worker::{dispatcher::Dispatcher, task::Task};

const PYINSTALLER: &str = "pyinstaller";

/// Builds standalone executables with the freezing tool and keeps the
/// interpreter fit for it. One operation runs at a time.
pub struct Freezer {
    tool: FreezeTool,
    env: Arc<dyn PackageEnv>,
    runner: Runner,
    output: Mutex<Receiver<String>>,
    missing: Arc<Mutex<Vec<String>>>,
}

impl Freezer {
    pub fn new(
        tool: FreezeTool,
        env: Arc<dyn PackageEnv>,
        registry: TaskRegistry,
        dispatcher: Dispatcher,
        notices: Notices,
    ) -> Self {
        Freezer {
            tool,
            env,
            runner: Runner::new("freezer", registry, dispatcher, notices),
            output: Mutex::new(never()),
            missing: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        self.runner.registry()
    }

    pub fn is_busy(&self) -> bool {
        self.runner.is_busy()
    }

    pub fn activity(&self) -> Option<String> {
        self.runner.activity()
    }

    /// Output lines of the running or last build not yet taken.
    pub fn take_output(&self) -> Vec<String> {
        lock(&self.output).try_iter().collect()
    }

    /// Modules the last import check found missing from the interpreter.
    pub fn missing(&self) -> Vec<String> {
        lock(&self.missing).clone()
    }

    pub fn build(&mut self, config: &FreezeConfig) -> Result<Task, AppError> {
        self.runner.ensure_idle()?;
        self.tool.prepare(config)?;

        // each build streams into its own channel
        let (sink, output) = unbounded();
        *lock(&self.output) = output;

        let tool = self.tool.clone();
        let notices = self.runner.notices().clone();
        let task = self.runner.launch(
            Lane::SERIAL,
            "Building",
            move |ctx| tool.execute(ctx, &sink),
            move |code| match code {
                0 => notices.push("Build finished."),
                code => notices.push(format!("Build failed with exit code {}, see the build output.", code)),
            },
        )?;
        Ok(task)
    }

    /// Lists the third-party modules the project imports that the interpreter
    /// cannot find.
    pub fn check_imports(&self, config: &FreezeConfig) -> Result<Task, AppError> {
        let root = config.project_root.clone().ok_or(EnvError::NoProject)?;
        if !root.is_dir() {
            return Err(EnvError::MissingProject(root).into());
        }

        let env = Arc::clone(&self.env);
        let missing = Arc::clone(&self.missing);
        let notices = self.runner.notices().clone();
        let task = self.runner.launch(
            Lane::CONCURRENT,
            "Checking project imports",
            move |ctx| {
                let modules: Vec<String> = project_imports(&root)?.into_iter().collect();
                info!("Project imports {} top-level modules.", modules.len());
                env.missing_modules(ctx, &modules)
            },
            move |result| match result {
                Ok(found) => {
                    if found.is_empty() {
                        notices.push("All project imports are installed.");
                    } else {
                        notices.push(format!(
                            "Missing modules: {}. Run install-missing to install them.",
                            found.join(", ")
                        ));
                    }
                    *lock(&missing) = found;
                }
                Err(e) => notices.push(format!("Import check failed: {}", e)),
            },
        )?;
        Ok(task)
    }

    /// Installs what the last import check reported missing.
    pub fn install_missing(&self) -> Result<Option<Task>, TaskError> {
        let names = self.missing();
        if names.is_empty() {
            self.runner
                .notices()
                .push("No missing modules recorded. Run check-imports first.");
            return Ok(None);
        }

        let env = Arc::clone(&self.env);
        let missing = Arc::clone(&self.missing);
        let notices = self.runner.notices().clone();
        self.runner
            .launch(
                Lane::SERIAL,
                "Installing missing modules",
                move |ctx| install_each(env.as_ref(), ctx, &names, &InstallOptions::default()),
                move |results| {
                    let mut missing = lock(&missing);
                    missing.retain(|name| !results.iter().any(|(done, ok)| *ok && done == name));
                    if missing.is_empty() {
                        notices.push(format!("Installed {} missing modules.", results.len()));
                    } else {
                        notices.push(format!("Could not install: {}.", missing.join(", ")));
                    }
                },
            )
            .map(Some)
    }

    /// Uninstalls the freezing tool's package and installs its latest release.
    pub fn reinstall_pyinstaller(&self) -> Result<Task, TaskError> {
        let env = Arc::clone(&self.env);
        let notices = self.runner.notices().clone();
        self.runner.launch(
            Lane::SERIAL,
            "Reinstalling PyInstaller",
            move |ctx| {
                match env.uninstall(ctx, PYINSTALLER) {
                    Ok(true) => {}
                    Ok(false) => warn!("{} was not removed, installing anyway.", PYINSTALLER),
                    Err(e) => warn!("Removing {} failed: {}", PYINSTALLER, e),
                }
                let opts = InstallOptions {
                    upgrade: true,
                    ..InstallOptions::default()
                };
                env.install(ctx, PYINSTALLER, &opts)
            },
            move |result| match result {
                Ok(true) => notices.push("PyInstaller reinstalled."),
                Ok(false) => notices.push("Installing PyInstaller failed, see the log."),
                Err(e) => notices.push(format!("Reinstalling PyInstaller failed: {}", e)),
            },
        )
    }

    /// Points the freezer at another interpreter.
    pub fn switch(&mut self, env: Arc<dyn PackageEnv>, tool: FreezeTool) -> Result<(), TaskError> {
        self.runner.ensure_idle()?;
        self.env = env;
        self.tool = tool;
        lock(&self.missing).clear();
        Ok(())
    }

    pub fn stop_all(&self) -> usize {
        let stopped = self.runner.stop_all();
        self.detach_output();
        stopped
    }

    pub fn kill_all(&self) -> usize {
        let killed = self.runner.kill_all();
        self.detach_output();
        killed
    }

    fn detach_output(&self) {
        // lines a terminated build still writes go nowhere
        *lock(&self.output) = never();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::env::pip::{DownloadOptions, OutdatedInfo, PackageInfo};
    use crate::worker::{context::TaskContext, dispatcher::EventLoop};
    use std::fs;
    use std::path::PathBuf;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeEnv {
        installed: Mutex<Vec<String>>,
        broken: Vec<&'static str>,
        calls: Mutex<Vec<String>>,
    }

    impl PackageEnv for FakeEnv {
        fn describe(&self) -> String {
            "fake python".to_string()
        }

        fn packages(&self, _ctx: &TaskContext) -> Result<Vec<PackageInfo>, EnvError> {
            Ok(Vec::new())
        }

        fn outdated(&self, _ctx: &TaskContext) -> Result<Vec<OutdatedInfo>, EnvError> {
            Ok(Vec::new())
        }

        fn install(&self, _ctx: &TaskContext, name: &str, opts: &InstallOptions) -> Result<bool, EnvError> {
            lock(&self.calls).push(format!("install {} upgrade={}", name, opts.upgrade));
            if self.broken.iter().any(|broken| *broken == name) {
                return Ok(false);
            }
            lock(&self.installed).push(name.to_string());
            Ok(true)
        }

        fn uninstall(&self, _ctx: &TaskContext, name: &str) -> Result<bool, EnvError> {
            lock(&self.calls).push(format!("uninstall {}", name));
            Ok(true)
        }

        fn download(&self, _ctx: &TaskContext, _name: &str, _opts: &DownloadOptions) -> Result<bool, EnvError> {
            Ok(true)
        }

        fn global_index(&self, _ctx: &TaskContext) -> Result<Option<String>, EnvError> {
            Ok(None)
        }

        fn set_global_index(&self, _ctx: &TaskContext, _url: &str) -> Result<(), EnvError> {
            Ok(())
        }

        fn missing_modules(&self, _ctx: &TaskContext, modules: &[String]) -> Result<Vec<String>, EnvError> {
            let installed = lock(&self.installed);
            Ok(modules.iter().filter(|m| !installed.contains(m)).cloned().collect())
        }
    }

    fn freezer_with(script: &str, env: Arc<FakeEnv>, event_loop: &EventLoop) -> Freezer {
        Freezer::new(
            FreezeTool::with_command("sh", ["-c", script, "freeze"]),
            env,
            TaskRegistry::new(4),
            event_loop.dispatcher(),
            Notices::default(),
        )
    }

    fn freezer(script: &str, event_loop: &EventLoop) -> Freezer {
        freezer_with(script, Arc::new(FakeEnv::default()), event_loop)
    }

    fn entry() -> FreezeConfig {
        FreezeConfig {
            entry: Some(PathBuf::from("app.py")),
            ..FreezeConfig::default()
        }
    }

    #[test]
    fn test_successful_build_reports_and_streams() {
        let event_loop = EventLoop::new();
        let mut freezer = freezer("echo packing \"$1\"", &event_loop);

        let task = freezer.build(&entry()).unwrap();
        assert!(freezer.is_busy());
        task.join();
        event_loop.pump();

        assert!(!freezer.is_busy());
        assert_eq!(task.exit_code(), Some(0));
        assert_eq!(freezer.take_output(), vec!["[stdout] packing app.py"]);
        assert_eq!(freezer.runner.notices().take(), vec!["Build finished."]);
    }

    #[test]
    fn test_failed_build_reports_exit_code() {
        let event_loop = EventLoop::new();
        let mut freezer = freezer("exit 2", &event_loop);
        freezer.build(&entry()).unwrap().join();
        event_loop.pump();
        assert_eq!(
            freezer.runner.notices().take(),
            vec!["Build failed with exit code 2, see the build output."]
        );
    }

    #[test]
    fn test_build_without_entry_is_refused() {
        let event_loop = EventLoop::new();
        let mut freezer = freezer("exit 0", &event_loop);
        let err = freezer.build(&FreezeConfig::default()).unwrap_err();
        assert!(matches!(err, AppError::Env(EnvError::NoEntry)));
        assert!(freezer.registry().is_empty());
    }

    #[test]
    fn test_kill_all_stops_running_build() {
        let event_loop = EventLoop::new();
        let mut freezer = freezer("sleep 30", &event_loop);
        let task = freezer.build(&entry()).unwrap();
        assert!(!freezer.registry().is_empty());

        assert_eq!(freezer.kill_all(), 1);
        task.join();
        assert!(freezer.registry().is_empty());
        assert!(!freezer.is_busy());
        event_loop.pump();
        assert!(freezer.runner.notices().take().is_empty());
    }

    #[test]
    fn test_killed_build_output_does_not_leak() {
        let event_loop = EventLoop::new();
        let mut freezer = freezer("echo \"start $1\"; sleep 0.2; echo \"late $1\"", &event_loop);
        let first = freezer.build(&entry()).unwrap();
        thread::sleep(Duration::from_millis(50));
        freezer.kill_all();
        first.join();
        assert!(freezer.take_output().is_empty());

        let second = FreezeConfig {
            entry: Some(PathBuf::from("other.py")),
            ..FreezeConfig::default()
        };
        freezer.build(&second).unwrap().join();
        event_loop.pump();
        assert_eq!(
            freezer.take_output(),
            vec!["[stdout] start other.py", "[stdout] late other.py"]
        );
        assert_eq!(freezer.runner.notices().take(), vec!["Build finished."]);
    }

    fn project() -> TempDir {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("main.py"), "import requests\nimport yaml\nimport helpers\n").unwrap();
        fs::write(root.path().join("helpers.py"), "import json\n").unwrap();
        root
    }

    #[test]
    fn test_check_imports_then_install_missing() {
        let event_loop = EventLoop::new();
        let env = Arc::new(FakeEnv {
            installed: Mutex::new(vec!["json".to_string(), "requests".to_string()]),
            ..FakeEnv::default()
        });
        let freezer = freezer_with("exit 0", Arc::clone(&env), &event_loop);
        let root = project();
        let config = FreezeConfig {
            project_root: Some(root.path().to_path_buf()),
            ..FreezeConfig::default()
        };

        freezer.check_imports(&config).unwrap().join();
        assert!(freezer.missing().is_empty());
        event_loop.pump();
        assert_eq!(freezer.missing(), vec!["yaml"]);
        assert_eq!(
            freezer.runner.notices().take(),
            vec!["Missing modules: yaml. Run install-missing to install them."]
        );

        freezer.install_missing().unwrap().unwrap().join();
        event_loop.pump();
        assert!(freezer.missing().is_empty());
        assert_eq!(freezer.runner.notices().take(), vec!["Installed 1 missing modules."]);
        assert_eq!(*lock(&env.calls), vec!["install yaml upgrade=false"]);
    }

    #[test]
    fn test_check_imports_needs_a_project_directory() {
        let event_loop = EventLoop::new();
        let freezer = freezer("exit 0", &event_loop);
        assert!(matches!(
            freezer.check_imports(&FreezeConfig::default()),
            Err(AppError::Env(EnvError::NoProject))
        ));
        let gone = FreezeConfig {
            project_root: Some(PathBuf::from("/nonexistent/project")),
            ..FreezeConfig::default()
        };
        assert!(matches!(
            freezer.check_imports(&gone),
            Err(AppError::Env(EnvError::MissingProject(_)))
        ));
        assert!(freezer.registry().is_empty());
        assert!(freezer.install_missing().unwrap().is_none());
    }

    #[test]
    fn test_failed_install_keeps_module_missing() {
        let event_loop = EventLoop::new();
        let env = Arc::new(FakeEnv {
            broken: vec!["yaml"],
            ..FakeEnv::default()
        });
        let freezer = freezer_with("exit 0", env, &event_loop);
        let root = project();
        let config = FreezeConfig {
            project_root: Some(root.path().to_path_buf()),
            ..FreezeConfig::default()
        };
        freezer.check_imports(&config).unwrap().join();
        event_loop.pump();
        freezer.runner.notices().take();

        let task = freezer.install_missing().unwrap().unwrap();
        task.join();
        event_loop.pump();
        assert_eq!(task.exit_code(), Some(1));
        assert_eq!(freezer.missing(), vec!["yaml"]);
        assert_eq!(freezer.runner.notices().take(), vec!["Could not install: yaml."]);
    }

    #[test]
    fn test_reinstall_pyinstaller_removes_then_upgrades() {
        let event_loop = EventLoop::new();
        let env = Arc::new(FakeEnv::default());
        let freezer = freezer_with("exit 0", Arc::clone(&env), &event_loop);

        freezer.reinstall_pyinstaller().unwrap().join();
        event_loop.pump();
        assert_eq!(
            *lock(&env.calls),
            vec!["uninstall pyinstaller", "install pyinstaller upgrade=true"]
        );
        assert_eq!(freezer.runner.notices().take(), vec!["PyInstaller reinstalled."]);
    }
}

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use log::{info, warn};

use super::runner::{Runner, Verdict};
use super::Notices;
use crate::env::discover::find_interpreters;
use crate::env::index::check_index_url;
use crate::env::pip::{
    download_each, install_each, uninstall_each, DownloadOptions, InstallOptions, PackageEnv, PackageInfo,
};
use crate::error::{AppError, EnvError, MirrorError, TaskError};
use crate::manager::registry::TaskRegistry;
use crate::models::task::Lane;
use crate::utils::lock;
use crate::worker::{dispatcher::Dispatcher, task::Task};

/// Version shown for packages that are not installed.
pub const NOT_AVAILABLE: &str = "- N/A -";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowStatus {
    #[default]
    Unchanged,
    Installed,
    InstallFailed,
    Uninstalled,
    UninstallFailed,
    Upgraded,
    UpgradeFailed,
}

impl RowStatus {
    pub fn label(&self) -> &'static str {
        match self {
            RowStatus::Unchanged => "",
            RowStatus::Installed => "installed",
            RowStatus::InstallFailed => "install failed",
            RowStatus::Uninstalled => "uninstalled",
            RowStatus::UninstallFailed => "uninstall failed",
            RowStatus::Upgraded => "upgraded",
            RowStatus::UpgradeFailed => "upgrade failed",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageRow {
    pub version: String,
    /// Newer version reported by the last update check, empty if none
    pub latest: String,
    pub status: RowStatus,
}

pub type PackageTable = BTreeMap<String, PackageRow>;

/// Package operations on one interpreter.
///
/// Reads (`refresh`, `check_outdated`, `show_global_index`) go to
/// [`Lane::CONCURRENT`], mutations to [`Lane::SERIAL`]. Every operation marks
/// the controller busy from its start callback until its finish callback, and
/// new operations are refused meanwhile. Results reach the table only from
/// finish callbacks.
pub struct PackageManager {
    env: Arc<dyn PackageEnv>,
    options: InstallOptions,
    table: Arc<Mutex<PackageTable>>,
    runner: Runner,
}

impl PackageManager {
    pub fn new(
        env: Arc<dyn PackageEnv>,
        options: InstallOptions,
        registry: TaskRegistry,
        dispatcher: Dispatcher,
        notices: Notices,
    ) -> Self {
        PackageManager {
            env,
            options,
            table: Arc::new(Mutex::new(PackageTable::new())),
            runner: Runner::new("package manager", registry, dispatcher, notices),
        }
    }

    pub fn env_description(&self) -> String {
        self.env.describe()
    }

    /// Switches to another interpreter and forgets the current table.
    pub fn set_env(&mut self, env: Arc<dyn PackageEnv>) -> Result<(), TaskError> {
        self.runner.ensure_idle()?;
        info!("Package manager switched to {}.", env.describe());
        self.env = env;
        lock(&self.table).clear();
        Ok(())
    }

    pub fn registry(&self) -> &TaskRegistry {
        self.runner.registry()
    }

    pub fn is_busy(&self) -> bool {
        self.runner.is_busy()
    }

    pub fn ensure_idle(&self) -> Result<(), TaskError> {
        self.runner.ensure_idle()
    }

    pub fn activity(&self) -> Option<String> {
        self.runner.activity()
    }

    pub fn table(&self) -> PackageTable {
        lock(&self.table).clone()
    }

    pub fn refresh(&self) -> Result<Task, TaskError> {
        let env = Arc::clone(&self.env);
        let table = Arc::clone(&self.table);
        let notices = self.runner.notices().clone();
        self.runner.launch(
            Lane::CONCURRENT,
            "Loading package list",
            move |ctx| env.packages(ctx),
            move |listing| match listing {
                Ok(packages) => fill(&table, packages),
                Err(e) => notices.push(format!("Failed to list packages: {}", e)),
            },
        )
    }

    /// Reloads the package list, then marks the packages that have a newer
    /// release.
    ///
    /// The listing runs as its own task that the update check joins. Both are
    /// admitted together, so a full registry rejects the pair.
    pub fn check_outdated(&self) -> Result<Task, TaskError> {
        self.runner.ensure_idle()?;

        let listing: Arc<Mutex<Option<Result<Vec<PackageInfo>, EnvError>>>> = Arc::new(Mutex::new(None));
        let env = Arc::clone(&self.env);
        let produced = Arc::clone(&listing);
        let fetch = Task::with_context(move |ctx| {
            let result = env.packages(ctx);
            let code = result.exit_code();
            *lock(&produced) = Some(result);
            code
        });

        let env = Arc::clone(&self.env);
        let producer = fetch.clone();
        let table = Arc::clone(&self.table);
        let notices = self.runner.notices().clone();
        let task = self.runner.prepare(
            "Checking for updates",
            move |ctx| {
                // the list must be complete before latest versions are merged in
                producer.join();
                let packages = lock(&listing).take();
                match packages {
                    Some(Ok(packages)) => env.outdated(ctx).map(|outdated| (packages, outdated)),
                    Some(Err(e)) => Err(e),
                    None => Err(EnvError::Incomplete("package listing")),
                }
            },
            move |result| match result {
                Ok((packages, outdated)) => {
                    fill(&table, packages);
                    let count = outdated.len();
                    let mut table = lock(&table);
                    for info in outdated {
                        table.entry(info.name).or_default().latest = info.latest;
                    }
                    notices.push(format!("{} packages can be upgraded.", count));
                }
                Err(e) => notices.push(format!("Update check failed: {}", e)),
            },
        );

        self.runner
            .registry()
            .put_all(vec![fetch.clone(), task.clone()], Lane::CONCURRENT)?;
        let fetched = fetch.start();
        // started even if the listing could not be, so nothing stays pending
        task.start()?;
        fetched?;
        Ok(task)
    }

    pub fn install(&self, names: Vec<String>) -> Result<Option<Task>, TaskError> {
        if names.is_empty() {
            return Ok(None);
        }
        let env = Arc::clone(&self.env);
        let table = Arc::clone(&self.table);
        let notices = self.runner.notices().clone();
        let opts = self.options.clone();
        self.runner
            .launch(
                Lane::SERIAL,
                "Installing",
                move |ctx| install_each(env.as_ref(), ctx, &names, &opts),
                move |results| {
                    record(&table, &results, |row, ok| {
                        if row.version.is_empty() {
                            row.version = NOT_AVAILABLE.to_string();
                        }
                        row.status = if ok { RowStatus::Installed } else { RowStatus::InstallFailed };
                    });
                    notices.push(summary("Install", &results));
                },
            )
            .map(Some)
    }

    pub fn uninstall(&self, names: Vec<String>) -> Result<Option<Task>, TaskError> {
        if names.is_empty() {
            return Ok(None);
        }
        let env = Arc::clone(&self.env);
        let table = Arc::clone(&self.table);
        let notices = self.runner.notices().clone();
        self.runner
            .launch(
                Lane::SERIAL,
                "Uninstalling",
                move |ctx| uninstall_each(env.as_ref(), ctx, &names),
                move |results| {
                    record(&table, &results, |row, ok| {
                        if ok {
                            row.version = NOT_AVAILABLE.to_string();
                            row.status = RowStatus::Uninstalled;
                        } else {
                            row.status = RowStatus::UninstallFailed;
                        }
                    });
                    notices.push(summary("Uninstall", &results));
                },
            )
            .map(Some)
    }

    pub fn upgrade(&self, names: Vec<String>) -> Result<Option<Task>, TaskError> {
        if names.is_empty() {
            return Ok(None);
        }
        let env = Arc::clone(&self.env);
        let table = Arc::clone(&self.table);
        let notices = self.runner.notices().clone();
        let opts = InstallOptions {
            upgrade: true,
            ..self.options.clone()
        };
        self.runner
            .launch(
                Lane::SERIAL,
                "Upgrading",
                move |ctx| install_each(env.as_ref(), ctx, &names, &opts),
                move |results| {
                    record(&table, &results, |row, ok| {
                        if ok {
                            if !row.latest.is_empty() {
                                row.version = std::mem::take(&mut row.latest);
                            }
                            row.status = RowStatus::Upgraded;
                        } else {
                            row.status = RowStatus::UpgradeFailed;
                        }
                    });
                    notices.push(summary("Upgrade", &results));
                },
            )
            .map(Some)
    }

    /// Upgrades every package the last update check found a newer version for.
    pub fn upgrade_all(&self) -> Result<Option<Task>, TaskError> {
        let upgradeable: Vec<String> = lock(&self.table)
            .iter()
            .filter(|(_, row)| !row.latest.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        if upgradeable.is_empty() {
            self.runner
                .notices()
                .push("Nothing to upgrade. Run an update check first.");
            return Ok(None);
        }
        self.upgrade(upgradeable)
    }

    /// Downloads distribution files into `dest` without installing them.
    /// The package table is left alone.
    pub fn download(&self, names: Vec<String>, dest: PathBuf) -> Result<Option<Task>, TaskError> {
        if names.is_empty() {
            return Ok(None);
        }
        let env = Arc::clone(&self.env);
        let notices = self.runner.notices().clone();
        let opts = DownloadOptions {
            dest: Some(dest),
            no_deps: false,
            pre: self.options.pre,
            index_url: self.options.index_url.clone(),
        };
        self.runner
            .launch(
                Lane::SERIAL,
                "Downloading",
                move |ctx| download_each(env.as_ref(), ctx, &names, &opts),
                move |results| notices.push(summary("Download", &results)),
            )
            .map(Some)
    }

    /// Writes `url` into the interpreter's global package-manager config.
    pub fn set_global_index(&self, url: &str) -> Result<Task, AppError> {
        if !check_index_url(url) {
            return Err(MirrorError::InvalidUrl(url.to_string()).into());
        }
        let env = Arc::clone(&self.env);
        let notices = self.runner.notices().clone();
        let url = url.to_string();
        let shown = url.clone();
        let task = self.runner.launch(
            Lane::SERIAL,
            "Setting index URL",
            move |ctx| env.set_global_index(ctx, &url),
            move |result| match result {
                Ok(()) => notices.push(format!("Global index URL set to {}.", shown)),
                Err(e) => notices.push(format!("Setting the index URL failed: {}", e)),
            },
        )?;
        Ok(task)
    }

    pub fn show_global_index(&self) -> Result<Task, TaskError> {
        let env = Arc::clone(&self.env);
        let notices = self.runner.notices().clone();
        self.runner.launch(
            Lane::CONCURRENT,
            "Reading index URL",
            move |ctx| env.global_index(ctx),
            move |result| match result {
                Ok(Some(url)) => notices.push(format!("Effective index URL: {}", url)),
                Ok(None) => notices.push("No global index URL set, the default index is used."),
                Err(e) => notices.push(format!("Reading the index URL failed: {}", e)),
            },
        )
    }

    /// Looks for interpreters in `dirs` that are not in `known` and hands the
    /// new ones to `found` from the finish callback.
    pub fn search_interpreters<F>(&self, dirs: Vec<PathBuf>, known: Vec<PathBuf>, found: F) -> Result<Task, TaskError>
    where
        F: FnOnce(Vec<PathBuf>) + Send + 'static,
    {
        let table = Arc::clone(&self.table);
        let notices = self.runner.notices().clone();
        self.runner.launch(
            Lane::SERIAL,
            "Searching for interpreters",
            move |ctx| find_interpreters(ctx, &dirs, &known),
            move |interpreters| {
                lock(&table).clear();
                notices.push(format!("Found {} new interpreters.", interpreters.len()));
                found(interpreters);
            },
        )
    }

    /// Terminates everything this controller started and resets its state.
    pub fn stop_all(&self) -> usize {
        let stopped = self.runner.stop_all();
        lock(&self.table).clear();
        stopped
    }

    pub fn kill_all(&self) -> usize {
        let killed = self.runner.kill_all();
        lock(&self.table).clear();
        killed
    }
}

fn fill(table: &Mutex<PackageTable>, packages: Vec<PackageInfo>) {
    let mut table = lock(table);
    if !table.is_empty() {
        warn!("Replacing {} rows with a fresh package list.", table.len());
    }
    table.clear();
    for package in packages {
        table.insert(
            package.name,
            PackageRow {
                version: package.version,
                ..PackageRow::default()
            },
        );
    }
}

/// Applies `update` to the row of every result. Returns the number of failures.
fn record<F>(table: &Mutex<PackageTable>, results: &[(String, bool)], update: F) -> usize
where
    F: Fn(&mut PackageRow, bool),
{
    let mut table = lock(table);
    for (name, ok) in results {
        update(table.entry(name.clone()).or_default(), *ok);
    }
    results.iter().filter(|(_, ok)| !ok).count()
}

fn summary(verb: &str, results: &[(String, bool)]) -> String {
    let failed: Vec<&str> = results
        .iter()
        .filter(|(_, ok)| !ok)
        .map(|(name, _)| name.as_str())
        .collect();
    let succeeded = results.len() - failed.len();
    if failed.is_empty() {
        format!("{}: {} succeeded.", verb, succeeded)
    } else {
        format!(
            "{}: {} succeeded, {} failed ({}).",
            verb,
            succeeded,
            failed.len(),
            failed.join(", ")
        )
    }
}

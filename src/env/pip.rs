use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    process::{Command, Output},
};

use log::{debug, info, warn};
use serde::Deserialize;

use crate::error::EnvError;
use crate::worker::context::TaskContext;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PackageInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OutdatedInfo {
    pub name: String,
    pub version: String,
    #[serde(rename = "latest_version")]
    pub latest: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallOptions {
    pub upgrade: bool,
    pub pre: bool,
    pub user: bool,
    pub index_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadOptions {
    pub dest: Option<PathBuf>,
    pub no_deps: bool,
    pub pre: bool,
    pub index_url: Option<String>,
}

/// One interpreter installation and the package operations it supports.
///
/// Every call blocks until the package manager exits, so they are meant to
/// run inside a task's work. `Ok(false)` means the package manager ran and
/// reported failure.
pub trait PackageEnv: Send + Sync {
    fn describe(&self) -> String;

    fn packages(&self, ctx: &TaskContext) -> Result<Vec<PackageInfo>, EnvError>;

    fn outdated(&self, ctx: &TaskContext) -> Result<Vec<OutdatedInfo>, EnvError>;

    fn install(&self, ctx: &TaskContext, name: &str, opts: &InstallOptions)
        -> Result<bool, EnvError>;

    fn uninstall(&self, ctx: &TaskContext, name: &str) -> Result<bool, EnvError>;

    fn download(&self, ctx: &TaskContext, name: &str, opts: &DownloadOptions)
        -> Result<bool, EnvError>;

    /// The index URL set in the global package-manager configuration.
    fn global_index(&self, ctx: &TaskContext) -> Result<Option<String>, EnvError>;

    fn set_global_index(&self, ctx: &TaskContext, url: &str) -> Result<(), EnvError>;

    /// The subset of `modules` the interpreter cannot import.
    fn missing_modules(&self, ctx: &TaskContext, modules: &[String]) -> Result<Vec<String>, EnvError>;
}

/// Installs `names` one by one, stopping early if the task is cancelled.
pub fn install_each(
    env: &dyn PackageEnv,
    ctx: &TaskContext,
    names: &[String],
    opts: &InstallOptions,
) -> Vec<(String, bool)> {
    each(ctx, names, |name| env.install(ctx, name, opts))
}

pub fn uninstall_each(env: &dyn PackageEnv, ctx: &TaskContext, names: &[String]) -> Vec<(String, bool)> {
    each(ctx, names, |name| env.uninstall(ctx, name))
}

pub fn download_each(
    env: &dyn PackageEnv,
    ctx: &TaskContext,
    names: &[String],
    opts: &DownloadOptions,
) -> Vec<(String, bool)> {
    each(ctx, names, |name| env.download(ctx, name, opts))
}

fn each<F>(ctx: &TaskContext, names: &[String], mut op: F) -> Vec<(String, bool)>
where
    F: FnMut(&str) -> Result<bool, EnvError>,
{
    let mut results = Vec::with_capacity(names.len());
    for name in names {
        if ctx.is_cancelled() {
            info!("Task '{}' cancelled, skipping remaining packages.", ctx.task_id());
            break;
        }
        let ok = match op(name) {
            Ok(ok) => ok,
            Err(e) => {
                warn!("'{}' failed: {}", name, e);
                false
            }
        };
        results.push((name.clone(), ok));
    }
    results
}

const FIND_MISSING: &str = "import importlib.util, sys\nfor name in sys.argv[1:]:\n    if importlib.util.find_spec(name) is None:\n        print(name)\n";

/// [`PackageEnv`] backed by `<python> -m pip`.
#[derive(Debug, Clone)]
pub struct PipEnv {
    python: PathBuf,
    program: PathBuf,
    prefix: Vec<OsString>,
}

impl PipEnv {
    pub fn new(python: impl Into<PathBuf>) -> Self {
        let python = python.into();
        PipEnv {
            program: python.clone(),
            python,
            prefix: vec!["-m".into(), "pip".into()],
        }
    }

    /// Runs `program prefix.. <pip args>` instead of `python -m pip <pip args>`.
    pub fn with_command<I, S>(program: impl Into<PathBuf>, prefix: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let program = program.into();
        PipEnv {
            python: program.clone(),
            program,
            prefix: prefix.into_iter().map(Into::into).collect(),
        }
    }

    pub fn python(&self) -> &Path {
        &self.python
    }

    fn run(&self, ctx: &TaskContext, args: &[&str]) -> Result<Output, EnvError> {
        debug!("pip {}", args.join(" "));
        let mut command = Command::new(&self.program);
        command
            .args(&self.prefix)
            .args(args)
            .env("PYTHONIOENCODING", "utf-8");
        ctx.output(&mut command).map_err(|source| self.launch_error(source))
    }

    fn launch_error(&self, source: io::Error) -> EnvError {
        if source.kind() == io::ErrorKind::Interrupted {
            EnvError::Cancelled
        } else {
            EnvError::Launch {
                program: self.program.display().to_string(),
                source,
            }
        }
    }

    fn run_checked(&self, ctx: &TaskContext, args: &[&str]) -> Result<Output, EnvError> {
        let output = self.run(ctx, args)?;
        if !output.status.success() {
            return Err(EnvError::CommandFailed {
                program: self.program.display().to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    fn run_status(&self, ctx: &TaskContext, args: &[&str]) -> Result<bool, EnvError> {
        let output = self.run(ctx, args)?;
        if !output.status.success() {
            debug!(
                "pip {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.status.success())
    }
}

impl PackageEnv for PipEnv {
    fn describe(&self) -> String {
        self.python.display().to_string()
    }

    fn packages(&self, ctx: &TaskContext) -> Result<Vec<PackageInfo>, EnvError> {
        let output = self.run_checked(
            ctx,
            &["list", "--format=json", "--disable-pip-version-check"],
        )?;
        Ok(serde_json::from_slice(&output.stdout)?)
    }

    fn outdated(&self, ctx: &TaskContext) -> Result<Vec<OutdatedInfo>, EnvError> {
        let output = self.run_checked(
            ctx,
            &["list", "--outdated", "--format=json", "--disable-pip-version-check"],
        )?;
        Ok(serde_json::from_slice(&output.stdout)?)
    }

    fn install(&self, ctx: &TaskContext, name: &str, opts: &InstallOptions) -> Result<bool, EnvError> {
        let mut args = vec!["install"];
        if opts.upgrade {
            args.push("--upgrade");
        }
        if opts.pre {
            args.push("--pre");
        }
        if opts.user {
            args.push("--user");
        }
        if let Some(url) = opts.index_url.as_deref() {
            args.extend(["--index-url", url]);
        }
        args.push(name);
        self.run_status(ctx, &args)
    }

    fn uninstall(&self, ctx: &TaskContext, name: &str) -> Result<bool, EnvError> {
        self.run_status(ctx, &["uninstall", "--yes", name])
    }

    fn download(&self, ctx: &TaskContext, name: &str, opts: &DownloadOptions) -> Result<bool, EnvError> {
        let dest = opts.dest.as_ref().map(|dest| dest.display().to_string());
        let mut args = vec!["download"];
        if let Some(dest) = dest.as_deref() {
            args.extend(["--dest", dest]);
        }
        if opts.no_deps {
            args.push("--no-deps");
        }
        if opts.pre {
            args.push("--pre");
        }
        if let Some(url) = opts.index_url.as_deref() {
            args.extend(["--index-url", url]);
        }
        args.push(name);
        self.run_status(ctx, &args)
    }

    fn global_index(&self, ctx: &TaskContext) -> Result<Option<String>, EnvError> {
        // pip exits non-zero when the key is not set
        let output = self.run(ctx, &["config", "get", "global.index-url"])?;
        let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((output.status.success() && !url.is_empty()).then_some(url))
    }

    fn set_global_index(&self, ctx: &TaskContext, url: &str) -> Result<(), EnvError> {
        self.run_checked(ctx, &["config", "set", "global.index-url", url])?;
        info!("Global index URL of {} set to {}.", self.python.display(), url);
        Ok(())
    }

    fn missing_modules(&self, ctx: &TaskContext, modules: &[String]) -> Result<Vec<String>, EnvError> {
        if modules.is_empty() {
            return Ok(Vec::new());
        }
        let mut command = Command::new(&self.python);
        command.arg("-c").arg(FIND_MISSING).args(modules);
        let output = ctx.output(&mut command).map_err(|source| self.launch_error(source))?;
        if !output.status.success() {
            return Err(EnvError::CommandFailed {
                program: self.python.display().to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::models::task::TaskId;

    fn scripted(script: &str) -> PipEnv {
        // extra arguments become the script's positional parameters
        PipEnv::with_command("sh", ["-c", script, "pip"])
    }

    fn ctx() -> TaskContext {
        TaskContext::new(TaskId::next())
    }

    #[test]
    fn test_packages_parses_json_listing() {
        let env = scripted(
            r#"[ "$1" = list ] || exit 9; echo '[{"name": "requests", "version": "2.31.0"}, {"name": "six", "version": "1.16.0"}]'"#,
        );
        let packages = env.packages(&ctx()).unwrap();
        assert_eq!(
            packages,
            vec![
                PackageInfo { name: "requests".into(), version: "2.31.0".into() },
                PackageInfo { name: "six".into(), version: "1.16.0".into() },
            ]
        );
    }

    #[test]
    fn test_outdated_reads_latest_version() {
        let env = scripted(
            r#"[ "$2" = --outdated ] || exit 9; echo '[{"name": "six", "version": "1.15.0", "latest_version": "1.16.0", "latest_filetype": "wheel"}]'"#,
        );
        let outdated = env.outdated(&ctx()).unwrap();
        assert_eq!(outdated.len(), 1);
        assert_eq!(outdated[0].latest, "1.16.0");
    }

    #[test]
    fn test_failed_listing_is_an_error() {
        let env = scripted("echo 'no module named pip' >&2; exit 1");
        match env.packages(&ctx()) {
            Err(EnvError::CommandFailed { code, stderr, .. }) => {
                assert_eq!(code, Some(1));
                assert_eq!(stderr, "no module named pip");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_garbage_listing_is_a_parse_error() {
        let env = scripted("echo not-json");
        assert!(matches!(env.packages(&ctx()), Err(EnvError::Parse(_))));
    }

    #[test]
    fn test_install_passes_options() {
        let env = scripted(
            r#"[ "$*" = "install --upgrade --pre --index-url https://mirror.example/simple requests" ]"#,
        );
        let opts = InstallOptions {
            upgrade: true,
            pre: true,
            user: false,
            index_url: Some("https://mirror.example/simple".into()),
        };
        assert!(env.install(&ctx(), "requests", &opts).unwrap());
        assert!(!env.install(&ctx(), "requests", &InstallOptions::default()).unwrap());
    }

    #[test]
    fn test_each_reports_per_package_result() {
        let env = scripted(r#"[ "$3" != broken ]"#);
        let names = vec!["good".to_string(), "broken".to_string()];
        let results = uninstall_each(&env, &ctx(), &names);
        assert_eq!(results, vec![("good".to_string(), true), ("broken".to_string(), false)]);
    }

    #[test]
    fn test_each_stops_when_cancelled() {
        let env = scripted("exit 0");
        let ctx = ctx();
        ctx.cancel();
        let names = vec!["a".to_string(), "b".to_string()];
        assert!(install_each(&env, &ctx, &names, &InstallOptions::default()).is_empty());
    }

    #[test]
    fn test_missing_interpreter_is_launch_error() {
        let env = PipEnv::new("/nonexistent/python");
        assert!(matches!(env.packages(&ctx()), Err(EnvError::Launch { .. })));
        assert_eq!(env.describe(), "/nonexistent/python");
    }

    #[test]
    fn test_download_passes_destination() {
        let env = scripted(r#"[ "$1 $2 $3 $4" = "download --dest wheels --no-deps" ]"#);
        let opts = DownloadOptions {
            dest: Some(PathBuf::from("wheels")),
            no_deps: true,
            ..DownloadOptions::default()
        };
        let results = download_each(&env, &ctx(), &["six".to_string()], &opts);
        assert_eq!(results, vec![("six".to_string(), true)]);
    }

    #[test]
    fn test_global_index_roundtrip() {
        let env = scripted(r#"[ "$1 $2 $3" = "config get global.index-url" ] && echo https://mirror.example/simple"#);
        assert_eq!(
            env.global_index(&ctx()).unwrap().as_deref(),
            Some("https://mirror.example/simple")
        );

        let unset = scripted("echo 'ERROR: No such key' >&2; exit 1");
        assert_eq!(unset.global_index(&ctx()).unwrap(), None);

        let setter = scripted(r#"[ "$*" = "config set global.index-url https://mirror.example/simple" ]"#);
        assert!(setter.set_global_index(&ctx(), "https://mirror.example/simple").is_ok());
        assert!(matches!(
            unset.set_global_index(&ctx(), "https://mirror.example/simple"),
            Err(EnvError::CommandFailed { .. })
        ));
    }

    #[test]
    fn test_missing_modules_asks_the_interpreter() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let python = dir.path().join("python");
        // stands in for `python -c <script> names..`
        std::fs::write(
            &python,
            "#!/bin/sh\nshift 2\nfor n in \"$@\"; do [ \"$n\" = yaml ] && echo \"$n\"; done\nexit 0\n",
        )
        .unwrap();
        std::fs::set_permissions(&python, std::fs::Permissions::from_mode(0o755)).unwrap();

        let env = PipEnv::new(&python);
        let modules = vec!["os".to_string(), "yaml".to_string()];
        assert_eq!(env.missing_modules(&ctx(), &modules).unwrap(), vec!["yaml"]);
        assert!(env.missing_modules(&ctx(), &[]).unwrap().is_empty());
    }
}

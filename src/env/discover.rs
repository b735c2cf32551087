use std::{
    collections::HashSet,
    env, fs,
    path::{Path, PathBuf},
    process::Command,
};

use log::{debug, info};

use crate::worker::context::TaskContext;

/// Directories listed in `PATH`.
pub fn search_dirs() -> Vec<PathBuf> {
    env::var_os("PATH")
        .map(|paths| env::split_paths(&paths).collect())
        .unwrap_or_default()
}

fn is_interpreter_name(name: &str) -> bool {
    if cfg!(windows) {
        return name.eq_ignore_ascii_case("python.exe");
    }
    match name.strip_prefix("python") {
        Some("") | Some("3") => true,
        Some(version) => version
            .strip_prefix("3.")
            .map_or(false, |minor| !minor.is_empty() && minor.chars().all(|c| c.is_ascii_digit())),
        None => false,
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    if cfg!(windows) {
        a.to_string_lossy().to_lowercase() == b.to_string_lossy().to_lowercase()
    } else {
        a == b
    }
}

/// Finds working interpreters in `dirs` that are not in `known`.
///
/// Names pointing at the same executable (`python3` and `python3.12` links)
/// are reported once. Every candidate is run with `--version`; stops early
/// when the task is cancelled.
pub fn find_interpreters(ctx: &TaskContext, dirs: &[PathBuf], known: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen: HashSet<PathBuf> = known
        .iter()
        .map(|path| fs::canonicalize(path).unwrap_or_else(|_| path.clone()))
        .collect();
    let mut found = Vec::new();

    for dir in dirs {
        let Ok(entries) = fs::read_dir(dir) else {
            continue;
        };
        let mut candidates: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .map_or(false, is_interpreter_name)
            })
            .collect();
        candidates.sort();

        for path in candidates {
            if ctx.is_cancelled() {
                info!("Interpreter search cancelled.");
                return found;
            }
            if known.iter().any(|k| same_path(k, &path)) {
                continue;
            }
            let target = fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
            if !seen.insert(target) {
                continue;
            }
            match ctx.output(Command::new(&path).arg("--version")) {
                Ok(output) if output.status.success() => {
                    debug!("Found interpreter {}.", path.display());
                    found.push(path);
                }
                Ok(_) | Err(_) => debug!("{} is not a usable interpreter.", path.display()),
            }
        }
    }
    found
}

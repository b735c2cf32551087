use std::{
    collections::BTreeSet,
    fs, io,
    path::{Path, PathBuf},
};

use crate::error::EnvError;

const SKIPPED_DIRS: &[&str] = &["__pycache__", "venv", ".venv", "env", "build", "dist", "site-packages"];

/// Top-level modules imported anywhere under `root`, minus the project's own
/// modules and packages.
pub fn project_imports(root: &Path) -> Result<BTreeSet<String>, EnvError> {
    let mut sources = Vec::new();
    let mut local = BTreeSet::new();
    collect(root, &mut sources, &mut local).map_err(|source| EnvError::Io {
        path: root.to_path_buf(),
        source,
    })?;

    let mut imports = BTreeSet::new();
    for path in &sources {
        let text = fs::read_to_string(path).map_err(|source| EnvError::Io {
            path: path.clone(),
            source,
        })?;
        for line in text.lines() {
            imports.extend(imported_modules(line));
        }
    }
    imports.retain(|module| !local.contains(module));
    Ok(imports)
}

fn collect(dir: &Path, sources: &mut Vec<PathBuf>, local: &mut BTreeSet<String>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        if path.is_dir() {
            if name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_str()) {
                continue;
            }
            local.insert(name);
            collect(&path, sources, local)?;
        } else if let Some(stem) = name.strip_suffix(".py") {
            local.insert(stem.to_string());
            sources.push(path);
        }
    }
    Ok(())
}

/// Top-level module names of one `import`/`from` statement.
fn imported_modules(line: &str) -> Vec<String> {
    let line = line.split('#').next().unwrap_or("").trim();
    let top = |module: &str| module.split('.').next().unwrap_or("").trim().to_string();

    if let Some(rest) = line.strip_prefix("from ") {
        let module = rest.split_whitespace().next().unwrap_or("");
        // relative imports stay inside the project
        if module.is_empty() || module.starts_with('.') {
            return Vec::new();
        }
        return vec![top(module)];
    }
    if let Some(rest) = line.strip_prefix("import ") {
        return rest
            .split(',')
            .map(|part| top(part.split_whitespace().next().unwrap_or("")))
            .filter(|module| !module.is_empty())
            .collect();
    }
    Vec::new()
}

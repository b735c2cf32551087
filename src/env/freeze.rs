use std::{
    ffi::OsString,
    io::{BufRead, BufReader, Read},
    path::PathBuf,
    process::{Command, Stdio},
    thread,
};

use crossbeam_channel::Sender;
use log::{error, info};

use crate::config::FreezeConfig;
use crate::error::EnvError;
use crate::worker::context::TaskContext;

/// Exit code reported when the freezing tool could not be run at all.
pub const LAUNCH_FAILED: i32 = -1;

/// Drives the executable-freezing tool: `prepare` builds the argument list
/// from the settings, `execute` runs it and streams its output.
#[derive(Debug, Clone)]
pub struct FreezeTool {
    program: PathBuf,
    prefix: Vec<OsString>,
    args: Vec<String>,
    workdir: Option<PathBuf>,
}

impl FreezeTool {
    pub fn new(python: impl Into<PathBuf>) -> Self {
        Self::with_command(python, ["-m", "PyInstaller"])
    }

    pub fn with_command<I, S>(program: impl Into<PathBuf>, prefix: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        FreezeTool {
            program: program.into(),
            prefix: prefix.into_iter().map(Into::into).collect(),
            args: Vec::new(),
            workdir: None,
        }
    }

    pub fn prepare(&mut self, config: &FreezeConfig) -> Result<(), EnvError> {
        let entry = config.entry.as_ref().ok_or(EnvError::NoEntry)?;
        let mut args = vec![entry.display().to_string(), "--noconfirm".to_string()];
        if config.one_file {
            args.push("--onefile".to_string());
        }
        if let Some(dir) = &config.output_dir {
            args.push("--distpath".to_string());
            args.push(dir.display().to_string());
        }
        args.extend(config.extra_args.iter().cloned());
        self.args = args;
        self.workdir = config.project_root.clone();
        Ok(())
    }

    pub fn is_prepared(&self) -> bool {
        !self.args.is_empty()
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Runs the prepared command, sending every output line to `sink`.
    /// Returns the tool's exit code, or [`LAUNCH_FAILED`].
    pub fn execute(&self, ctx: &TaskContext, sink: &Sender<String>) -> i32 {
        if !self.is_prepared() {
            error!("Freeze tool executed before prepare().");
            return LAUNCH_FAILED;
        }

        let mut command = Command::new(&self.program);
        command
            .args(&self.prefix)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.workdir {
            command.current_dir(dir);
        }

        let mut child = match ctx.spawn(&mut command) {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to launch {}: {}", self.program.display(), e);
                return LAUNCH_FAILED;
            }
        };
        info!("Freezing with {} {}", self.program.display(), self.args.join(" "));

        let readers: Vec<_> = [
            child.stdout.take().map(|out| forward_lines(out, "stdout", sink.clone())),
            child.stderr.take().map(|err| forward_lines(err, "stderr", sink.clone())),
        ]
        .into_iter()
        .flatten()
        .collect();

        let code = match ctx.wait(child) {
            Ok(status) => status.code().unwrap_or(LAUNCH_FAILED),
            Err(e) => {
                error!("Failed to wait for freeze tool: {}", e);
                LAUNCH_FAILED
            }
        };
        for reader in readers {
            let _ = reader.join();
        }
        info!("Freeze tool exited with {}", code);
        code
    }
}

fn forward_lines<R>(stream: R, label: &'static str, sink: Sender<String>) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        for line in BufReader::new(stream).lines().map_while(Result::ok) {
            // nobody listening is fine, keep draining the pipe
            let _ = sink.send(format!("[{}] {}", label, line));
        }
    })
}

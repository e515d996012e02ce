pub mod commands;
pub mod runner;

use crate::bundle::{BundleError, CollectedBundle};
use commands::{render_script, DiagnosticCommand};
use runner::CommandRunner;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const WORK_DIR_PREFIX: &str = "storpool-inventory.";

const SCRIPT_NAME: &str = "collect.sh";
const RUN_LOG_NAME: &str = "collect.txt";
const RUN_ERRORS_NAME: &str = "collect.err";

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("failed to create a work directory under {path}: {source}")]
    WorkDir { path: PathBuf, source: io::Error },
    #[error("failed to write {path}: {source}")]
    Capture { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Bundle(#[from] BundleError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectSummary {
    pub entries: usize,
    pub bytes_written: usize,
    pub failed_commands: usize,
}

pub struct Collector<'a, R> {
    runner: &'a R,
    commands: &'a [DiagnosticCommand],
    work_dir_parent: &'a Path,
    timeout: Duration,
    sudo: bool,
}

impl<'a, R: CommandRunner> Collector<'a, R> {
    pub fn new(
        runner: &'a R,
        commands: &'a [DiagnosticCommand],
        work_dir_parent: &'a Path,
        timeout: Duration,
        sudo: bool,
    ) -> Self {
        Self {
            runner,
            commands,
            work_dir_parent,
            timeout,
            sudo,
        }
    }

    pub async fn collect(&self, bundle_path: &Path) -> Result<CollectSummary, CollectError> {
        // Dropping `work` removes the directory, on the error paths too.
        let work = tempfile::Builder::new()
            .prefix(WORK_DIR_PREFIX)
            .tempdir_in(self.work_dir_parent)
            .map_err(|source| CollectError::WorkDir {
                path: self.work_dir_parent.to_path_buf(),
                source,
            })?;
        let dir = work.path();
        debug!(dir = %dir.display(), "created the work directory");

        write_capture(dir, SCRIPT_NAME, render_script(self.commands, self.sudo).as_bytes())?;

        let mut run_log = String::new();
        let mut run_errors = String::new();
        let mut failed_commands = 0;
        for cmd in self.commands {
            let mut line = cmd.command_line();
            if self.sudo {
                line = line.with_sudo();
            }
            match self.runner.run(&line, self.timeout).await {
                Ok(output) => {
                    write_capture(dir, &cmd.stdout_name(), &output.stdout)?;
                    write_capture(dir, &cmd.stderr_name(), &output.stderr)?;
                    let code = output
                        .code
                        .map_or_else(|| "signal".to_string(), |c| c.to_string());
                    let _ = writeln!(
                        run_log,
                        "{}: exit {} in {}ms",
                        cmd.label,
                        code,
                        output.elapsed.as_millis()
                    );
                    if !output.success() {
                        failed_commands += 1;
                    }
                }
                Err(err) => {
                    warn!(command = %line, error = %err, "diagnostic command did not run");
                    write_capture(dir, &cmd.stdout_name(), b"")?;
                    write_capture(dir, &cmd.stderr_name(), format!("{err}\n").as_bytes())?;
                    let _ = writeln!(run_log, "{}: not run", cmd.label);
                    let _ = writeln!(run_errors, "{}: {err}", cmd.label);
                    failed_commands += 1;
                }
            }
        }
        write_capture(dir, RUN_LOG_NAME, run_log.as_bytes())?;
        write_capture(dir, RUN_ERRORS_NAME, run_errors.as_bytes())?;

        let bundle = CollectedBundle::from_dir(dir)?;
        debug!(entries = bundle.len(), names = ?bundle.names().collect::<Vec<_>>(), "scanned the work directory");
        let bytes_written = bundle.write_to(bundle_path)?;
        info!(
            path = %bundle_path.display(),
            entries = bundle.len(),
            bytes = bytes_written,
            failed_commands,
            "bundle written"
        );

        if let Err(err) = work.close() {
            warn!(error = %err, "could not remove the work directory");
        }

        Ok(CollectSummary {
            entries: bundle.len(),
            bytes_written,
            failed_commands,
        })
    }
}

fn write_capture(dir: &Path, name: &str, bytes: &[u8]) -> Result<(), CollectError> {
    let path = dir.join(name);
    fs::write(&path, bytes).map_err(|source| CollectError::Capture { path, source })
}

/// Effective uid 0, read from `/proc/self/status`. Anything unreadable counts
/// as "not root".
pub fn running_as_root() -> bool {
    fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| parse_effective_uid(&status))
        == Some(0)
}

fn parse_effective_uid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|ids| ids.split_whitespace().nth(1))
        .and_then(|euid| euid.parse().ok())
}

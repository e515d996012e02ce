//! The two Juju hook tools this agent talks to: `config-get` for the charm
//! option and `status-set` for the unit status.

use crate::collectors::runner::{CommandLine, CommandRunner, RunError};
use crate::status::{LogStatus, Status, StatusLevel, StatusSink};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

const HOOK_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum HookToolError {
    #[error(transparent)]
    Run(#[from] RunError),
    #[error("config-get exited with {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },
    #[error("config-get printed something other than a JSON string: {0}")]
    Parse(#[from] serde_json::Error),
}

pub async fn config_get_submit_url<R: CommandRunner>(
    runner: &R,
) -> Result<Option<String>, HookToolError> {
    let cmd = CommandLine::new("config-get").args(["--format=json", "submit_url"]);
    let out = runner.run(&cmd, HOOK_TOOL_TIMEOUT).await?;
    if !out.success() {
        return Err(HookToolError::Failed {
            code: out.code,
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        });
    }
    Ok(serde_json::from_slice(&out.stdout)?)
}

/// Reports status through `status-set`. Juju has no charm-settable "error"
/// state, so errors show up as `blocked`.
pub struct HookToolStatus<'a, R> {
    runner: &'a R,
}

impl<'a, R: CommandRunner> HookToolStatus<'a, R> {
    pub fn new(runner: &'a R) -> Self {
        Self { runner }
    }

    fn juju_level(level: StatusLevel) -> &'static str {
        match level {
            StatusLevel::Maintenance => "maintenance",
            StatusLevel::Active => "active",
            StatusLevel::Error => "blocked",
        }
    }
}

impl<R: CommandRunner> StatusSink for HookToolStatus<'_, R> {
    async fn set(&self, status: &Status) {
        info!(level = %status.level, message = %status.message, "unit status");
        let cmd = CommandLine::new("status-set")
            .arg(Self::juju_level(status.level))
            .arg(status.message.as_str());
        match self.runner.run(&cmd, HOOK_TOOL_TIMEOUT).await {
            Ok(out) if out.success() => {}
            Ok(out) => warn!(
                code = ?out.code,
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "status-set failed"
            ),
            Err(err) => warn!(error = %err, "could not run status-set"),
        }
    }
}

pub enum UnitStatus<'a, R> {
    Log(LogStatus),
    HookTool(HookToolStatus<'a, R>),
}

impl<R: CommandRunner> StatusSink for UnitStatus<'_, R> {
    async fn set(&self, status: &Status) {
        match self {
            UnitStatus::Log(sink) => sink.set(status).await,
            UnitStatus::HookTool(sink) => sink.set(status).await,
        }
    }
}

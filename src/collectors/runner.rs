use std::fmt;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// One external program invocation. Arguments are passed as-is, never through
/// a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_sudo(self) -> Self {
        let mut args = vec!["-n".to_string(), self.program];
        args.extend(self.args);
        Self {
            program: "sudo".to_string(),
            args,
            env: self.env,
        }
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("failed waiting for {program}: {source}")]
    Wait {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} timed out after {timeout:?}")]
    TimedOut { program: String, timeout: Duration },
}

pub trait CommandRunner {
    async fn run(&self, cmd: &CommandLine, timeout: Duration) -> Result<CommandOutput, RunError>;
}

/// Spawns real processes with tokio. A command that outlives its timeout is
/// killed when its child handle is dropped.
pub struct TokioCommandRunner;

impl CommandRunner for TokioCommandRunner {
    async fn run(&self, cmd: &CommandLine, timeout: Duration) -> Result<CommandOutput, RunError> {
        let start = Instant::now();
        let child = Command::new(&cmd.program)
            .args(&cmd.args)
            .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunError::Spawn {
                program: cmd.program.clone(),
                source,
            })?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| RunError::Wait {
                program: cmd.program.clone(),
                source,
            })?,
            Err(_) => {
                return Err(RunError::TimedOut {
                    program: cmd.program.clone(),
                    timeout,
                })
            }
        };

        let elapsed = start.elapsed();
        debug!(command = %cmd, code = ?output.status.code(), elapsed_ms = elapsed.as_millis() as u64, "command finished");
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
            elapsed,
        })
    }
}

#[cfg(test)]
pub mod testing {
    use super::{CommandLine, CommandOutput, CommandRunner, RunError};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    pub struct FakeRunner {
        answers: HashMap<String, CommandOutput>,
        pub calls: Mutex<Vec<CommandLine>>,
        pub timeouts: Mutex<Vec<Duration>>,
    }

    impl FakeRunner {
        pub fn answer(mut self, line: &str, code: i32, stdout: &str, stderr: &str) -> Self {
            self.answers.insert(
                line.to_string(),
                CommandOutput {
                    code: Some(code),
                    stdout: stdout.as_bytes().to_vec(),
                    stderr: stderr.as_bytes().to_vec(),
                    elapsed: Duration::from_millis(1),
                },
            );
            self
        }

        pub fn rendered_calls(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(ToString::to_string)
                .collect()
        }
    }

    impl CommandRunner for FakeRunner {
        async fn run(
            &self,
            cmd: &CommandLine,
            timeout: Duration,
        ) -> Result<CommandOutput, RunError> {
            self.calls.lock().unwrap().push(cmd.clone());
            self.timeouts.lock().unwrap().push(timeout);
            self.answers
                .get(&cmd.to_string())
                .cloned()
                .ok_or_else(|| RunError::Spawn {
                    program: cmd.program.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
                })
        }
    }
}

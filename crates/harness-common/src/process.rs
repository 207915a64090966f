//! External tool invocation (packer, terraform, gcloud)
//!
//! All commands run through [`run_cmd`] so stdout is streamed into the
//! harness log while the tool runs. Image builds and applies take minutes;
//! seeing their progress matters when a stage hangs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

/// Errors from running an external command
#[derive(Debug, Error)]
pub enum CommandError {
    /// The program could not be started at all
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program name
        program: String,
        /// Underlying io error
        source: std::io::Error,
    },

    /// The program ran but exited unsuccessfully
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        /// Program name
        program: String,
        /// Exit status
        status: ExitStatus,
        /// Captured stderr (trimmed)
        stderr: String,
    },

    /// The program did not finish within its timeout and was killed
    #[error("{program} timed out after {timeout:?}")]
    Timeout {
        /// Program name
        program: String,
        /// The timeout that elapsed
        timeout: Duration,
    },

    /// Reading the program's output failed
    #[error("io error while running {program}: {source}")]
    Io {
        /// Program name
        program: String,
        /// Underlying io error
        source: std::io::Error,
    },
}

/// Description of a command to run
#[derive(Clone, Debug, Default)]
pub struct CommandSpec {
    /// Program to execute
    pub program: String,
    /// Arguments
    pub args: Vec<String>,
    /// Working directory (inherits the harness's cwd when unset)
    pub cwd: Option<PathBuf>,
    /// Extra environment variables
    pub env: BTreeMap<String, String>,
    /// Kill the process if it runs longer than this
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    /// Start describing an invocation of `program`
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run inside `dir`
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Set an environment variable for the child
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Limit the wall-clock runtime
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Render as a shell-like string for logs
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured output of a successful command
#[derive(Clone, Debug, Default)]
pub struct CommandOutput {
    /// Full stdout
    pub stdout: String,
    /// Full stderr
    pub stderr: String,
}

impl CommandOutput {
    /// Stdout split into lines
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines()
    }
}

/// Run a command to completion, streaming stdout to the log.
pub async fn run_cmd(spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
    let program = spec.program.clone();
    debug!(command = %spec.display(), "Running command");

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(ref dir) = spec.cwd {
        command.current_dir(dir);
    }

    let mut child = command.spawn().map_err(|source| CommandError::Spawn {
        program: program.clone(),
        source,
    })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let run = async {
        let read_stdout = async {
            let mut captured = String::new();
            if let Some(out) = stdout {
                let mut lines = BufReader::new(out).lines();
                while let Some(line) = lines.next_line().await? {
                    debug!(program = %spec.program, "{}", line);
                    captured.push_str(&line);
                    captured.push('\n');
                }
            }
            Ok::<_, std::io::Error>(captured)
        };
        let read_stderr = async {
            let mut captured = String::new();
            if let Some(mut err) = stderr {
                err.read_to_string(&mut captured).await?;
            }
            Ok::<_, std::io::Error>(captured)
        };

        let (stdout, stderr) = tokio::try_join!(read_stdout, read_stderr)?;
        let status = child.wait().await?;
        Ok::<_, std::io::Error>((status, stdout, stderr))
    };

    let outcome = match spec.timeout {
        Some(timeout) => match tokio::time::timeout(timeout, run).await {
            Ok(outcome) => outcome,
            // kill_on_drop stops the child when it goes out of scope
            Err(_) => return Err(CommandError::Timeout { program, timeout }),
        },
        None => run.await,
    };

    let (status, stdout, stderr) = outcome.map_err(|source| CommandError::Io {
        program: program.clone(),
        source,
    })?;

    if !status.success() {
        return Err(CommandError::Failed {
            program,
            status,
            stderr: stderr.trim().to_string(),
        });
    }

    Ok(CommandOutput { stdout, stderr })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_joins_program_and_args() {
        let spec = CommandSpec::new("terraform")
            .args(["apply", "-input=false"])
            .arg("-auto-approve");
        assert_eq!(spec.display(), "terraform apply -input=false -auto-approve");
    }

    #[tokio::test]
    async fn captures_stdout_of_successful_command() {
        let output = run_cmd(&CommandSpec::new("sh").args(["-c", "echo one; echo two"]))
            .await
            .unwrap();
        assert_eq!(output.lines().collect::<Vec<_>>(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn non_zero_exit_reports_stderr() {
        let err = run_cmd(&CommandSpec::new("sh").args(["-c", "echo broken >&2; exit 3"]))
            .await
            .unwrap_err();
        match err {
            CommandError::Failed { program, stderr, .. } => {
                assert_eq!(program, "sh");
                assert_eq!(stderr, "broken");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let err = run_cmd(&CommandSpec::new("definitely-not-a-real-tool-7f3a"))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let err = run_cmd(
            &CommandSpec::new("sleep")
                .arg("5")
                .timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CommandError::Timeout { .. }));
    }

    #[tokio::test]
    async fn env_and_cwd_are_applied() {
        let dir = std::env::temp_dir();
        let output = run_cmd(
            &CommandSpec::new("sh")
                .args(["-c", "echo $HARNESS_VALUE; pwd"])
                .env("HARNESS_VALUE", "hello")
                .current_dir(&dir),
        )
        .await
        .unwrap();
        let lines: Vec<_> = output.lines().collect();
        assert_eq!(lines[0], "hello");
        assert!(!lines[1].is_empty());
    }
}

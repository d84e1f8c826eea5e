//! External command execution.
//!
//! Every tool the engine drives (iscsiadm, multipath, blkid, mkfs, mount, ...)
//! is launched through an [`Executor`]. The actual process handling lives
//! behind the [`CommandRunner`] trait so that workflows can be driven by a
//! scripted runner in tests.
//!
//! A run with a timeout races the child against a timer; when the timer wins
//! the child is killed and reaped before [`ExecError::Timeout`] is returned,
//! so no process outlives the call that spawned it.

use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, error};

use crate::metrics;

static XTERM_CONTROL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1B\[[0-9;]*[a-zA-Z]").expect("Invalid regex pattern"));

/// Errors returned by a single process invocation.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("{program} killed after {:.0} second timeout", .timeout.as_secs_f64())]
    Timeout { program: String, timeout: Duration },

    #[error("failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to kill {program} after timeout: {source}")]
    Kill {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed ({}): {}", describe_code(.code), sanitize_output(.output))]
    Exit {
        command: String,
        code: Option<i32>,
        output: Vec<u8>,
    },
}

impl ExecError {
    /// Exit code of a process that ran to completion with a nonzero status.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ExecError::Exit { code, .. } => *code,
            _ => None,
        }
    }

    /// Output captured before the failure, if the process completed.
    pub fn output(&self) -> &[u8] {
        match self {
            ExecError::Exit { output, .. } => output,
            _ => &[],
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecError::Timeout { .. })
    }
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}

/// Strip terminal control sequences and the trailing newline for logging.
///
/// Only ever applied to the logged copy; callers always see the raw bytes.
pub fn sanitize_output(output: &[u8]) -> String {
    let text = String::from_utf8_lossy(output);
    let stripped = XTERM_CONTROL.replace_all(&text, "");
    let stripped: &str = &stripped;
    stripped.strip_suffix('\n').unwrap_or(stripped).to_string()
}

/// One external process to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Wall-clock bound; `None` waits unconditionally.
    pub timeout: Option<Duration>,
    /// Whether the (sanitized) output may be written to the log.
    pub log_output: bool,
    /// Arguments carry secrets and must not be logged.
    pub sensitive: bool,
}

impl Invocation {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            timeout: None,
            log_output: true,
            sensitive: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn without_output_logging(mut self) -> Self {
        self.log_output = false;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    /// Command line for logs and error messages, with secrets withheld.
    pub fn command_line(&self) -> String {
        if self.sensitive {
            format!("{} <{} args redacted>", self.program, self.args.len())
        } else if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Spawns a process and waits for it.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run one process to completion, returning stdout followed by stderr.
    async fn run(&self, invocation: &Invocation) -> Result<Vec<u8>, ExecError>;
}

/// Runs real processes with tokio.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe
        && let Err(e) = pipe.read_to_end(&mut buf).await
    {
        debug!(error = %e, "Failed to read process output");
    }
    buf
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation) -> Result<Vec<u8>, ExecError> {
        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let completion = async {
            tokio::join!(child.wait(), read_pipe(stdout), read_pipe(stderr))
        };

        let finished = match invocation.timeout {
            Some(limit) if !limit.is_zero() => tokio::time::timeout(limit, completion).await.ok(),
            _ => Some(completion.await),
        };

        let Some((status, mut output, stderr_output)) = finished else {
            // kill() also reaps the child
            if let Err(source) = child.kill().await {
                error!(process = %invocation.program, error = %source, "Failed to kill process");
                return Err(ExecError::Kill {
                    program: invocation.program.clone(),
                    source,
                });
            }
            error!(process = %invocation.program, "Process killed after timeout");
            return Err(ExecError::Timeout {
                program: invocation.program.clone(),
                timeout: invocation.timeout.unwrap_or_default(),
            });
        };

        output.extend_from_slice(&stderr_output);

        let status = status.map_err(|source| ExecError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;

        if status.success() {
            Ok(output)
        } else {
            Err(ExecError::Exit {
                command: invocation.command_line(),
                code: status.code(),
                output,
            })
        }
    }
}

/// Shared handle used by every component to launch tools.
#[derive(Clone)]
pub struct Executor {
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor").finish_non_exhaustive()
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::system()
    }
}

impl Executor {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Executor backed by real processes.
    pub fn system() -> Self {
        Self::new(Arc::new(SystemRunner))
    }

    pub async fn run(&self, invocation: Invocation) -> Result<Vec<u8>, ExecError> {
        let command_line = invocation.command_line();
        debug!(
            command = %command_line,
            timeout = ?invocation.timeout,
            ">>>> exec"
        );

        let result = self.runner.run(&invocation).await;

        match &result {
            Ok(output) if invocation.log_output => {
                debug!(command = %invocation.program, output = %sanitize_output(output), "<<<< exec");
            }
            Ok(_) => debug!(command = %invocation.program, "<<<< exec"),
            Err(e) => {
                if e.is_timeout() {
                    metrics::record_command_timeout(&invocation.program);
                }
                if invocation.log_output {
                    debug!(
                        command = %invocation.program,
                        error = %e,
                        output = %sanitize_output(e.output()),
                        "<<<< exec"
                    );
                } else {
                    debug!(command = %invocation.program, error = %e, "<<<< exec");
                }
            }
        }

        result
    }

    /// Run without a timeout.
    pub async fn exec(&self, program: &str, args: &[&str]) -> Result<Vec<u8>, ExecError> {
        self.run(Invocation::new(program, args.iter().copied())).await
    }

    /// Run with a wall-clock bound, logging the output.
    pub async fn exec_with_timeout(
        &self,
        program: &str,
        timeout: Duration,
        args: &[&str],
    ) -> Result<Vec<u8>, ExecError> {
        self.run(Invocation::new(program, args.iter().copied()).with_timeout(timeout))
            .await
    }
}

//! External tool invocation.
//!
//! Tools are opaque: the pipeline only sees their exit status and text
//! output. Output is read line by line while the child runs so stages can
//! turn it into progress, and only the last [`TAIL_LINES`] lines are kept
//! for error reports.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Number of trailing output lines carried in a failure.
pub const TAIL_LINES: usize = 40;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to start {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "{tool} exited with {status}\n{output}",
        status = describe_exit(.exit_code),
        output = .tail.join("\n")
    )]
    Failed {
        tool: String,
        args: Vec<String>,
        exit_code: Option<i32>,
        tail: Vec<String>,
    },

    #[error("{tool} timed out after {after:?}")]
    TimedOut { tool: String, after: Duration },

    #[error("{tool} did not produce {}", path.display())]
    MissingOutput { tool: String, path: PathBuf },

    #[error("waiting for {tool}: {source}")]
    Wait {
        tool: String,
        #[source]
        source: std::io::Error,
    },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code (killed by signal)".to_string(),
    }
}

/// A single command line to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub envs: Vec<(String, String)>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            timeout: None,
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append a path argument.
    pub fn path_arg(self, path: impl AsRef<Path>) -> Self {
        self.arg(path.as_ref().to_string_lossy())
    }

    /// Append `--name value`.
    pub fn flag(self, name: &str, value: impl ToString) -> Self {
        self.arg(name).arg(value.to_string())
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Short name for logs and errors: the program's file name plus a
    /// leading subcommand if there is one.
    pub fn tool_name(&self) -> String {
        let program = Path::new(&self.program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.clone());
        match self.args.first() {
            Some(sub) if !sub.starts_with('-') && !sub.contains(['/', '\\', '.']) => {
                format!("{program} {sub}")
            }
            _ => program,
        }
    }

    /// The full command line, for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Result of a successful invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub tail: Vec<String>,
}

/// Runs external tools.
///
/// Implementations must not return before the child has exited, and must
/// make sure the child dies if the returned future is dropped.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run to completion. Each output line (stdout and stderr merged) is
    /// forwarded to `lines` when given.
    async fn run(
        &self,
        invocation: &ToolInvocation,
        lines: Option<mpsc::Sender<String>>,
    ) -> Result<ProcessOutput, ToolError>;
}

/// Fail with [`ToolError::MissingOutput`] unless `path` exists.
pub fn require_output(tool: &str, path: &Path) -> Result<(), ToolError> {
    if path.exists() {
        Ok(())
    } else {
        Err(ToolError::MissingOutput {
            tool: tool.to_string(),
            path: path.to_path_buf(),
        })
    }
}

/// Spawns real processes with `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl ToolRunner for SystemRunner {
    #[tracing::instrument(skip_all, fields(tool = %invocation.tool_name()))]
    async fn run(
        &self,
        invocation: &ToolInvocation,
        lines: Option<mpsc::Sender<String>>,
    ) -> Result<ProcessOutput, ToolError> {
        let tool = invocation.tool_name();
        debug!("Running {}", invocation.display());

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in &invocation.envs {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|source| ToolError::Spawn {
            tool: tool.clone(),
            source,
        })?;

        let (merged_tx, mut merged_rx) = mpsc::channel::<String>(256);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, merged_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, merged_tx.clone()));
        }
        drop(merged_tx);

        let collect = async {
            let mut tail = VecDeque::with_capacity(TAIL_LINES);
            while let Some(line) = merged_rx.recv().await {
                debug!(target: "recon_pipeline::tool", tool = %tool, "{line}");
                if let Some(lines) = &lines {
                    // A consumer that stopped listening does not stop the tool.
                    let _ = lines.send(line.clone()).await;
                }
                if tail.len() == TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            let status = child.wait().await;
            (status, tail)
        };

        let (status, tail) = match invocation.timeout {
            Some(limit) => match tokio::time::timeout(limit, collect).await {
                Ok(done) => done,
                Err(_) => {
                    warn!("{} exceeded {:?}, killing it", tool, limit);
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill {}: {}", tool, e);
                    }
                    return Err(ToolError::TimedOut { tool, after: limit });
                }
            },
            None => collect.await,
        };

        let status = status.map_err(|source| ToolError::Wait {
            tool: tool.clone(),
            source,
        })?;
        let tail: Vec<String> = tail.into();

        if status.success() {
            Ok(ProcessOutput {
                exit_code: status.code().unwrap_or(0),
                tail,
            })
        } else {
            Err(ToolError::Failed {
                tool,
                args: invocation.args.clone(),
                exit_code: status.code(),
                tail,
            })
        }
    }
}

/// Split a stream on `\n` and `\r` and send each non-empty line.
///
/// Carriage returns count as line breaks since progress bars redraw in place.
async fn forward_lines<R>(stream: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let mut complete = Vec::new();
        let consumed = match reader.fill_buf().await {
            Ok([]) => break,
            Ok(chunk) => {
                let mut start = 0;
                for (i, &byte) in chunk.iter().enumerate() {
                    if byte == b'\n' || byte == b'\r' {
                        pending.extend_from_slice(&chunk[start..i]);
                        complete.push(std::mem::take(&mut pending));
                        start = i + 1;
                    }
                }
                pending.extend_from_slice(&chunk[start..]);
                chunk.len()
            }
            Err(e) => {
                warn!("Reading tool output failed: {}", e);
                break;
            }
        };
        reader.consume(consumed);

        for line in complete {
            if !send_line(&tx, &line).await {
                return;
            }
        }
    }
    send_line(&tx, &pending).await;
}

async fn send_line(tx: &mpsc::Sender<String>, bytes: &[u8]) -> bool {
    let line = String::from_utf8_lossy(bytes);
    let line = line.trim();
    if line.is_empty() {
        return true;
    }
    tx.send(line.to_string()).await.is_ok()
}

//! The external markup converter.
//!
//! Conversion never fails the pipeline: a converter that cannot start, exits
//! non-zero or prints nothing yields [`Conversion::Failed`], and one that runs
//! past its deadline is killed, reaped and reported as [`Conversion::TimedOut`].

use crate::config::TIMEOUT_MARKER;
use std::future::Future;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Html,
    Textile,
    MediaWiki,
}

impl Dialect {
    pub fn pandoc_name(self) -> &'static str {
        match self {
            Dialect::Html => "html",
            Dialect::Textile => "textile",
            Dialect::MediaWiki => "mediawiki",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conversion {
    Converted(String),
    Failed,
    TimedOut,
}

impl Conversion {
    /// Text a pipeline stage continues with.
    ///
    /// A failed hop passes `input` through; a timed-out one marks it for manual review.
    pub fn into_text(self, input: &str) -> String {
        match self {
            Conversion::Converted(text) => text,
            Conversion::Failed => input.to_string(),
            Conversion::TimedOut => format!("{TIMEOUT_MARKER}\n{input}"),
        }
    }
}

pub trait MarkupConverter: Send + Sync + 'static {
    fn convert(
        &self,
        text: &str,
        from: Dialect,
        to: Dialect,
    ) -> impl Future<Output = Conversion> + Send;
}

/// Any plain function can stand in for the converter.
impl<F> MarkupConverter for F
where
    F: Fn(&str, Dialect, Dialect) -> Conversion + Send + Sync + 'static,
{
    fn convert(
        &self,
        text: &str,
        from: Dialect,
        to: Dialect,
    ) -> impl Future<Output = Conversion> + Send {
        std::future::ready(self(text, from, to))
    }
}

#[derive(Debug)]
pub enum ProcessOutcome {
    Finished {
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },
    SpawnFailed(io::Error),
    WaitFailed(io::Error),
    /// The process outlived its deadline and has been killed and reaped
    TimedOut { pid: Option<u32> },
}

/// Runs `pandoc --from <dialect> --to <dialect>` once per conversion hop.
#[derive(Debug, Clone)]
pub struct Pandoc {
    program: String,
    /// Arguments placed before `--from`/`--to`
    args: Vec<String>,
    timeout: Duration,
}

impl Pandoc {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn command(&self, from: Dialect, to: Dialect) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .args(["--from", from.pandoc_name(), "--to", to.pandoc_name()])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Feeds `input` to one converter process and collects what it prints.
    pub async fn run(&self, input: &str, from: Dialect, to: Dialect) -> ProcessOutcome {
        let mut child = match self.command(from, to).spawn() {
            Ok(child) => child,
            Err(e) => return ProcessOutcome::SpawnFailed(e),
        };
        let pid = child.id();

        let writer = child.stdin.take().map(|mut stdin| {
            let input = input.as_bytes().to_vec();
            tokio::spawn(async move {
                // A converter that exits early closes its end; that shows up in the exit status.
                let _ = stdin.write_all(&input).await;
                let _ = stdin.shutdown().await;
            })
        });
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let waited = tokio::time::timeout(self.timeout, child.wait()).await;
        match waited {
            Ok(Ok(status)) => ProcessOutcome::Finished {
                status,
                stdout: collect(stdout).await,
                stderr: collect(stderr).await,
            },
            Ok(Err(e)) => ProcessOutcome::WaitFailed(e),
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!(pid, error = %e, "Failed to kill converter process");
                }
                for handle in [stdout, stderr].into_iter().flatten() {
                    handle.abort();
                }
                if let Some(handle) = writer {
                    handle.abort();
                }
                ProcessOutcome::TimedOut { pid }
            }
        }
    }
}

fn drain<R>(mut reader: R) -> JoinHandle<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf).await;
        buf
    })
}

async fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    match handle {
        Some(handle) => handle
            .await
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default(),
        None => String::new(),
    }
}

impl MarkupConverter for Pandoc {
    async fn convert(&self, text: &str, from: Dialect, to: Dialect) -> Conversion {
        match self.run(text, from, to).await {
            ProcessOutcome::Finished {
                status,
                stdout,
                stderr,
            } => {
                if !status.success() {
                    warn!(
                        program = %self.program,
                        from = from.pandoc_name(),
                        to = to.pandoc_name(),
                        code = status.code(),
                        stderr = %stderr.trim(),
                        "Converter failed, hop skipped"
                    );
                    Conversion::Failed
                } else if stdout.is_empty() {
                    debug!(from = from.pandoc_name(), to = to.pandoc_name(), "Converter printed nothing");
                    Conversion::Failed
                } else {
                    Conversion::Converted(stdout)
                }
            }
            ProcessOutcome::SpawnFailed(e) => {
                warn!(program = %self.program, error = %e, "Failed to start converter, hop skipped");
                Conversion::Failed
            }
            ProcessOutcome::WaitFailed(e) => {
                warn!(program = %self.program, error = %e, "Failed to wait for converter, hop skipped");
                Conversion::Failed
            }
            ProcessOutcome::TimedOut { pid } => {
                warn!(
                    program = %self.program,
                    pid,
                    timeout_secs = self.timeout.as_secs(),
                    chars = text.len(),
                    "Converter timed out"
                );
                Conversion::TimedOut
            }
        }
    }
}

//! Process-spawn and binary-check primitives behind the `ProcessRunner`
//! seam, so the executor pipeline can be driven by scripted runners in
//! tests.

use crate::registry::LinterMode;
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Result of a spawned process that was actually launched. Spawn-call
/// failures surface as `io::Error` instead and feed the retry classifier.
#[derive(Debug, Clone)]
pub struct SpawnOutcome {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// The process was terminated by external cancellation, not its limit.
    pub cancelled: bool,
    /// Combined stdout and stderr, lossily decoded.
    pub output: String,
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn spawn(
        &self,
        binary: &str,
        args: &[String],
        mode: LinterMode,
        limit: Duration,
        cancel: &CancellationToken,
    ) -> io::Result<SpawnOutcome>;

    fn binary_exists(&self, binary: &str) -> bool;
}

/// Transient spawn failures are retried; everything else (notably
/// permission errors) fails immediately.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ResourceBusy
    )
}

const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(500);

/// Production runner: tokio subprocesses in their own process group, with
/// graceful-then-forceful termination on timeout.
pub struct TokioProcessRunner {
    working_dir: PathBuf,
    kill_grace: Duration,
}

impl TokioProcessRunner {
    pub fn new(working_dir: impl AsRef<Path>) -> Self {
        Self {
            working_dir: working_dir.as_ref().to_path_buf(),
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    async fn terminate(&self, child: &mut Child, pid: Option<u32>) {
        #[cfg(unix)]
        if let Some(pid) = pid {
            use nix::sys::signal::{Signal, killpg};
            use nix::unistd::Pid;

            let group = Pid::from_raw(pid as i32);
            let _ = killpg(group, Signal::SIGTERM);
            if timeout(self.kill_grace, child.wait()).await.is_ok() {
                return;
            }
            let _ = killpg(group, Signal::SIGKILL);
        }
        let _ = child.kill().await;
        let _ = child.wait().await;
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn spawn(
        &self,
        binary: &str,
        args: &[String],
        mode: LinterMode,
        limit: Duration,
        cancel: &CancellationToken,
    ) -> io::Result<SpawnOutcome> {
        let mut cmd = match mode {
            LinterMode::Direct => {
                let mut c = Command::new(binary);
                c.args(args);
                c
            }
            LinterMode::Shell => {
                // `binary` is a pre-composed command line; args are quoted
                // so the shell cannot re-split them.
                let mut line = String::from(binary);
                for arg in args {
                    line.push(' ');
                    line.push_str(&shell_quote(arg));
                }
                let mut c = Command::new("sh");
                c.arg("-c").arg(line);
                c
            }
        };
        cmd.current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        let pid = child.id();
        let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
        let stderr_task = tokio::spawn(read_stream(child.stderr.take()));

        // `None` marks external cancellation; the wait future is dropped
        // before the child is terminated.
        let waited = tokio::select! {
            waited = timeout(limit, child.wait()) => Some(waited),
            _ = cancel.cancelled() => None,
        };
        let (exit_code, timed_out, cancelled) = match waited {
            Some(Ok(status)) => (status?.code(), false, false),
            Some(Err(_)) => {
                debug!(binary, ?limit, "process timed out, terminating group");
                self.terminate(&mut child, pid).await;
                (None, true, false)
            }
            None => {
                debug!(binary, "run cancelled, terminating group");
                self.terminate(&mut child, pid).await;
                (None, false, true)
            }
        };

        let mut output = stdout_task.await.unwrap_or_default();
        let stderr_text = stderr_task.await.unwrap_or_default();
        if !stderr_text.is_empty() {
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(&stderr_text);
        }

        Ok(SpawnOutcome {
            exit_code,
            timed_out,
            cancelled,
            output,
        })
    }

    fn binary_exists(&self, binary: &str) -> bool {
        if binary.contains(std::path::MAIN_SEPARATOR) {
            return Path::new(binary).is_file();
        }
        let Some(paths) = std::env::var_os("PATH") else {
            return false;
        };
        std::env::split_paths(&paths).any(|dir| dir.join(binary).is_file())
    }
}

/// Single-quote an argument for `sh -c` so embedded whitespace and shell
/// metacharacters survive as one word.
fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,".contains(c));
    if plain {
        return arg.to_string();
    }
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('\'');
    for c in arg.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}

async fn read_stream<R>(stream: Option<R>) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(mut reader) = stream else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

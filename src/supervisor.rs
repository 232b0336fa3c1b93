//! Server process supervision.
//!
//! Wraps a `tokio` child process: the server's console is on stdin, and its
//! stdout/stderr are drained by detached reader tasks that log each line.
//! Readers end at EOF and never hold up exit.
//!
//! Stopping is cooperative first: the shutdown line is written to stdin and
//! the process gets a grace period before it is killed.

use crate::error::{Error, Result};
use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, info, warn};

/// How a stopped process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOutcome {
    /// Exit code, if the process exited normally.
    pub exit_code: Option<i32>,
    /// True if the grace period ran out and the process was killed.
    pub forced: bool,
}

/// A running server process.
#[derive(Debug)]
pub struct ServerProcess {
    id: String,
    child: Child,
    stdin: Option<ChildStdin>,
}

impl ServerProcess {
    /// Spawns `command` (program then arguments) in `cwd`.
    pub fn spawn(id: &str, command: &[OsString], cwd: &Path) -> Result<Self> {
        let (program, args) = command.split_first().ok_or_else(|| Error::StartFailed {
            id: id.to_string(),
            reason: "empty command".to_string(),
        })?;

        let mut child = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::StartFailed {
                id: id.to_string(),
                reason: format!("{}: {}", program.to_string_lossy(), e),
            })?;

        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(id.to_string(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(id.to_string(), "stderr", stderr);
        }
        let stdin = child.stdin.take();

        info!(
            instance = %id,
            pid = ?child.id(),
            program = %program.to_string_lossy(),
            cwd = %cwd.display(),
            "server process started"
        );

        Ok(Self {
            id: id.to_string(),
            child,
            stdin,
        })
    }

    /// OS process id, while the process has not been reaped.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Writes one line to the server console.
    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| Error::Internal(format!(
            "stdin of {} is closed",
            self.id
        )))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Returns the exit code if the process has already exited.
    pub fn try_wait(&mut self) -> Result<Option<i32>> {
        Ok(self.child.try_wait()?.map(|status| status.code().unwrap_or(-1)))
    }

    /// Waits for the process to exit.
    pub async fn wait(&mut self) -> Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }

    /// Sends `stop_line`, waits up to `grace`, then kills.
    pub async fn stop(&mut self, stop_line: &str, grace: Duration) -> Result<StopOutcome> {
        if let Err(e) = self.send_line(stop_line).await {
            debug!(instance = %self.id, error = %e, "could not send shutdown line");
        }
        // Closing stdin lets servers that read to EOF exit too.
        self.stdin = None;

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                info!(instance = %self.id, status = %status, "server process exited");
                Ok(StopOutcome {
                    exit_code: status.code(),
                    forced: false,
                })
            }
            Err(_) => {
                warn!(
                    instance = %self.id,
                    grace_secs = grace.as_secs(),
                    "server did not exit within grace period, killing"
                );
                self.child.kill().await?;
                let status = self.child.wait().await?;
                Ok(StopOutcome {
                    exit_code: status.code(),
                    forced: true,
                })
            }
        }
    }
}

fn spawn_line_reader<R>(id: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => info!(instance = %id, stream, "{}", line),
                Ok(None) => break,
                Err(e) => {
                    debug!(instance = %id, stream, error = %e, "output reader stopped");
                    break;
                }
            }
        }
    });
}

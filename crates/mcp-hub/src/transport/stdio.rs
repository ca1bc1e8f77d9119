//! Child-process stdio transport.
//!
//! Framing: one newline-terminated JSON document per message, UTF-8, both
//! directions. The wire carries no request-id demultiplexing, so a connection
//! permits exactly one in-flight request: [`StdioConnection::request`] holds
//! the pipe lock for the whole round-trip and concurrent callers queue behind
//! it. Calls to different servers use different pipes and do not contend.

use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::error::HubError;
use crate::protocol::{JsonRpcRequest, RpcReply, parse_reply};

const STDERR_TAIL_LIMIT: usize = 4096;

struct Pipes {
    /// `None` once `shutdown` has closed it to request a graceful exit.
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

/// A live stdio backend process and its pipes.
pub struct StdioConnection {
    server: String,
    pipes: Mutex<Pipes>,
    child: Mutex<Child>,
    stderr: Mutex<Option<ChildStderr>>,
}

impl std::fmt::Debug for StdioConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioConnection")
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

impl StdioConnection {
    /// Spawn the backend with the parent environment merged with
    /// server-specific overrides. All three standard streams are piped;
    /// the child is killed if the connection is dropped without a stop.
    pub fn spawn(
        server: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self, HubError> {
        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| {
            HubError::Protocol(format!("{server}: child spawned without stdin pipe"))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            HubError::Protocol(format!("{server}: child spawned without stdout pipe"))
        })?;
        let stderr = child.stderr.take();

        tracing::debug!("spawned stdio server {} (command={})", server, command);
        Ok(Self {
            server: server.to_string(),
            pipes: Mutex::new(Pipes {
                stdin: Some(stdin),
                stdout: BufReader::new(stdout),
            }),
            child: Mutex::new(child),
            stderr: Mutex::new(stderr),
        })
    }

    /// Non-blocking liveness probe. `Some(status)` once the child exited.
    pub async fn exit_status(&self) -> Option<ExitStatus> {
        match self.child.lock().await.try_wait() {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!("{}: try_wait failed: {}", self.server, e);
                None
            }
        }
    }

    /// One request/response round-trip, bounded by `timeout`.
    ///
    /// Fails fast with `ProcessTerminated` when the child is already gone
    /// instead of attempting I/O on dead pipes.
    pub async fn request(
        &self,
        req: &JsonRpcRequest,
        timeout: Duration,
    ) -> Result<RpcReply, HubError> {
        if let Some(status) = self.exit_status().await {
            return Err(HubError::ProcessTerminated(format!(
                "{} exited with {status}",
                self.server
            )));
        }

        // Serialization point: the lock spans write and read so replies
        // cannot interleave across callers.
        let mut pipes = self.pipes.lock().await;
        let stdin = pipes.stdin.as_mut().ok_or_else(|| {
            HubError::ProcessTerminated(format!("{}: stdin already closed", self.server))
        })?;
        stdin.write_all(req.to_line().as_bytes()).await?;
        stdin.flush().await?;

        let mut line = String::new();
        match tokio::time::timeout(timeout, pipes.stdout.read_line(&mut line)).await {
            Err(_) => Err(HubError::Timeout(timeout)),
            Ok(Err(e)) => Err(HubError::Io(e)),
            Ok(Ok(0)) => Err(HubError::ProcessTerminated(format!(
                "{}: stdout closed before a reply",
                self.server
            ))),
            Ok(Ok(_)) => parse_reply(&line),
        }
    }

    /// Fire-and-forget notification; no reply is read.
    pub async fn notify(&self, req: &JsonRpcRequest) -> Result<(), HubError> {
        let mut pipes = self.pipes.lock().await;
        let stdin = pipes.stdin.as_mut().ok_or_else(|| {
            HubError::ProcessTerminated(format!("{}: stdin already closed", self.server))
        })?;
        stdin.write_all(req.to_line().as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Drain whatever the child wrote to stderr, for startup diagnostics.
    /// Bounded read; returns an empty string when nothing is available.
    pub async fn read_stderr_tail(&self) -> String {
        let Some(mut stderr) = self.stderr.lock().await.take() else {
            return String::new();
        };
        let mut buf = Vec::new();
        let _ = tokio::time::timeout(Duration::from_millis(500), stderr.read_to_end(&mut buf))
            .await;
        buf.truncate(STDERR_TAIL_LIMIT);
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Graceful stop: close stdin (the MCP convention for "please exit"),
    /// wait up to `grace`, then escalate to a kill.
    pub async fn shutdown(&self, grace: Duration) {
        self.pipes.lock().await.stdin.take();
        let mut child = self.child.lock().await;
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!("{} exited with {}", self.server, status);
            }
            Ok(Err(e)) => {
                tracing::warn!("{}: wait failed: {}", self.server, e);
            }
            Err(_) => {
                tracing::warn!(
                    "{} did not exit within {:?}; killing",
                    self.server,
                    grace
                );
                if let Err(e) = child.kill().await {
                    tracing::warn!("{}: kill failed: {}", self.server, e);
                }
            }
        }
    }
}

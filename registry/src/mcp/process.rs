//! Launching and terminating MCP server processes
//!
//! A stdio server is spawned with piped stdin/stdout and the MCP handshake is
//! completed before the launch counts as successful. An sse server is spawned
//! and must survive a short startup probe; its protocol traffic goes over HTTP.

use std::collections::{BTreeMap, VecDeque};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rmcp::{service::RunningService, RoleClient, ServiceExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use url::Url;

use super::discovery::ToolEndpoint;
use crate::db::{ConnectionType, ServerRecord};

/// Number of output lines kept for failure reports
const OUTPUT_TAIL_LINES: usize = 20;

/// How long to wait for output forwarders to drain after an early exit
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Timeouts applied while launching and stopping processes
#[derive(Debug, Clone, Copy)]
pub struct LaunchTimeouts {
    pub startup_timeout: Duration,
    pub startup_probe: Duration,
    pub stop_grace: Duration,
}

/// Everything needed to launch a server, parsed and validated
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub id: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub connection_type: ConnectionType,
    pub url: Option<Url>,
}

impl LaunchSpec {
    /// Parse launch settings, rejecting anything that could never start
    pub fn parse(
        id: &str,
        command: &str,
        args: &str,
        connection_type: ConnectionType,
        url: Option<&str>,
        env: &BTreeMap<String, String>,
    ) -> Result<Self, String> {
        let command = command.trim();
        if command.is_empty() {
            return Err("command must not be empty".to_string());
        }

        let args = shlex::split(args)
            .ok_or_else(|| format!("args contain unbalanced quotes: {}", args))?;

        let url = match connection_type {
            ConnectionType::Stdio => None,
            ConnectionType::Sse => {
                let raw = url
                    .map(str::trim)
                    .filter(|u| !u.is_empty())
                    .ok_or_else(|| "sse servers require a url".to_string())?;
                let parsed =
                    Url::parse(raw).map_err(|e| format!("invalid url '{}': {}", raw, e))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(format!("url must use http or https: {}", raw));
                }
                Some(parsed)
            }
        };

        let env = env
            .iter()
            .map(|(key, value)| {
                let expanded = shellexpand::env(value).unwrap_or_else(|_| value.clone().into());
                (key.clone(), expanded.into_owned())
            })
            .collect();

        Ok(Self {
            id: id.to_string(),
            command: command.to_string(),
            args,
            env,
            connection_type,
            url,
        })
    }

    pub fn from_record(record: &ServerRecord) -> Result<Self, String> {
        Self::parse(
            &record.id,
            &record.command,
            &record.args,
            record.connection_type,
            record.url.as_deref(),
            &record.env,
        )
    }
}

/// Last lines written by a process, for failure reports
#[derive(Clone, Default)]
struct OutputTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl OutputTail {
    fn push(&self, line: String) {
        if let Ok(mut lines) = self.lines.lock() {
            if lines.len() == OUTPUT_TAIL_LINES {
                lines.pop_front();
            }
            lines.push_back(line);
        }
    }

    fn render(&self) -> String {
        match self.lines.lock() {
            Ok(lines) if !lines.is_empty() => {
                let joined: Vec<&str> = lines.iter().map(String::as_str).collect();
                format!("; output: {}", joined.join(" | "))
            }
            _ => String::new(),
        }
    }
}

/// Forward a process stream to the log line by line
fn forward_output<R>(id: String, stream: &'static str, reader: R, tail: OutputTail) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    tracing::debug!(server = %id, stream, "{}", line);
                    tail.push(line);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(server = %id, stream, "Output stream closed: {}", e);
                    break;
                }
            }
        }
    })
}

fn describe_spawn_error(command: &str, err: &std::io::Error) -> String {
    match err.kind() {
        std::io::ErrorKind::NotFound => format!("command not found: {}", command),
        std::io::ErrorKind::PermissionDenied => format!("permission denied: {}", command),
        _ => format!("failed to spawn '{}': {}", command, err),
    }
}

/// A live, supervised server process
pub struct ManagedProcess {
    id: String,
    child: Child,
    /// MCP session for stdio servers, established at launch
    session: Option<RunningService<RoleClient, ()>>,
    url: Option<Url>,
    output: OutputTail,
    forwarders: Vec<JoinHandle<()>>,
}

impl ManagedProcess {
    /// Spawn the process described by `spec`
    ///
    /// On failure the child is killed and a human-readable reason returned.
    pub async fn launch(spec: &LaunchSpec, timeouts: &LaunchTimeouts) -> Result<Self, String> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.stdin(match spec.connection_type {
            ConnectionType::Stdio => Stdio::piped(),
            ConnectionType::Sse => Stdio::null(),
        });
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| describe_spawn_error(&spec.command, &e))?;

        tracing::debug!(server = %spec.id, pid = ?child.id(), "Spawned MCP server process");

        let output = OutputTail::default();
        let mut forwarders = Vec::new();
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(forward_output(
                spec.id.clone(),
                "stderr",
                stderr,
                output.clone(),
            ));
        }

        let mut process = match spec.connection_type {
            ConnectionType::Stdio => {
                let (stdout, stdin) = match (child.stdout.take(), child.stdin.take()) {
                    (Some(stdout), Some(stdin)) => (stdout, stdin),
                    _ => return Err("process stdio was not captured".to_string()),
                };

                let handshake =
                    tokio::time::timeout(timeouts.startup_timeout, ().serve((stdout, stdin)))
                        .await;

                let mut process = Self {
                    id: spec.id.clone(),
                    child,
                    session: None,
                    url: None,
                    output,
                    forwarders,
                };

                match handshake {
                    Ok(Ok(session)) => {
                        process.session = Some(session);
                        process
                    }
                    Ok(Err(e)) => {
                        let detail = process.abandon().await;
                        return Err(format!("MCP handshake failed: {}{}", e, detail));
                    }
                    Err(_) => {
                        let detail = process.abandon().await;
                        return Err(format!(
                            "MCP handshake timed out after {:?}{}",
                            timeouts.startup_timeout, detail
                        ));
                    }
                }
            }
            ConnectionType::Sse => {
                if let Some(stdout) = child.stdout.take() {
                    forwarders.push(forward_output(
                        spec.id.clone(),
                        "stdout",
                        stdout,
                        output.clone(),
                    ));
                }
                Self {
                    id: spec.id.clone(),
                    child,
                    session: None,
                    url: spec.url.clone(),
                    output,
                    forwarders,
                }
            }
        };

        if spec.connection_type == ConnectionType::Sse {
            match tokio::time::timeout(timeouts.startup_probe, process.child.wait()).await {
                Ok(Ok(status)) => {
                    process.drain_output().await;
                    return Err(format!(
                        "process exited immediately ({}){}",
                        status,
                        process.output.render()
                    ));
                }
                Ok(Err(e)) => return Err(format!("failed to wait for process: {}", e)),
                Err(_) => {}
            }
        }

        Ok(process)
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Non-blocking liveness check; `Some` once the process has exited
    pub fn exit_status(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Recent process output, formatted for error messages
    pub fn output_summary(&self) -> String {
        self.output.render()
    }

    /// Where discovery should send its requests
    pub fn endpoint(&self) -> Option<ToolEndpoint> {
        match (&self.session, &self.url) {
            (Some(session), _) => Some(ToolEndpoint::Stdio(session.peer().clone())),
            (None, Some(url)) => Some(ToolEndpoint::Sse(url.clone())),
            (None, None) => None,
        }
    }

    async fn drain_output(&mut self) {
        for forwarder in self.forwarders.drain(..) {
            let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, forwarder).await;
        }
    }

    /// Kill a process whose launch failed, returning any exit detail
    async fn abandon(mut self) -> String {
        let exited = matches!(self.child.try_wait(), Ok(Some(_)));
        if !exited {
            let _ = self.child.kill().await;
        }
        self.drain_output().await;
        match self.child.try_wait() {
            Ok(Some(status)) if exited => {
                format!(" (process exited: {}){}", status, self.output.render())
            }
            _ => self.output.render(),
        }
    }

    /// Stop the process: close the MCP session, SIGTERM, then SIGKILL after `grace`
    pub async fn terminate(mut self, grace: Duration) -> Result<Option<ExitStatus>, String> {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.cancel().await {
                tracing::debug!(server = %self.id, "Error closing MCP session: {}", e);
            }
        }

        if let Ok(Some(status)) = self.child.try_wait() {
            return Ok(Some(status));
        }

        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                // SAFETY: signals our own child, which has not been reaped yet
                let _ = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            }
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => return Ok(Some(status)),
            Ok(Err(e)) => {
                tracing::warn!(server = %self.id, "Failed waiting for process exit: {}", e);
            }
            Err(_) => {
                tracing::warn!(
                    server = %self.id,
                    "Process did not exit within {:?}, killing",
                    grace
                );
            }
        }

        self.child
            .kill()
            .await
            .map_err(|e| format!("failed to kill process: {}", e))?;

        self.child
            .try_wait()
            .map_err(|e| format!("failed to reap process: {}", e))
    }
}

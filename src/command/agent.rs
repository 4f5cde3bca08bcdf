//! Transport to the external coding agent.
//!
//! [`AgentInvoker`] starts a session for one prompt; an [`AgentSession`] yields
//! normalized [`AgentMessage`]s and grants tool permissions back. [`ClaudeCli`]
//! drives the Claude CLI over stream-json on stdin/stdout, with tool
//! permission checks routed through the same pipes.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::errors::AgentError;
use crate::stream::{
    ContentBlock, ControlRequest, StreamEvent, allow_tool_response, control_error_response, user_text_message,
};

/// Bytes of stderr kept for error reports.
const STDERR_CAPTURE_LIMIT: usize = 16 * 1024;

/// Final result reported by the agent for one session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentOutcome {
    pub is_error: bool,
    pub result: Option<String>,
    pub session_id: Option<String>,
    pub duration_ms: u64,
    pub cost_usd: f64,
    pub num_turns: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentMessage {
    Text(String),
    /// A tool call the agent made. Informational only.
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    /// The agent is blocked until this tool is allowed.
    ToolPermission {
        request_id: String,
        name: String,
        input: Value,
    },
    Result(AgentOutcome),
}

#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn start(&self, prompt: &str) -> Result<Box<dyn AgentSession>, AgentError>;
}

#[async_trait]
pub trait AgentSession: Send {
    /// Next message; `None` once the stream has ended.
    async fn next_message(&mut self) -> Result<Option<AgentMessage>, AgentError>;

    /// Let the tool behind `request_id` run with `input`.
    async fn allow_tool(&mut self, request_id: &str, input: Value) -> Result<(), AgentError>;

    /// Stop the agent. Safe to call more than once.
    async fn cancel(&mut self);
}

/// Spawns the Claude CLI in stream-json mode.
#[derive(Debug, Clone)]
pub struct ClaudeCli {
    cmd: String,
    flags: Vec<String>,
    project_dir: PathBuf,
}

impl ClaudeCli {
    pub fn new(cmd: impl Into<String>, flags: Vec<String>, project_dir: PathBuf) -> Self {
        Self {
            cmd: cmd.into(),
            flags,
            project_dir,
        }
    }

    pub fn command_line(&self) -> String {
        format!("{} {}", self.cmd, self.flags.join(" "))
    }
}

#[async_trait]
impl AgentInvoker for ClaudeCli {
    async fn start(&self, prompt: &str) -> Result<Box<dyn AgentSession>, AgentError> {
        debug!(component = "agent", cmd = %self.command_line(), "spawning agent");
        let mut child = Command::new(&self.cmd)
            .args(&self.flags)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&self.project_dir)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| AgentError::SpawnFailed {
                cmd: self.cmd.clone(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or(AgentError::Closed)?;
        let stdin = child.stdin.take().ok_or(AgentError::Closed)?;

        let stderr_buf = Arc::new(Mutex::new(String::new()));
        if let Some(mut stderr) = child.stderr.take() {
            let buf = Arc::clone(&stderr_buf);
            tokio::spawn(async move {
                let mut chunk = vec![0u8; 4096];
                while let Ok(n) = stderr.read(&mut chunk).await {
                    if n == 0 {
                        break;
                    }
                    let mut buf = buf.lock().unwrap_or_else(|e| e.into_inner());
                    if buf.len() < STDERR_CAPTURE_LIMIT {
                        buf.push_str(&String::from_utf8_lossy(&chunk[..n]));
                    }
                }
            });
        }

        let mut session = ClaudeSession {
            child,
            stdin: Some(stdin),
            lines: BufReader::new(stdout).lines(),
            pending: VecDeque::new(),
            stderr: stderr_buf,
            result_seen: false,
            finished: false,
        };
        session.send(&user_text_message(prompt)).await?;
        Ok(Box::new(session))
    }
}

struct ClaudeSession {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Lines<BufReader<ChildStdout>>,
    pending: VecDeque<AgentMessage>,
    stderr: Arc<Mutex<String>>,
    result_seen: bool,
    finished: bool,
}

impl ClaudeSession {
    async fn send(&mut self, message: &Value) -> Result<(), AgentError> {
        let stdin = self.stdin.as_mut().ok_or(AgentError::Closed)?;
        let mut line = message.to_string();
        line.push('\n');
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    fn stderr_text(&self) -> String {
        self.stderr
            .lock()
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    }

    async fn queue_event(&mut self, event: StreamEvent) -> Result<(), AgentError> {
        match event {
            StreamEvent::Assistant { message, .. } => {
                for block in message.content {
                    match block {
                        ContentBlock::Text { text } => self.pending.push_back(AgentMessage::Text(text)),
                        ContentBlock::ToolUse { name, input, id } => {
                            self.pending.push_back(AgentMessage::ToolUse { id, name, input })
                        }
                        ContentBlock::Other => {}
                    }
                }
            }
            StreamEvent::Result {
                result,
                is_error,
                session_id,
                duration_ms,
                total_cost_usd,
                num_turns,
                ..
            } => {
                self.result_seen = true;
                // The CLI keeps reading stdin in stream-json mode until it closes.
                self.stdin = None;
                self.pending.push_back(AgentMessage::Result(AgentOutcome {
                    is_error,
                    result,
                    session_id: (!session_id.is_empty()).then_some(session_id),
                    duration_ms,
                    cost_usd: total_cost_usd,
                    num_turns,
                }));
            }
            StreamEvent::System { subtype, .. } => {
                debug!(component = "agent", subtype = %subtype, "system event");
            }
            StreamEvent::ControlRequest { request_id, request } => match request {
                ControlRequest::CanUseTool { tool_name, input } => {
                    self.pending.push_back(AgentMessage::ToolPermission {
                        request_id,
                        name: tool_name,
                        input,
                    });
                }
                ControlRequest::Other => {
                    debug!(component = "agent", request_id = %request_id, "unsupported control request");
                    self.send(&control_error_response(&request_id, "unsupported control request"))
                        .await?;
                }
            },
            StreamEvent::User {} | StreamEvent::Unknown => {}
        }
        Ok(())
    }
}

#[async_trait]
impl AgentSession for ClaudeSession {
    async fn next_message(&mut self) -> Result<Option<AgentMessage>, AgentError> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Ok(Some(message));
            }
            if self.finished {
                return Ok(None);
            }

            match self.lines.next_line().await? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => match serde_json::from_str::<StreamEvent>(&line) {
                    Ok(event) => self.queue_event(event).await?,
                    Err(_) => debug!(component = "agent", line = %line, "non-json output"),
                },
                None => {
                    self.finished = true;
                    self.stdin = None;
                    let status = self.child.wait().await?;
                    if !self.result_seen {
                        let stderr = self.stderr_text();
                        let message = if stderr.is_empty() {
                            format!("agent exited ({}) without reporting a result", status)
                        } else {
                            stderr
                        };
                        self.pending.push_back(AgentMessage::Result(AgentOutcome {
                            is_error: true,
                            result: Some(message),
                            ..AgentOutcome::default()
                        }));
                    }
                }
            }
        }
    }

    async fn allow_tool(&mut self, request_id: &str, input: Value) -> Result<(), AgentError> {
        self.send(&allow_tool_response(request_id, &input)).await
    }

    async fn cancel(&mut self) {
        self.stdin = None;
        self.finished = true;
        if let Err(e) = self.child.start_kill() {
            debug!(component = "agent", error = %e, "agent already exited");
        }
        if tokio::time::timeout(Duration::from_secs(5), self.child.wait())
            .await
            .is_err()
        {
            warn!(component = "agent", "agent did not exit after kill");
        }
    }
}

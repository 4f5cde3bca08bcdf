//! Single agent command execution.
//!
//! `CommandRunner::run_command` starts one agent session, enforces the step
//! timeout, routes interceptable questions to a human and always settles to a
//! [`CommandResult`]. Failures are values here; the retry policy decides what
//! they mean.

pub mod agent;
pub mod intercept;

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::broker::{AskError, HumanChannel};
use crate::state::{QuestionKind, Step, truncate_chars};
use crate::stream::describe_tool_use;
pub use agent::{AgentInvoker, AgentMessage, AgentOutcome, AgentSession, ClaudeCli};

/// Default per-step timeout.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(600);

/// Characters of agent text kept for error reports.
const TRANSCRIPT_LIMIT: usize = 8_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The agent reported an error or its stream broke.
    Agent,
    Timeout,
    /// The agent could not be started.
    Spawn,
    /// Shutdown was requested while the command was in flight.
    Shutdown,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandResult {
    pub success: bool,
    pub result: Option<String>,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
    /// Set when a human chose to skip the step.
    pub skipped: bool,
    /// Agent text seen before the failure, for error records.
    pub output: Option<String>,
    pub session_id: Option<String>,
    pub duration_ms: u64,
    pub cost_usd: f64,
    pub num_turns: u32,
}

impl CommandResult {
    pub fn succeeded(outcome: AgentOutcome, elapsed: Duration) -> Self {
        let duration_ms = duration_ms(&outcome, elapsed);
        Self {
            success: true,
            result: outcome.result,
            session_id: outcome.session_id,
            duration_ms,
            cost_usd: outcome.cost_usd,
            num_turns: outcome.num_turns,
            ..Self::default()
        }
    }

    pub fn failed(kind: FailureKind, error: impl Into<String>, output: String, elapsed: Duration) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            failure: Some(kind),
            output: (!output.is_empty()).then_some(output),
            duration_ms: elapsed.as_millis() as u64,
            ..Self::default()
        }
    }

    /// Placeholder for a step a human decided to skip.
    pub fn skipped() -> Self {
        Self {
            success: true,
            skipped: true,
            ..Self::default()
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.failure == Some(FailureKind::Shutdown)
    }

    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "agent command failed".to_string())
    }
}

fn duration_ms(outcome: &AgentOutcome, elapsed: Duration) -> u64 {
    if outcome.duration_ms > 0 {
        outcome.duration_ms
    } else {
        elapsed.as_millis() as u64
    }
}

/// Phase/step attribution and timeout for one command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandOptions {
    pub phase: f64,
    pub step: Step,
    pub timeout: Option<Duration>,
}

pub struct CommandRunner {
    invoker: Arc<dyn AgentInvoker>,
    human: Arc<HumanChannel>,
    default_timeout: Duration,
}

impl CommandRunner {
    pub fn new(invoker: Arc<dyn AgentInvoker>, human: Arc<HumanChannel>, default_timeout: Duration) -> Self {
        Self {
            invoker,
            human,
            default_timeout,
        }
    }

    /// Run one agent command to completion. Never returns an error; every
    /// failure becomes an unsuccessful [`CommandResult`].
    ///
    /// Time spent waiting for a human answer does not count against the timeout.
    pub async fn run_command(&self, prompt: &str, opts: CommandOptions) -> CommandResult {
        let started = Instant::now();
        let timeout = opts.timeout.unwrap_or(self.default_timeout);
        let mut deadline = tokio::time::Instant::now() + timeout;

        info!(component = "command", phase = opts.phase, step = %opts.step, "invoking agent");
        let mut session = match self.invoker.start(prompt).await {
            Ok(session) => session,
            Err(e) => {
                warn!(component = "command", error = %e, "agent failed to start");
                return CommandResult::failed(FailureKind::Spawn, e.to_string(), String::new(), started.elapsed());
            }
        };

        let mut transcript = String::new();
        loop {
            let message = match tokio::time::timeout_at(deadline, session.next_message()).await {
                Err(_) => {
                    warn!(component = "command", timeout_secs = timeout.as_secs(), "agent command timed out");
                    session.cancel().await;
                    return CommandResult::failed(
                        FailureKind::Timeout,
                        format!("Timed out after {}s", timeout.as_secs()),
                        transcript,
                        started.elapsed(),
                    );
                }
                Ok(Err(e)) => {
                    session.cancel().await;
                    return CommandResult::failed(FailureKind::Agent, e.to_string(), transcript, started.elapsed());
                }
                Ok(Ok(None)) => {
                    return CommandResult::failed(
                        FailureKind::Agent,
                        "Agent stream ended without a result",
                        transcript,
                        started.elapsed(),
                    );
                }
                Ok(Ok(Some(message))) => message,
            };

            match message {
                AgentMessage::Text(text) => {
                    if transcript.len() < TRANSCRIPT_LIMIT {
                        transcript.push_str(&text);
                        transcript.push('\n');
                    }
                }
                AgentMessage::ToolUse { name, input, .. } => {
                    debug!(component = "command", tool = %describe_tool_use(&name, &input), "tool use");
                }
                AgentMessage::ToolPermission { request_id, name, input } => {
                    let Some(questions) = intercept::human_input_request(&name, &input) else {
                        debug!(component = "command", tool = %name, "allowing tool");
                        if let Err(e) = session.allow_tool(&request_id, input).await {
                            session.cancel().await;
                            return CommandResult::failed(FailureKind::Agent, e.to_string(), transcript, started.elapsed());
                        }
                        continue;
                    };

                    let waiting = Instant::now();
                    let answers = match self.human.ask(questions, opts.phase, opts.step, QuestionKind::Agent).await {
                        Ok(answers) => answers,
                        Err(AskError::Shutdown) => {
                            session.cancel().await;
                            return CommandResult::failed(
                                FailureKind::Shutdown,
                                "Shutdown requested while waiting for a human answer",
                                transcript,
                                started.elapsed(),
                            );
                        }
                        Err(e) => {
                            session.cancel().await;
                            return CommandResult::failed(FailureKind::Agent, e.to_string(), transcript, started.elapsed());
                        }
                    };
                    deadline += waiting.elapsed();

                    let answered = intercept::answered_input(&input, &answers);
                    if let Err(e) = session.allow_tool(&request_id, answered).await {
                        session.cancel().await;
                        return CommandResult::failed(FailureKind::Agent, e.to_string(), transcript, started.elapsed());
                    }
                }
                AgentMessage::Result(outcome) => {
                    if outcome.is_error {
                        let error = outcome
                            .result
                            .as_deref()
                            .map(|r| truncate_chars(r, TRANSCRIPT_LIMIT))
                            .unwrap_or_else(|| "Agent reported an error".to_string());
                        return CommandResult::failed(FailureKind::Agent, error, transcript, started.elapsed());
                    }
                    return CommandResult::succeeded(outcome, started.elapsed());
                }
            }
        }
    }
}

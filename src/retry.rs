//! Retry-then-escalate policy for agent commands.
//!
//! Every step command gets one automatic retry. A second failure is recorded in
//! the error history, announced as `error:escalation` and handed to an
//! [`EscalationHandler`] for a Retry/Skip/Abort decision. Failures caused by a
//! shutdown request are never retried or escalated.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::broker::HumanChannel;
use crate::command::CommandResult;
use crate::errors::OrchestratorError;
use crate::events::{EventBus, LifecycleEvent};
use crate::shutdown::ShutdownFlag;
use crate::state::{ErrorRecord, QuestionItem, QuestionKind, QuestionOption, StateManager, Step};

/// Attempts made before escalating.
pub const ATTEMPTS_BEFORE_ESCALATION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationDecision {
    Retry,
    Skip,
    Abort,
}

impl EscalationDecision {
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "retry" => Some(EscalationDecision::Retry),
            "skip" => Some(EscalationDecision::Skip),
            "abort" => Some(EscalationDecision::Abort),
            _ => None,
        }
    }
}

/// A step that failed every automatic attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Escalation {
    pub phase: f64,
    pub step: Step,
    pub message: String,
    pub attempts: u32,
}

#[async_trait]
pub trait EscalationHandler: Send + Sync {
    async fn decide(&self, escalation: &Escalation) -> Result<EscalationDecision, OrchestratorError>;
}

/// Asks a human through the question broker.
pub struct BrokerEscalation {
    human: Arc<HumanChannel>,
}

impl BrokerEscalation {
    pub fn new(human: Arc<HumanChannel>) -> Self {
        Self { human }
    }

    fn question_text(escalation: &Escalation) -> String {
        format!(
            "Phase {} {} failed {} times: {}. How should autopilot proceed?",
            escalation.phase, escalation.step, escalation.attempts, escalation.message
        )
    }
}

#[async_trait]
impl EscalationHandler for BrokerEscalation {
    async fn decide(&self, escalation: &Escalation) -> Result<EscalationDecision, OrchestratorError> {
        let text = Self::question_text(escalation);
        let item = QuestionItem {
            question: text.clone(),
            header: Some("Escalation".into()),
            options: vec![
                QuestionOption {
                    label: "Retry".into(),
                    description: Some("Run the step once more".into()),
                },
                QuestionOption {
                    label: "Skip".into(),
                    description: Some("Mark the step done and continue".into()),
                },
                QuestionOption {
                    label: "Abort".into(),
                    description: Some("Stop the run".into()),
                },
            ],
            multi_select: false,
        };
        let answers = self
            .human
            .ask(vec![item], escalation.phase, escalation.step, QuestionKind::Escalation)
            .await?;
        let decision = answers
            .get(&text)
            .or_else(|| answers.values().next())
            .and_then(|label| EscalationDecision::from_label(label))
            .unwrap_or(EscalationDecision::Abort);
        Ok(decision)
    }
}

/// Wraps command invocations with retry and escalation.
pub struct RetryPolicy {
    state: Arc<StateManager>,
    events: EventBus,
    shutdown: ShutdownFlag,
}

impl RetryPolicy {
    pub fn new(state: Arc<StateManager>, events: EventBus, shutdown: ShutdownFlag) -> Self {
        Self {
            state,
            events,
            shutdown,
        }
    }

    fn check_shutdown(&self, result: &CommandResult) -> Result<(), OrchestratorError> {
        if result.is_shutdown() || self.shutdown.is_requested() {
            return Err(OrchestratorError::ShutdownInFlight);
        }
        Ok(())
    }

    fn record_failure(&self, phase: f64, step: Step, result: &CommandResult) -> Result<String, OrchestratorError> {
        let message = result.error_message();
        let record = ErrorRecord::new(phase, step, &message, result.output.as_deref());
        self.state.update(|s| s.push_error(record))?;
        Ok(message)
    }

    /// Run `invoke` with one automatic retry, then escalate.
    ///
    /// Returns the successful result (or [`CommandResult::skipped`] when the
    /// handler chose Skip). Abort, a failed post-escalation retry or a missing
    /// handler end in [`OrchestratorError::Aborted`].
    pub async fn execute_with_retry<F, Fut>(
        &self,
        phase: f64,
        step: Step,
        mut invoke: F,
        escalation: Option<&dyn EscalationHandler>,
    ) -> Result<CommandResult, OrchestratorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CommandResult>,
    {
        let first = invoke().await;
        if first.success {
            return Ok(first);
        }
        self.check_shutdown(&first)?;
        warn!(component = "retry", phase, step = %step, error = %first.error_message(), "step failed, retrying once");

        let second = invoke().await;
        if second.success {
            return Ok(second);
        }
        self.check_shutdown(&second)?;

        let message = self.record_failure(phase, step, &second)?;
        error!(component = "retry", phase, step = %step, error = %message, "step failed twice, escalating");
        self.events.emit(LifecycleEvent::ErrorEscalation {
            phase,
            step,
            message: message.clone(),
            attempts: ATTEMPTS_BEFORE_ESCALATION,
        });

        let Some(handler) = escalation else {
            return Err(OrchestratorError::Aborted {
                phase,
                step,
                reason: format!("failed {} times with no one to escalate to: {}", ATTEMPTS_BEFORE_ESCALATION, message),
            });
        };

        let decision = handler
            .decide(&Escalation {
                phase,
                step,
                message: message.clone(),
                attempts: ATTEMPTS_BEFORE_ESCALATION,
            })
            .await?;
        info!(component = "retry", phase, step = %step, decision = ?decision, "escalation decided");

        match decision {
            EscalationDecision::Retry => {
                let last = invoke().await;
                if last.success {
                    return Ok(last);
                }
                self.check_shutdown(&last)?;
                let message = self.record_failure(phase, step, &last)?;
                Err(OrchestratorError::Aborted {
                    phase,
                    step,
                    reason: format!("retry after escalation failed: {}", message),
                })
            }
            EscalationDecision::Skip => Ok(CommandResult::skipped()),
            EscalationDecision::Abort => Err(OrchestratorError::Aborted {
                phase,
                step,
                reason: "aborted by human decision".into(),
            }),
        }
    }
}

//! Human question routing.
//!
//! [`QuestionBroker`] pairs each pending question with a oneshot channel and
//! resolves it when an answer arrives from any consumer (console, web UI).
//! It never touches persisted state. [`HumanChannel`] is the orchestration-side
//! wrapper that records questions and answers in the run state around a wait.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::{OrchestratorError, StateError};
use crate::events::{EventBus, LifecycleEvent};
use crate::shutdown::ShutdownFlag;
use crate::state::{
    Answers, PendingQuestion, QuestionItem, QuestionKind, RunStatus, StateManager, Step,
};

/// Resolves once the matching question is answered.
#[derive(Debug)]
pub struct Waiter {
    id: String,
    rx: oneshot::Receiver<Answers>,
}

impl Waiter {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// `None` when the broker dropped the question without an answer.
    pub async fn wait(self) -> Option<Answers> {
        self.rx.await.ok()
    }
}

pub struct QuestionBroker {
    waiters: Mutex<HashMap<String, oneshot::Sender<Answers>>>,
    events: EventBus,
}

impl QuestionBroker {
    pub fn new(events: EventBus) -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Create a question with a fresh id and a waiter for its answer.
    pub fn register(
        &self,
        questions: Vec<QuestionItem>,
        phase: f64,
        step: Step,
        kind: QuestionKind,
    ) -> (PendingQuestion, Waiter) {
        let question = PendingQuestion {
            id: Uuid::new_v4().to_string(),
            phase,
            step,
            kind,
            questions,
            created_at: Utc::now(),
            answered_at: None,
            answers: None,
        };
        let waiter = self.link(&question.id);
        (question, waiter)
    }

    /// Re-link a question persisted by an earlier process.
    pub fn restore(&self, question: &PendingQuestion) -> Waiter {
        self.link(&question.id)
    }

    fn link(&self, id: &str) -> Waiter {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id.to_string(), tx);
        Waiter {
            id: id.to_string(),
            rx,
        }
    }

    /// Announce a question to consumers.
    pub fn publish(&self, question: &PendingQuestion) {
        self.events.emit(LifecycleEvent::QuestionPending {
            question: question.clone(),
        });
    }

    /// Deliver answers. Returns false for unknown or already-answered ids.
    pub fn answer(&self, id: &str, answers: Answers) -> bool {
        let Some(tx) = self.lock().remove(id) else {
            debug!(component = "broker", id, "answer for unknown or settled question ignored");
            return false;
        };
        if tx.send(answers.clone()).is_err() {
            debug!(component = "broker", id, "waiter went away before the answer arrived");
            return false;
        }
        self.events.emit(LifecycleEvent::QuestionAnswered {
            id: id.to_string(),
            answers,
        });
        true
    }

    pub fn is_waiting(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Drop a waiter without answering it.
    pub fn forget(&self, id: &str) {
        self.lock().remove(id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<Answers>>> {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Error)]
pub enum AskError {
    #[error("Shutdown requested while waiting for a human answer")]
    Shutdown,

    #[error("Question {0} was dropped without an answer")]
    Abandoned(String),

    #[error(transparent)]
    State(#[from] StateError),
}

impl From<AskError> for OrchestratorError {
    fn from(err: AskError) -> Self {
        match err {
            AskError::Shutdown => OrchestratorError::ShutdownInFlight,
            AskError::State(e) => OrchestratorError::State(e),
            other => OrchestratorError::Other(anyhow::Error::new(other)),
        }
    }
}

/// Orchestration-side question flow: persist, publish, wait, record.
pub struct HumanChannel {
    broker: Arc<QuestionBroker>,
    state: Arc<StateManager>,
    shutdown: ShutdownFlag,
}

impl HumanChannel {
    pub fn new(broker: Arc<QuestionBroker>, state: Arc<StateManager>, shutdown: ShutdownFlag) -> Self {
        Self {
            broker,
            state,
            shutdown,
        }
    }

    pub fn broker(&self) -> &Arc<QuestionBroker> {
        &self.broker
    }

    /// Ask a new question and wait for its answers.
    pub async fn ask(
        &self,
        questions: Vec<QuestionItem>,
        phase: f64,
        step: Step,
        kind: QuestionKind,
    ) -> Result<Answers, AskError> {
        let (question, waiter) = self.broker.register(questions, phase, step, kind);
        self.state.update(|s| {
            s.pending_questions.push(question.clone());
            s.status = RunStatus::WaitingForHuman;
        })?;
        info!(component = "broker", id = %question.id, phase, step = %step, "waiting for human answer");
        self.broker.publish(&question);
        self.wait(waiter).await
    }

    /// Wait again for a question left unanswered by an earlier process.
    pub async fn await_restored(&self, question: &PendingQuestion) -> Result<Answers, AskError> {
        let waiter = self.broker.restore(question);
        self.state.update(|s| s.status = RunStatus::WaitingForHuman)?;
        info!(component = "broker", id = %question.id, "waiting for answer to restored question");
        self.broker.publish(question);
        self.wait(waiter).await
    }

    async fn wait(&self, waiter: Waiter) -> Result<Answers, AskError> {
        let id = waiter.id().to_string();
        let answers = tokio::select! {
            answers = waiter.wait() => answers.ok_or_else(|| AskError::Abandoned(id.clone()))?,
            _ = self.shutdown.requested() => {
                self.broker.forget(&id);
                return Err(AskError::Shutdown);
            }
        };
        self.state.update(|s| {
            if let Some(q) = s.question_mut(&id) {
                q.answered_at = Some(Utc::now());
                q.answers = Some(answers.clone());
            }
            s.status = RunStatus::Running;
        })?;
        Ok(answers)
    }
}

//! Lifecycle events published by the orchestrator.
//!
//! Events are fanned out on a `tokio::sync::broadcast` channel. Consumers (the
//! console renderer, the console responder, a presentation server) subscribe
//! independently; publishing never blocks and never fails the orchestrated
//! operation.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::state::{Answers, PendingQuestion, Step};

/// Default number of buffered events per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum LifecycleEvent {
    #[serde(rename = "phase:started")]
    PhaseStarted { phase: f64, name: String },
    #[serde(rename = "phase:completed")]
    PhaseCompleted { phase: f64, name: String },
    #[serde(rename = "step:started")]
    StepStarted { phase: f64, step: Step },
    #[serde(rename = "step:completed")]
    StepCompleted {
        phase: f64,
        step: Step,
        #[serde(default)]
        skipped: bool,
    },
    #[serde(rename = "error:escalation")]
    ErrorEscalation {
        phase: f64,
        step: Step,
        message: String,
        attempts: u32,
    },
    #[serde(rename = "gap:escalated")]
    GapEscalated { phase: f64, iterations: u32 },
    #[serde(rename = "build:complete")]
    BuildComplete { phases: usize },
    #[serde(rename = "question:pending")]
    QuestionPending { question: PendingQuestion },
    #[serde(rename = "question:answered")]
    QuestionAnswered { id: String, answers: Answers },
}

impl LifecycleEvent {
    /// Wire name of the event, e.g. `phase:started`.
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::PhaseStarted { .. } => "phase:started",
            LifecycleEvent::PhaseCompleted { .. } => "phase:completed",
            LifecycleEvent::StepStarted { .. } => "step:started",
            LifecycleEvent::StepCompleted { .. } => "step:completed",
            LifecycleEvent::ErrorEscalation { .. } => "error:escalation",
            LifecycleEvent::GapEscalated { .. } => "gap:escalated",
            LifecycleEvent::BuildComplete { .. } => "build:complete",
            LifecycleEvent::QuestionPending { .. } => "question:pending",
            LifecycleEvent::QuestionAnswered { .. } => "question:answered",
        }
    }
}

/// Cloneable publisher for [`LifecycleEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: LifecycleEvent) {
        tracing::debug!(component = "events", event = event.name(), "emit");
        let _ = self.tx.send(event);
    }
}

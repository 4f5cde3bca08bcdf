//! Phase orchestration.
//!
//! The [`Orchestrator`] walks the roadmap's phases in numeric order and drives
//! each through discuss → plan → execute → verify, persisting progress around
//! every agent call so an interrupted run resumes at the step it was on.

mod engine;
pub mod resume;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::broker::{HumanChannel, QuestionBroker};
use crate::command::{AgentInvoker, CommandRunner, DEFAULT_STEP_TIMEOUT};
use crate::events::EventBus;
use crate::phase::{FilePlanReader, PlanReader};
use crate::planning;
use crate::retry::{BrokerEscalation, EscalationHandler, RetryPolicy};
use crate::shutdown::ShutdownFlag;
use crate::state::StateManager;

pub use resume::{ResumeSummary, reconcile};

/// Phase number used to attribute the project bootstrap invocation.
pub const BOOTSTRAP_PHASE: f64 = 0.0;

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub project_dir: PathBuf,
    pub skip_discuss: bool,
    pub skip_verify: bool,
    pub step_timeout: Duration,
}

impl RunSettings {
    pub fn new(project_dir: PathBuf) -> Self {
        Self {
            project_dir,
            skip_discuss: false,
            skip_verify: false,
            step_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }
}

/// How a run ended without a fatal error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunOutcome {
    /// Every phase is completed or skipped.
    Complete,
    /// The selected phases finished; others remain.
    Finished,
    /// Shutdown was requested; state is saved and the run can be resumed.
    Interrupted,
    /// Verification kept finding gaps; a human has to look at this phase.
    GapEscalated { phase: f64 },
}

pub struct Orchestrator {
    settings: RunSettings,
    plan: Box<dyn PlanReader>,
    state: Arc<StateManager>,
    events: EventBus,
    shutdown: ShutdownFlag,
    human: Arc<HumanChannel>,
    runner: CommandRunner,
    retry: RetryPolicy,
    escalation: Option<Arc<dyn EscalationHandler>>,
}

impl Orchestrator {
    pub fn new(
        settings: RunSettings,
        state: Arc<StateManager>,
        invoker: Arc<dyn AgentInvoker>,
        events: EventBus,
        shutdown: ShutdownFlag,
    ) -> Self {
        let broker = Arc::new(QuestionBroker::new(events.clone()));
        let human = Arc::new(HumanChannel::new(broker, Arc::clone(&state), shutdown.clone()));
        let runner = CommandRunner::new(invoker, Arc::clone(&human), settings.step_timeout);
        let retry = RetryPolicy::new(Arc::clone(&state), events.clone(), shutdown.clone());
        let escalation: Arc<dyn EscalationHandler> = Arc::new(BrokerEscalation::new(Arc::clone(&human)));
        let plan = Box::new(FilePlanReader::new(&planning::roadmap_path(&settings.project_dir)));

        Self {
            settings,
            plan,
            state,
            events,
            shutdown,
            human,
            runner,
            retry,
            escalation: Some(escalation),
        }
    }

    pub fn with_plan_reader(mut self, plan: Box<dyn PlanReader>) -> Self {
        self.plan = plan;
        self
    }

    /// Replace the escalation handler. `None` turns a second failure into an abort.
    pub fn with_escalation(mut self, handler: Option<Arc<dyn EscalationHandler>>) -> Self {
        self.escalation = handler;
        self
    }

    /// Ask the run to stop after the in-flight step. Idempotent.
    pub fn request_shutdown(&self) {
        self.shutdown.request();
    }

    /// Broker through which pending questions are answered.
    pub fn broker(&self) -> Arc<QuestionBroker> {
        Arc::clone(self.human.broker())
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn state(&self) -> &Arc<StateManager> {
        &self.state
    }
}

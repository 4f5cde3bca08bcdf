//! Persisted run state.
//!
//! `RunState` is the single durable record of progress for a project. It is
//! written atomically by a [`StateStore`] and mutated only through the
//! [`StateManager`] owned by the orchestration flow.

mod manager;
mod store;

pub use manager::StateManager;
pub use store::{FileStateStore, MemoryStateStore, StateStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Maximum number of error records kept in `error_history`.
pub const MAX_ERROR_HISTORY: usize = 50;

/// Maximum characters of agent output kept on an error record.
pub const MAX_ERROR_OUTPUT_CHARS: usize = 2_000;

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    WaitingForHuman,
    Error,
    Complete,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::WaitingForHuman => "waiting_for_human",
            RunStatus::Error => "error",
            RunStatus::Complete => "complete",
        };
        f.write_str(s)
    }
}

/// One of the four lifecycle steps of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Discuss,
    Plan,
    Execute,
    Verify,
}

impl Step {
    /// Steps in lifecycle order.
    pub const ALL: [Step; 4] = [Step::Discuss, Step::Plan, Step::Execute, Step::Verify];

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Discuss => "discuss",
            Step::Plan => "plan",
            Step::Execute => "execute",
            Step::Verify => "verify",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of the run within the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurrentStep {
    #[default]
    Idle,
    Discuss,
    Plan,
    Execute,
    Verify,
    Done,
}

impl From<Step> for CurrentStep {
    fn from(step: Step) -> Self {
        match step {
            Step::Discuss => CurrentStep::Discuss,
            Step::Plan => CurrentStep::Plan,
            Step::Execute => CurrentStep::Execute,
            Step::Verify => CurrentStep::Verify,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl PhaseStatus {
    /// Completed and skipped phases are bypassed by the phase loop.
    pub fn is_finished(&self) -> bool {
        matches!(self, PhaseStatus::Completed | PhaseStatus::Skipped)
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::InProgress => "in_progress",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Idle,
    InProgress,
    Done,
}

/// Per-step status of one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StepMap {
    #[serde(default)]
    pub discuss: StepStatus,
    #[serde(default)]
    pub plan: StepStatus,
    #[serde(default)]
    pub execute: StepStatus,
    #[serde(default)]
    pub verify: StepStatus,
}

impl StepMap {
    pub fn get(&self, step: Step) -> StepStatus {
        match step {
            Step::Discuss => self.discuss,
            Step::Plan => self.plan,
            Step::Execute => self.execute,
            Step::Verify => self.verify,
        }
    }

    pub fn set(&mut self, step: Step, status: StepStatus) {
        match step {
            Step::Discuss => self.discuss = status,
            Step::Plan => self.plan = status,
            Step::Execute => self.execute = status,
            Step::Verify => self.verify = status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseState {
    pub number: f64,
    pub name: String,
    #[serde(default)]
    pub status: PhaseStatus,
    #[serde(default)]
    pub steps: StepMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Commit ids produced by execute steps, oldest first.
    #[serde(default)]
    pub commits: Vec<String>,
    /// Number of gap remediation cycles already run.
    #[serde(default)]
    pub gap_iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<String>,
    #[serde(default)]
    pub inserted: bool,
}

impl PhaseState {
    pub fn new(number: f64, name: &str) -> Self {
        Self {
            number,
            name: name.to_string(),
            status: PhaseStatus::Pending,
            steps: StepMap::default(),
            started_at: None,
            completed_at: None,
            commits: Vec::new(),
            gap_iterations: 0,
            depends_on: None,
            inserted: false,
        }
    }

    /// Append commits, keeping order and skipping ids already recorded.
    pub fn record_commits<I: IntoIterator<Item = String>>(&mut self, commits: I) {
        for commit in commits {
            if !self.commits.contains(&commit) {
                self.commits.push(commit);
            }
        }
    }
}

/// One labelled choice offered to a human.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One prompt within a pending question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionItem {
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    pub options: Vec<QuestionOption>,
    #[serde(default)]
    pub multi_select: bool,
}

/// Answers keyed by question text.
pub type Answers = BTreeMap<String, String>;

/// Who raised a question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    /// Intercepted from the agent; the answer goes back to the agent.
    #[default]
    Agent,
    /// Raised by the retry policy after repeated failures.
    Escalation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingQuestion {
    pub id: String,
    pub phase: f64,
    pub step: Step,
    #[serde(default)]
    pub kind: QuestionKind,
    pub questions: Vec<QuestionItem>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answers: Option<Answers>,
}

impl PendingQuestion {
    pub fn is_answered(&self) -> bool {
        self.answered_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub phase: f64,
    pub step: Step,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncated_output: Option<String>,
}

impl ErrorRecord {
    pub fn new(phase: f64, step: Step, message: &str, output: Option<&str>) -> Self {
        Self {
            timestamp: Utc::now(),
            phase,
            step,
            message: truncate_chars(message, MAX_ERROR_OUTPUT_CHARS),
            truncated_output: output
                .filter(|o| !o.is_empty())
                .map(|o| truncate_chars(o, MAX_ERROR_OUTPUT_CHARS)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<f64>,
    #[serde(default)]
    pub current_step: CurrentStep,
    #[serde(default)]
    pub phases: Vec<PhaseState>,
    #[serde(default)]
    pub pending_questions: Vec<PendingQuestion>,
    #[serde(default)]
    pub error_history: Vec<ErrorRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub last_updated_at: DateTime<Utc>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            status: RunStatus::Idle,
            current_phase: None,
            current_step: CurrentStep::Idle,
            phases: Vec::new(),
            pending_questions: Vec::new(),
            error_history: Vec::new(),
            started_at: None,
            last_updated_at: Utc::now(),
        }
    }
}

impl RunState {
    pub fn phase(&self, number: f64) -> Option<&PhaseState> {
        self.phases.iter().find(|p| p.number == number)
    }

    pub fn phase_mut(&mut self, number: f64) -> Option<&mut PhaseState> {
        self.phases.iter_mut().find(|p| p.number == number)
    }

    /// Append an error record, dropping the oldest beyond [`MAX_ERROR_HISTORY`].
    pub fn push_error(&mut self, record: ErrorRecord) {
        self.error_history.push(record);
        if self.error_history.len() > MAX_ERROR_HISTORY {
            let excess = self.error_history.len() - MAX_ERROR_HISTORY;
            self.error_history.drain(..excess);
        }
    }

    pub fn question_mut(&mut self, id: &str) -> Option<&mut PendingQuestion> {
        self.pending_questions.iter_mut().find(|q| q.id == id)
    }

    pub fn unanswered_questions(&self) -> impl Iterator<Item = &PendingQuestion> {
        self.pending_questions.iter().filter(|q| !q.is_answered())
    }

    /// True when each of `numbers` names a known phase that is completed or
    /// skipped.
    pub fn phases_finished(&self, numbers: &[f64]) -> bool {
        !numbers.is_empty()
            && numbers
                .iter()
                .all(|n| self.phase(*n).is_some_and(|p| p.status.is_finished()))
    }
}

/// Truncate to at most `max_chars` characters, never splitting a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...[truncated]", &text[..idx]),
        None => text.to_string(),
    }
}

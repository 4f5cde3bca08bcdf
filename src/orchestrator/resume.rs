//! Reconciling persisted state with the roadmap, and summarizing where a run
//! would pick up.

use chrono::Utc;
use std::fmt;

use crate::phase::{RoadmapPhase, compare_numbers};
use crate::state::{
    ErrorRecord, PhaseState, PhaseStatus, QuestionKind, RunState, RunStatus, Step, StepStatus,
};

/// Merge the parsed roadmap into `state`.
///
/// Phases are matched by number. Known phases keep their progress and pick up
/// renamed titles and enrichment; new phases are added pending. A phase ticked
/// in the roadmap checklist counts as completed. Phases that disappeared from
/// the roadmap are kept as history.
pub fn reconcile(state: &mut RunState, parsed: &[RoadmapPhase]) {
    for declared in parsed {
        if state.phase(declared.number).is_none() {
            state.phases.push(PhaseState::new(declared.number, &declared.name));
        }
        let Some(phase) = state.phase_mut(declared.number) else {
            continue;
        };
        if !declared.name.is_empty() {
            phase.name = declared.name.clone();
        }
        phase.inserted = declared.inserted;
        phase.depends_on = declared.depends_on.clone();
        if declared.completed && !phase.status.is_finished() {
            phase.status = PhaseStatus::Completed;
            phase.completed_at.get_or_insert_with(Utc::now);
        }
    }
    state
        .phases
        .sort_by(|a, b| compare_numbers(a.number, b.number));
}

/// Close escalation questions left open by a crashed process. The step they
/// were raised for is re-run, so the question no longer applies.
pub fn expire_stale_escalations(state: &mut RunState) -> usize {
    let now = Utc::now();
    let mut expired = 0;
    for question in &mut state.pending_questions {
        if question.kind == QuestionKind::Escalation && !question.is_answered() {
            question.answered_at = Some(now);
            expired += 1;
        }
    }
    expired
}

/// First step of a phase that is not done yet.
pub fn next_step(phase: &PhaseState) -> Option<Step> {
    Step::ALL
        .into_iter()
        .find(|step| phase.steps.get(*step) != StepStatus::Done)
}

/// Human-oriented snapshot of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeSummary {
    pub status: RunStatus,
    pub total: usize,
    pub finished: usize,
    /// Next phase and step a run would work on.
    pub next: Option<(f64, String, Step)>,
    pub pending_questions: usize,
    pub recent_errors: Vec<ErrorRecord>,
}

impl ResumeSummary {
    pub const RECENT_ERRORS: usize = 3;

    pub fn from_state(state: &RunState) -> Self {
        let next = state
            .phases
            .iter()
            .filter(|p| !p.status.is_finished())
            .find_map(|p| next_step(p).map(|step| (p.number, p.name.clone(), step)));
        let skip = state.error_history.len().saturating_sub(Self::RECENT_ERRORS);
        Self {
            status: state.status,
            total: state.phases.len(),
            finished: state.phases.iter().filter(|p| p.status.is_finished()).count(),
            next,
            pending_questions: state.unanswered_questions().count(),
            recent_errors: state.error_history.iter().skip(skip).cloned().collect(),
        }
    }

    pub fn headline(&self) -> String {
        match &self.next {
            Some((number, name, step)) => format!(
                "{}/{} phases done; next: phase {} ({}) at {}",
                self.finished, self.total, number, name, step
            ),
            None if self.total == 0 => "no phases known yet".to_string(),
            None => format!("{}/{} phases done; nothing left to run", self.finished, self.total),
        }
    }
}

impl fmt::Display for ResumeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "status: {}", self.status)?;
        writeln!(f, "{}", self.headline())?;
        if self.pending_questions > 0 {
            writeln!(f, "{} question(s) waiting for an answer", self.pending_questions)?;
        }
        for err in &self.recent_errors {
            writeln!(f, "error: phase {} {}: {}", err.phase, err.step, err.message)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::parse_roadmap;
    use crate::state::PendingQuestion;

    #[test]
    fn test_reconcile_adds_new_and_keeps_progress() {
        let mut state = RunState::default();
        let mut existing = PhaseState::new(1.0, "Old name");
        existing.steps.set(Step::Discuss, StepStatus::Done);
        existing.status = PhaseStatus::InProgress;
        state.phases.push(existing);

        let parsed = parse_roadmap("## Phase 2: Storage\n## Phase 1: Setup\n### Phase 1.1: Patch (INSERTED)\n");
        reconcile(&mut state, &parsed);

        let numbers: Vec<f64> = state.phases.iter().map(|p| p.number).collect();
        assert_eq!(numbers, vec![1.0, 1.1, 2.0]);
        let first = state.phase(1.0).unwrap();
        assert_eq!(first.name, "Setup");
        assert_eq!(first.steps.discuss, StepStatus::Done);
        assert_eq!(first.status, PhaseStatus::InProgress);
        assert!(state.phase(1.1).unwrap().inserted);
    }

    #[test]
    fn test_checked_roadmap_entry_completes_phase() {
        let mut state = RunState::default();
        reconcile(&mut state, &parse_roadmap("- [x] **Phase 1: Setup**\n- [ ] **Phase 2: Core**\n"));
        assert_eq!(state.phase(1.0).unwrap().status, PhaseStatus::Completed);
        assert!(state.phase(1.0).unwrap().completed_at.is_some());
        assert_eq!(state.phase(2.0).unwrap().status, PhaseStatus::Pending);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let parsed = parse_roadmap("- [ ] **Phase 1: Setup**\n## Phase 1: Setup\n**Depends on:** nothing\n");
        let mut state = RunState::default();
        reconcile(&mut state, &parsed);
        let once = state.phases.clone();
        reconcile(&mut state, &parsed);
        assert_eq!(state.phases, once);
        assert_eq!(state.phases[0].depends_on.as_deref(), Some("nothing"));
    }

    #[test]
    fn test_stale_escalations_expire_but_agent_questions_stay() {
        let mut state = RunState::default();
        for (id, kind) in [("e", QuestionKind::Escalation), ("a", QuestionKind::Agent)] {
            state.pending_questions.push(PendingQuestion {
                id: id.into(),
                phase: 1.0,
                step: Step::Plan,
                kind,
                questions: vec![],
                created_at: Utc::now(),
                answered_at: None,
                answers: None,
            });
        }
        assert_eq!(expire_stale_escalations(&mut state), 1);
        assert!(state.pending_questions.iter().find(|q| q.id == "e").unwrap().is_answered());
        assert!(!state.pending_questions.iter().find(|q| q.id == "a").unwrap().is_answered());
    }

    #[test]
    fn test_summary_points_at_next_step() {
        let mut state = RunState::default();
        let mut done = PhaseState::new(1.0, "Setup");
        done.status = PhaseStatus::Completed;
        let mut current = PhaseState::new(2.0, "Core");
        current.steps.set(Step::Discuss, StepStatus::Done);
        current.steps.set(Step::Plan, StepStatus::InProgress);
        state.phases = vec![done, current];

        let summary = ResumeSummary::from_state(&state);
        assert_eq!(summary.finished, 1);
        assert_eq!(summary.next, Some((2.0, "Core".to_string(), Step::Plan)));
        assert!(summary.headline().contains("next: phase 2 (Core) at plan"));
    }

    #[test]
    fn test_summary_keeps_only_recent_errors() {
        let mut state = RunState::default();
        for i in 0..5 {
            state.push_error(ErrorRecord::new(1.0, Step::Execute, &format!("e{i}"), None));
        }
        let summary = ResumeSummary::from_state(&state);
        let messages: Vec<&str> = summary.recent_errors.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["e2", "e3", "e4"]);
        assert!(summary.to_string().contains("error: phase 1 execute: e4"));
    }
}

use anyhow::Context;
use chrono::Utc;
use std::path::Path;
use tracing::{debug, error, info, warn};

use super::{BOOTSTRAP_PHASE, Orchestrator, RunOutcome, resume};
use crate::command::{CommandOptions, CommandResult};
use crate::errors::{OrchestratorError, StateError};
use crate::events::LifecycleEvent;
use crate::gap::{self, GapVerdict, MAX_GAP_ITERATIONS};
use crate::phase::{self, PhaseFilter};
use crate::planning;
use crate::prompts;
use crate::state::{
    CurrentStep, PendingQuestion, PhaseStatus, QuestionKind, RunStatus, Step, StepStatus,
};
use crate::tracker;

enum PhaseOutcome {
    Completed,
    GapEscalated,
}

enum VerifyOutcome {
    Passed,
    Escalated,
}

/// Command text for a step. Plan and execute switch to their gap-closing
/// variants once a phase has entered remediation.
fn step_prompt(step: Step, number: f64, remediating: bool) -> String {
    match step {
        Step::Discuss => prompts::discuss(number),
        Step::Plan if remediating => prompts::plan_gaps(number),
        Step::Plan => prompts::plan(number),
        Step::Execute if remediating => prompts::execute_gaps(number),
        Step::Execute => prompts::execute(number),
        Step::Verify => prompts::verify(number),
    }
}

impl Orchestrator {
    /// Drive every unfinished phase (optionally filtered) to completion.
    ///
    /// When the roadmap is missing and `spec` is given, the project is
    /// bootstrapped from it first. A shutdown request ends the run with
    /// [`RunOutcome::Interrupted`] after the in-flight call settles; fatal
    /// errors are persisted as status `error` and returned.
    pub async fn run(&self, spec: Option<&Path>, filter: Option<&PhaseFilter>) -> Result<RunOutcome, OrchestratorError> {
        match self.drive(spec, filter).await {
            Err(OrchestratorError::ShutdownInFlight) => {
                info!(component = "orchestrator", "shutdown requested; progress saved, rerun to resume");
                self.settle(RunStatus::Idle)?;
                Ok(RunOutcome::Interrupted)
            }
            Err(e) => {
                error!(component = "orchestrator", error = %e, "run failed");
                if let Err(state_err) = self.settle(RunStatus::Error) {
                    warn!(component = "orchestrator", error = %state_err, "could not persist error status");
                }
                Err(e)
            }
            ok => ok,
        }
    }

    fn settle(&self, status: RunStatus) -> Result<(), StateError> {
        self.state.update(|s| s.status = status)
    }

    fn check_shutdown(&self) -> Result<(), OrchestratorError> {
        if self.shutdown.is_requested() {
            return Err(OrchestratorError::ShutdownInFlight);
        }
        Ok(())
    }

    async fn drive(&self, spec: Option<&Path>, filter: Option<&PhaseFilter>) -> Result<RunOutcome, OrchestratorError> {
        planning::write_autonomous_config(&self.settings.project_dir)?;
        let roadmap = self.load_roadmap(spec).await?;
        let parsed = phase::parse_roadmap(&roadmap);
        if parsed.is_empty() {
            return Err(OrchestratorError::NoPhases {
                path: self.plan.location(),
            });
        }

        let expired = self.state.update(|s| {
            resume::reconcile(s, &parsed);
            s.status = RunStatus::Running;
            s.started_at.get_or_insert_with(Utc::now);
            resume::expire_stale_escalations(s)
        })?;
        if expired > 0 {
            debug!(component = "orchestrator", expired, "expired escalation questions from an earlier run");
        }
        let summary = self.state.read(resume::ResumeSummary::from_state)?;
        info!(component = "orchestrator", "{}", summary.headline());

        let decisions = self.await_restored_questions().await?;

        // Phases dropped from the roadmap stay in state as history only.
        let declared: Vec<f64> = parsed.iter().map(|p| p.number).collect();
        let targets: Vec<f64> = self.state.read(|s| {
            s.phases
                .iter()
                .filter(|p| declared.contains(&p.number))
                .filter(|p| !p.status.is_finished())
                .filter(|p| filter.is_none_or(|f| f.matches(p.number)))
                .map(|p| p.number)
                .collect()
        })?;

        for number in targets {
            self.check_shutdown()?;
            if let PhaseOutcome::GapEscalated = self.run_phase(number, &decisions).await? {
                self.settle(RunStatus::Idle)?;
                return Ok(RunOutcome::GapEscalated { phase: number });
            }
        }

        let count = declared.len();
        let finished = self.state.read(|s| s.phases_finished(&declared))?;
        if finished {
            self.state.update(|s| {
                s.status = RunStatus::Complete;
                s.current_step = CurrentStep::Done;
            })?;
            info!(component = "orchestrator", phases = count, "all phases complete");
            self.events.emit(LifecycleEvent::BuildComplete { phases: count });
            Ok(RunOutcome::Complete)
        } else {
            self.settle(RunStatus::Idle)?;
            Ok(RunOutcome::Finished)
        }
    }

    async fn load_roadmap(&self, spec: Option<&Path>) -> Result<String, OrchestratorError> {
        if let Some(text) = self.plan.read_plan()? {
            return Ok(text);
        }
        let missing = || OrchestratorError::MissingRoadmap {
            path: self.plan.location(),
        };
        let Some(spec) = spec else {
            return Err(missing());
        };
        self.bootstrap(spec).await?;
        self.plan.read_plan()?.ok_or_else(missing)
    }

    /// One agent invocation that creates the project and its roadmap from a spec.
    async fn bootstrap(&self, spec: &Path) -> Result<(), OrchestratorError> {
        let text = std::fs::read_to_string(spec)
            .with_context(|| format!("Failed to read spec file: {}", spec.display()))?;
        info!(component = "orchestrator", spec = %spec.display(), "no roadmap yet, bootstrapping project");

        let prompt = prompts::new_project(&spec.display().to_string(), &text);
        let result = self
            .invoke(BOOTSTRAP_PHASE, Step::Plan, &prompt)
            .await?;
        if result.skipped {
            warn!(component = "orchestrator", "project bootstrap skipped by human decision");
        }
        Ok(())
    }

    /// Run a command through the retry policy.
    async fn invoke(&self, number: f64, step: Step, prompt: &str) -> Result<CommandResult, OrchestratorError> {
        let opts = CommandOptions {
            phase: number,
            step,
            timeout: None,
        };
        let runner = &self.runner;
        self.retry
            .execute_with_retry(
                number,
                step,
                move || runner.run_command(prompt, opts),
                self.escalation.as_deref(),
            )
            .await
    }

    /// Wait for answers to agent questions a previous process left open.
    /// The answers are handed to the re-run of the step that asked.
    async fn await_restored_questions(&self) -> Result<Vec<PendingQuestion>, OrchestratorError> {
        let open: Vec<PendingQuestion> = self
            .state
            .read(|s| s.unanswered_questions().cloned().collect())?;
        let mut answered = Vec::with_capacity(open.len());
        for mut question in open {
            self.check_shutdown()?;
            let answers = self.human.await_restored(&question).await?;
            question.answered_at = Some(Utc::now());
            question.answers = Some(answers);
            answered.push(question);
        }
        Ok(answered)
    }

    async fn run_phase(&self, number: f64, decisions: &[PendingQuestion]) -> Result<PhaseOutcome, OrchestratorError> {
        let (name, remediating) = self.state.update(|s| {
            s.current_phase = Some(number);
            match s.phase_mut(number) {
                Some(p) => {
                    p.status = PhaseStatus::InProgress;
                    p.started_at.get_or_insert_with(Utc::now);
                    (p.name.clone(), p.gap_iterations > 0)
                }
                None => (String::new(), false),
            }
        })?;
        info!(component = "orchestrator", phase = number, name = %name, "phase started");
        self.events.emit(LifecycleEvent::PhaseStarted {
            phase: number,
            name: name.clone(),
        });

        for step in Step::ALL {
            self.check_shutdown()?;
            let status = self
                .state
                .read(|s| s.phase(number).map(|p| p.steps.get(step)))?
                .unwrap_or_default();
            if status == StepStatus::Done {
                debug!(component = "orchestrator", phase = number, step = %step, "step already done");
                continue;
            }

            match step {
                Step::Discuss if self.settings.skip_discuss => self.skip_discussion(number)?,
                Step::Verify if self.settings.skip_verify => {
                    info!(component = "orchestrator", phase = number, "verification disabled, not verifying");
                }
                Step::Verify => {
                    if let VerifyOutcome::Escalated = self.verify_until_clean(number, decisions).await? {
                        return Ok(PhaseOutcome::GapEscalated);
                    }
                }
                _ => {
                    self.run_step(number, step, step_prompt(step, number, remediating), decisions)
                        .await?;
                }
            }
        }

        self.state.update(|s| {
            s.current_step = CurrentStep::Done;
            if let Some(p) = s.phase_mut(number) {
                p.status = PhaseStatus::Completed;
                p.completed_at = Some(Utc::now());
            }
        })?;
        info!(component = "orchestrator", phase = number, name = %name, "phase completed");
        self.events.emit(LifecycleEvent::PhaseCompleted { phase: number, name });
        Ok(PhaseOutcome::Completed)
    }

    /// Replace discussion with a context document leaving decisions to the agent.
    fn skip_discussion(&self, number: f64) -> Result<(), OrchestratorError> {
        let Some(phase) = self.state.read(|s| s.phase(number).cloned())? else {
            return Ok(());
        };
        let path = planning::write_discretion_context(&self.settings.project_dir, &phase)?;
        info!(component = "orchestrator", phase = number, path = %path.display(), "discussion skipped");
        self.state.update(|s| {
            if let Some(p) = s.phase_mut(number) {
                p.steps.set(Step::Discuss, StepStatus::Done);
            }
        })?;
        self.events.emit(LifecycleEvent::StepCompleted {
            phase: number,
            step: Step::Discuss,
            skipped: true,
        });
        Ok(())
    }

    /// Persist "in progress", invoke, persist "done". A crash between the two
    /// writes leaves the step in progress and it is re-run on resume.
    async fn run_step(
        &self,
        number: f64,
        step: Step,
        prompt: String,
        decisions: &[PendingQuestion],
    ) -> Result<CommandResult, OrchestratorError> {
        let prompt = prompts::with_decisions(
            prompt,
            decisions
                .iter()
                .filter(|q| q.phase == number && q.step == step && q.kind == QuestionKind::Agent),
        );

        self.state.update(|s| {
            s.current_phase = Some(number);
            s.current_step = step.into();
            if let Some(p) = s.phase_mut(number) {
                p.steps.set(step, StepStatus::InProgress);
            }
        })?;
        info!(component = "orchestrator", phase = number, step = %step, "step started");
        self.events.emit(LifecycleEvent::StepStarted { phase: number, step });

        let base = if step == Step::Execute {
            tracker::head_commit(&self.settings.project_dir)
        } else {
            None
        };

        let result = self.invoke(number, step, &prompt).await?;

        let commits = if step == Step::Execute {
            tracker::commits_since(&self.settings.project_dir, base.as_deref())
        } else {
            Vec::new()
        };
        self.state.update(|s| {
            if let Some(p) = s.phase_mut(number) {
                p.steps.set(step, StepStatus::Done);
                p.record_commits(commits);
            }
        })?;
        info!(component = "orchestrator", phase = number, step = %step, skipped = result.skipped, "step completed");
        self.events.emit(LifecycleEvent::StepCompleted {
            phase: number,
            step,
            skipped: result.skipped,
        });
        Ok(result)
    }

    /// Verify, and while gaps remain, plan and execute against them and verify
    /// again. At most [`MAX_GAP_ITERATIONS`] verifications run before the gaps
    /// are escalated.
    async fn verify_until_clean(&self, number: f64, decisions: &[PendingQuestion]) -> Result<VerifyOutcome, OrchestratorError> {
        loop {
            let result = self
                .run_step(number, Step::Verify, prompts::verify(number), decisions)
                .await?;
            if result.skipped {
                info!(component = "orchestrator", phase = number, "verification skipped by human decision");
                return Ok(VerifyOutcome::Passed);
            }

            let reason = match gap::assess_phase(&self.settings.project_dir, number) {
                GapVerdict::GapsFound { reason } => reason,
                GapVerdict::Passed | GapVerdict::NoArtifact => return Ok(VerifyOutcome::Passed),
            };

            let cycles = self
                .state
                .read(|s| s.phase(number).map(|p| p.gap_iterations))?
                .unwrap_or(0);
            let verifications = cycles + 1;
            if verifications >= MAX_GAP_ITERATIONS {
                warn!(
                    component = "orchestrator",
                    phase = number,
                    iterations = verifications,
                    reason = %reason,
                    "gaps remain after repeated remediation, escalating"
                );
                // Re-verify on the next run instead of trusting this verdict.
                self.state.update(|s| {
                    if let Some(p) = s.phase_mut(number) {
                        p.steps.set(Step::Verify, StepStatus::Idle);
                    }
                })?;
                self.events.emit(LifecycleEvent::GapEscalated {
                    phase: number,
                    iterations: verifications,
                });
                return Ok(VerifyOutcome::Escalated);
            }

            info!(component = "orchestrator", phase = number, iteration = verifications, reason = %reason, "gaps found, remediating");
            self.state.update(|s| {
                if let Some(p) = s.phase_mut(number) {
                    p.gap_iterations += 1;
                    for step in [Step::Plan, Step::Execute, Step::Verify] {
                        p.steps.set(step, StepStatus::Idle);
                    }
                }
            })?;

            self.check_shutdown()?;
            self.run_step(number, Step::Plan, prompts::plan_gaps(number), decisions)
                .await?;
            self.check_shutdown()?;
            self.run_step(number, Step::Execute, prompts::execute_gaps(number), decisions)
                .await?;
            self.check_shutdown()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::agent::test_support::{Script, ScriptedInvoker};
    use crate::events::EventBus;
    use crate::orchestrator::RunSettings;
    use crate::phase::PlanReader;
    use crate::retry::{Escalation, EscalationDecision, EscalationHandler};
    use crate::shutdown::ShutdownFlag;
    use crate::state::{Answers, MemoryStateStore, PhaseState, RunState, StateManager};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};
    use tokio::sync::broadcast;

    const ROADMAP: &str = "# Roadmap\n\n- [ ] **Phase 1: Setup**\n- [ ] **Phase 2: Core**\n";

    struct Decide(EscalationDecision);

    #[async_trait]
    impl EscalationHandler for Decide {
        async fn decide(&self, _: &Escalation) -> Result<EscalationDecision, OrchestratorError> {
            Ok(self.0)
        }
    }

    /// Roadmap held in memory instead of on disk.
    struct StaticPlan(&'static str);

    impl PlanReader for StaticPlan {
        fn read_plan(&self) -> anyhow::Result<Option<String>> {
            Ok(Some(self.0.to_string()))
        }

        fn location(&self) -> PathBuf {
            PathBuf::from("memory://roadmap")
        }
    }

    struct Fixture {
        dir: TempDir,
        invoker: Arc<ScriptedInvoker>,
        state: Arc<StateManager>,
        events: EventBus,
        shutdown: ShutdownFlag,
    }

    impl Fixture {
        fn new(roadmap: Option<&str>, invoker: ScriptedInvoker) -> Self {
            Self::with_state(roadmap, invoker, RunState::default())
        }

        fn with_state(roadmap: Option<&str>, invoker: ScriptedInvoker, state: RunState) -> Self {
            Self::in_dir(tempdir().unwrap(), roadmap, invoker, state)
        }

        fn in_dir(dir: TempDir, roadmap: Option<&str>, invoker: ScriptedInvoker, state: RunState) -> Self {
            if let Some(text) = roadmap {
                let path = planning::roadmap_path(dir.path());
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(path, text).unwrap();
            }
            Self {
                dir,
                invoker: Arc::new(invoker),
                state: Arc::new(StateManager::open(Arc::new(MemoryStateStore::with_state(state))).unwrap()),
                events: EventBus::default(),
                shutdown: ShutdownFlag::new(),
            }
        }

        fn project(&self) -> PathBuf {
            self.dir.path().to_path_buf()
        }

        fn orchestrator(&self, tweak: impl FnOnce(&mut RunSettings)) -> Orchestrator {
            let mut settings = RunSettings::new(self.project());
            tweak(&mut settings);
            Orchestrator::new(
                settings,
                self.state.clone(),
                self.invoker.clone(),
                self.events.clone(),
                self.shutdown.clone(),
            )
        }

        fn calls(&self) -> Vec<String> {
            self.invoker.calls()
        }

        fn count(&self, needle: &str) -> usize {
            self.calls().iter().filter(|c| c.contains(needle)).count()
        }

        fn write_verification(&self, status: &str) {
            let dir = planning::ensure_phase_dir(&self.project(), 1.0, "Setup").unwrap();
            std::fs::write(
                dir.join("01-VERIFICATION.md"),
                format!("---\nphase: 01-setup\nstatus: {status}\n---\n# Verification\n"),
            )
            .unwrap();
        }
    }

    fn drain(rx: &mut broadcast::Receiver<LifecycleEvent>) -> Vec<LifecycleEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn phase(state: &Arc<StateManager>, number: f64) -> PhaseState {
        state.read(|s| s.phase(number).cloned()).unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_runs_every_step_of_every_phase_in_order() {
        let fx = Fixture::new(Some(ROADMAP), ScriptedInvoker::always_succeed());
        let mut rx = fx.events.subscribe();

        let outcome = fx.orchestrator(|_| {}).run(None, None).await.unwrap();

        assert_eq!(outcome, RunOutcome::Complete);
        assert_eq!(
            fx.calls(),
            vec![
                "/gsd:discuss-phase 1",
                "/gsd:plan-phase 1",
                "/gsd:execute-phase 1",
                "/gsd:verify-work 1",
                "/gsd:discuss-phase 2",
                "/gsd:plan-phase 2",
                "/gsd:execute-phase 2",
                "/gsd:verify-work 2",
            ]
        );

        let snapshot = fx.state.snapshot().unwrap();
        assert_eq!(snapshot.status, RunStatus::Complete);
        assert_eq!(snapshot.current_step, CurrentStep::Done);
        assert!(snapshot.started_at.is_some());
        for p in &snapshot.phases {
            assert_eq!(p.status, PhaseStatus::Completed);
            assert!(Step::ALL.iter().all(|s| p.steps.get(*s) == StepStatus::Done));
        }

        let names: Vec<&str> = drain(&mut rx).iter().map(|e| e.name()).collect();
        assert_eq!(names.first(), Some(&"phase:started"));
        assert_eq!(names.last(), Some(&"build:complete"));
        assert_eq!(names.iter().filter(|n| **n == "step:completed").count(), 8);

        let config = planning::planning_dir(&fx.project()).join("config.json");
        assert!(config.exists());
    }

    #[tokio::test]
    async fn test_rerun_after_completion_invokes_nothing() {
        let fx = Fixture::new(Some(ROADMAP), ScriptedInvoker::always_succeed());
        let orchestrator = fx.orchestrator(|_| {});
        orchestrator.run(None, None).await.unwrap();
        let first = fx.calls().len();

        let outcome = orchestrator.run(None, None).await.unwrap();
        assert_eq!(outcome, RunOutcome::Complete);
        assert_eq!(fx.calls().len(), first);
    }

    #[tokio::test]
    async fn test_checked_roadmap_phases_are_not_run() {
        let roadmap = "- [x] **Phase 1: Setup**\n- [ ] **Phase 2: Core**\n";
        let fx = Fixture::new(Some(roadmap), ScriptedInvoker::always_succeed());
        fx.orchestrator(|_| {}).run(None, None).await.unwrap();
        assert_eq!(fx.count(" 1"), 0);
        assert_eq!(fx.count(" 2"), 4);
    }

    #[tokio::test]
    async fn test_phases_dropped_from_the_roadmap_are_not_run() {
        let state = RunState {
            phases: vec![PhaseState::new(1.0, "Setup"), PhaseState::new(2.0, "Dropped")],
            ..RunState::default()
        };
        let fx = Fixture::with_state(None, ScriptedInvoker::always_succeed(), state);
        let mut rx = fx.events.subscribe();
        let orchestrator = fx
            .orchestrator(|_| {})
            .with_plan_reader(Box::new(StaticPlan("- [ ] **Phase 1: Setup**\n- [ ] **Phase 3: Polish**\n")));

        let outcome = orchestrator.run(None, None).await.unwrap();

        assert_eq!(outcome, RunOutcome::Complete);
        assert_eq!(fx.count(" 2"), 0);
        assert_eq!(fx.count(" 1"), 4);
        assert_eq!(fx.count(" 3"), 4);
        assert_eq!(phase(orchestrator.state(), 2.0).status, PhaseStatus::Pending);
        assert_eq!(orchestrator.state().snapshot().unwrap().status, RunStatus::Complete);
        assert!(drain(&mut rx).iter().any(|e| matches!(e, LifecycleEvent::BuildComplete { phases: 2 })));
    }

    #[tokio::test]
    async fn test_interrupted_step_is_rerun_on_resume() {
        let mut seeded = PhaseState::new(1.0, "Setup");
        seeded.status = PhaseStatus::InProgress;
        seeded.steps.set(Step::Discuss, StepStatus::Done);
        seeded.steps.set(Step::Plan, StepStatus::Done);
        seeded.steps.set(Step::Execute, StepStatus::InProgress);
        let state = RunState {
            status: RunStatus::Running,
            phases: vec![seeded],
            ..RunState::default()
        };
        let fx = Fixture::with_state(
            Some("- [ ] **Phase 1: Setup**\n"),
            ScriptedInvoker::always_succeed(),
            state,
        );

        let outcome = fx.orchestrator(|_| {}).run(None, None).await.unwrap();

        assert_eq!(outcome, RunOutcome::Complete);
        assert_eq!(fx.calls(), vec!["/gsd:execute-phase 1", "/gsd:verify-work 1"]);
    }

    #[tokio::test]
    async fn test_single_failure_is_retried_without_escalation() {
        let fx = Fixture::new(
            Some("- [ ] **Phase 1: Setup**\n"),
            ScriptedInvoker::new(|_, i| if i == 1 { Script::failure("flaky") } else { Script::success("ok") }),
        );
        let mut rx = fx.events.subscribe();

        let outcome = fx.orchestrator(|_| {}).run(None, None).await.unwrap();

        assert_eq!(outcome, RunOutcome::Complete);
        assert_eq!(fx.count("plan-phase 1"), 2);
        assert!(fx.state.snapshot().unwrap().error_history.is_empty());
        assert!(!drain(&mut rx).iter().any(|e| e.name() == "error:escalation"));
    }

    #[tokio::test]
    async fn test_repeated_failure_escalates_and_skip_continues() {
        let fx = Fixture::new(
            Some("- [ ] **Phase 1: Setup**\n"),
            ScriptedInvoker::new(|prompt, _| {
                if prompt.contains("execute-phase") {
                    Script::failure("tests do not compile")
                } else {
                    Script::success("ok")
                }
            }),
        );
        let mut rx = fx.events.subscribe();
        let orchestrator = fx
            .orchestrator(|_| {})
            .with_escalation(Some(Arc::new(Decide(EscalationDecision::Skip))));

        let outcome = orchestrator.run(None, None).await.unwrap();

        assert_eq!(outcome, RunOutcome::Complete);
        assert_eq!(fx.count("execute-phase 1"), 2);
        assert_eq!(fx.count("verify-work 1"), 1);
        assert_eq!(phase(&fx.state, 1.0).steps.execute, StepStatus::Done);

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            LifecycleEvent::ErrorEscalation { step: Step::Execute, attempts: 2, .. }
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            LifecycleEvent::StepCompleted { step: Step::Execute, skipped: true, .. }
        )));
        let history = fx.state.snapshot().unwrap().error_history;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message, "tests do not compile");
    }

    #[tokio::test]
    async fn test_abort_decision_fails_the_run() {
        let fx = Fixture::new(
            Some("- [ ] **Phase 1: Setup**\n"),
            ScriptedInvoker::new(|_, _| Script::failure("broken")),
        );
        let orchestrator = fx
            .orchestrator(|_| {})
            .with_escalation(Some(Arc::new(Decide(EscalationDecision::Abort))));

        let err = orchestrator.run(None, None).await.unwrap_err();

        assert!(matches!(err, OrchestratorError::Aborted { step: Step::Discuss, .. }));
        assert_eq!(fx.calls().len(), 2);
        let snapshot = fx.state.snapshot().unwrap();
        assert_eq!(snapshot.status, RunStatus::Error);
        assert_eq!(snapshot.phases[0].steps.discuss, StepStatus::InProgress);
    }

    #[tokio::test]
    async fn test_second_failure_without_a_handler_aborts() {
        let fx = Fixture::new(
            Some("- [ ] **Phase 1: Setup**\n"),
            ScriptedInvoker::new(|_, _| Script::failure("broken")),
        );
        let orchestrator = fx.orchestrator(|_| {}).with_escalation(None);

        let err = tokio::time::timeout(Duration::from_secs(5), orchestrator.run(None, None))
            .await
            .expect("run must not wait for a human")
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::Aborted { step: Step::Discuss, .. }));
        assert_eq!(fx.calls().len(), 2);
        let snapshot = fx.state.snapshot().unwrap();
        assert_eq!(snapshot.status, RunStatus::Error);
        assert!(snapshot.pending_questions.is_empty());
    }

    #[tokio::test]
    async fn test_timed_out_step_is_retried_then_escalated() {
        let fx = Fixture::new(
            Some("- [ ] **Phase 1: Setup**\n"),
            ScriptedInvoker::new(|prompt, _| {
                if prompt.contains("execute-phase") {
                    Script::Hang
                } else {
                    Script::success("ok")
                }
            }),
        );
        let mut rx = fx.events.subscribe();
        let orchestrator = fx
            .orchestrator(|s| s.step_timeout = Duration::from_millis(50))
            .with_escalation(Some(Arc::new(Decide(EscalationDecision::Skip))));

        let outcome = orchestrator.run(None, None).await.unwrap();

        assert_eq!(outcome, RunOutcome::Complete);
        assert_eq!(fx.count("execute-phase 1"), 2);
        assert_eq!(fx.invoker.cancelled.load(std::sync::atomic::Ordering::SeqCst), 2);
        let history = fx.state.snapshot().unwrap().error_history;
        assert_eq!(history.len(), 1);
        assert!(history[0].message.starts_with("Timed out"));
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            LifecycleEvent::ErrorEscalation { step: Step::Execute, attempts: 2, .. }
        )));
    }

    #[tokio::test]
    async fn test_persistent_gaps_escalate_after_three_verifications() {
        let fx = Fixture::new(Some("- [ ] **Phase 1: Setup**\n"), ScriptedInvoker::always_succeed());
        fx.write_verification("gaps_found");
        let mut rx = fx.events.subscribe();

        let outcome = fx.orchestrator(|_| {}).run(None, None).await.unwrap();

        assert_eq!(outcome, RunOutcome::GapEscalated { phase: 1.0 });
        assert_eq!(fx.count("verify-work 1"), 3);
        assert_eq!(fx.count("plan-phase 1 --gaps"), 2);
        assert_eq!(fx.count("execute-phase 1 --gaps-only"), 2);

        let escalations: Vec<u32> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                LifecycleEvent::GapEscalated { iterations, .. } => Some(iterations),
                _ => None,
            })
            .collect();
        assert_eq!(escalations, vec![3]);

        let p = phase(&fx.state, 1.0);
        assert_eq!(p.status, PhaseStatus::InProgress);
        assert_eq!(p.gap_iterations, 2);
        assert_eq!(p.steps.verify, StepStatus::Idle);
        assert_eq!(fx.state.snapshot().unwrap().status, RunStatus::Idle);
    }

    #[tokio::test]
    async fn test_gap_bound_holds_across_restarts() {
        let fx = Fixture::new(Some("- [ ] **Phase 1: Setup**\n"), ScriptedInvoker::always_succeed());
        fx.write_verification("gaps_found");
        let orchestrator = fx.orchestrator(|_| {});
        orchestrator.run(None, None).await.unwrap();
        let before = fx.calls().len();

        let outcome = orchestrator.run(None, None).await.unwrap();

        assert_eq!(outcome, RunOutcome::GapEscalated { phase: 1.0 });
        assert_eq!(fx.calls()[before..], ["/gsd:verify-work 1".to_string()]);
        assert_eq!(phase(&fx.state, 1.0).gap_iterations, 2);
    }

    #[tokio::test]
    async fn test_gaps_closed_by_remediation_complete_the_phase() {
        let dir = tempdir().unwrap();
        let artifact_dir = planning::ensure_phase_dir(dir.path(), 1.0, "Setup").unwrap();
        let artifact = artifact_dir.join("01-VERIFICATION.md");
        std::fs::write(&artifact, "---\nstatus: gaps_found\n---\n").unwrap();

        let target = artifact.clone();
        let fx = Fixture::in_dir(
            dir,
            Some("- [ ] **Phase 1: Setup**\n"),
            ScriptedInvoker::new(move |prompt, _| {
                if prompt.contains("--gaps-only") {
                    std::fs::write(&target, "---\nstatus: passed\n---\n").unwrap();
                }
                Script::success("ok")
            }),
            RunState::default(),
        );

        let outcome = fx.orchestrator(|_| {}).run(None, None).await.unwrap();

        assert_eq!(outcome, RunOutcome::Complete);
        assert_eq!(fx.count("verify-work 1"), 2);
        assert_eq!(fx.count("--gaps-only"), 1);
        assert_eq!(phase(&fx.state, 1.0).gap_iterations, 1);
    }

    #[tokio::test]
    async fn test_skip_flags_replace_discussion_and_verification() {
        let fx = Fixture::new(Some("- [ ] **Phase 1: Setup**\n"), ScriptedInvoker::always_succeed());
        let mut rx = fx.events.subscribe();

        let outcome = fx
            .orchestrator(|s| {
                s.skip_discuss = true;
                s.skip_verify = true;
            })
            .run(None, None)
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::Complete);
        assert_eq!(fx.calls(), vec!["/gsd:plan-phase 1", "/gsd:execute-phase 1"]);

        let p = phase(&fx.state, 1.0);
        assert_eq!(p.status, PhaseStatus::Completed);
        assert_eq!(p.steps.discuss, StepStatus::Done);
        assert_eq!(p.steps.verify, StepStatus::Idle);

        let context = planning::find_phase_dir(&fx.project(), 1.0)
            .unwrap()
            .join("01-CONTEXT.md");
        assert!(std::fs::read_to_string(context).unwrap().contains("Claude's Discretion"));
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            LifecycleEvent::StepCompleted { step: Step::Discuss, skipped: true, .. }
        )));
    }

    #[tokio::test]
    async fn test_skip_flags_across_two_phases() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let invoker = ScriptedInvoker::new(move |prompt, _| {
            if let Some(n) = prompt.strip_prefix("/gsd:plan-phase ") {
                let number: f64 = n.trim().parse().unwrap();
                let context = planning::find_phase_dir(&root, number)
                    .map(|d| d.join(format!("{}-CONTEXT.md", planning::phase_prefix(number))))
                    .is_some_and(|p| p.exists());
                record.lock().unwrap().push((number, context));
            }
            Script::success("ok")
        });
        let fx = Fixture::in_dir(dir, Some(ROADMAP), invoker, RunState::default());

        let outcome = fx
            .orchestrator(|s| {
                s.skip_discuss = true;
                s.skip_verify = true;
            })
            .run(None, None)
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::Complete);
        assert_eq!(
            fx.calls(),
            vec![
                "/gsd:plan-phase 1",
                "/gsd:execute-phase 1",
                "/gsd:plan-phase 2",
                "/gsd:execute-phase 2",
            ]
        );
        assert_eq!(*seen.lock().unwrap(), vec![(1.0, true), (2.0, true)]);
    }

    #[tokio::test]
    async fn test_phase_filter_limits_the_run() {
        let fx = Fixture::new(Some(ROADMAP), ScriptedInvoker::always_succeed());
        let filter = PhaseFilter::Only(vec![2.0]);

        let outcome = fx.orchestrator(|_| {}).run(None, Some(&filter)).await.unwrap();

        assert_eq!(outcome, RunOutcome::Finished);
        assert_eq!(fx.count(" 1"), 0);
        assert_eq!(phase(&fx.state, 2.0).status, PhaseStatus::Completed);
        assert_eq!(phase(&fx.state, 1.0).status, PhaseStatus::Pending);
        assert_eq!(fx.state.snapshot().unwrap().status, RunStatus::Idle);
    }

    #[tokio::test]
    async fn test_shutdown_stops_after_the_in_flight_step() {
        let shutdown = ShutdownFlag::new();
        let flag = shutdown.clone();
        let mut fx = Fixture::new(
            Some(ROADMAP),
            ScriptedInvoker::new(move |_, _| {
                flag.request();
                Script::success("ok")
            }),
        );
        fx.shutdown = shutdown;

        let outcome = fx.orchestrator(|_| {}).run(None, None).await.unwrap();

        assert_eq!(outcome, RunOutcome::Interrupted);
        assert_eq!(fx.calls().len(), 1);
        let snapshot = fx.state.snapshot().unwrap();
        assert_eq!(snapshot.status, RunStatus::Idle);
        assert_eq!(snapshot.phases[0].steps.discuss, StepStatus::Done);
        assert_eq!(snapshot.phases[0].steps.plan, StepStatus::Idle);
    }

    #[tokio::test]
    async fn test_shutdown_before_the_first_step_invokes_nothing() {
        let fx = Fixture::new(Some(ROADMAP), ScriptedInvoker::always_succeed());
        let orchestrator = fx.orchestrator(|_| {});
        orchestrator.request_shutdown();
        orchestrator.request_shutdown();

        assert_eq!(orchestrator.run(None, None).await.unwrap(), RunOutcome::Interrupted);
        assert!(fx.calls().is_empty());
        assert_eq!(fx.state.snapshot().unwrap().phases.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_roadmap_without_spec_is_an_error() {
        let fx = Fixture::new(None, ScriptedInvoker::always_succeed());
        let err = fx.orchestrator(|_| {}).run(None, None).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::MissingRoadmap { .. }));
        assert!(fx.calls().is_empty());
    }

    #[tokio::test]
    async fn test_roadmap_without_phases_is_an_error() {
        let fx = Fixture::new(Some("# Roadmap\n\nNothing planned yet.\n"), ScriptedInvoker::always_succeed());
        let err = fx.orchestrator(|_| {}).run(None, None).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NoPhases { .. }));
    }

    #[tokio::test]
    async fn test_spec_bootstraps_missing_roadmap() {
        let dir = tempdir().unwrap();
        let spec = dir.path().join("SPEC.md");
        std::fs::write(&spec, "Build a todo app.").unwrap();
        let roadmap = planning::roadmap_path(dir.path());

        let fx = Fixture::in_dir(
            dir,
            None,
            ScriptedInvoker::new(move |prompt, _| {
                if prompt.starts_with("/gsd:new-project") {
                    std::fs::create_dir_all(roadmap.parent().unwrap()).unwrap();
                    std::fs::write(&roadmap, "- [ ] **Phase 1: Todo list**\n").unwrap();
                }
                Script::success("ok")
            }),
            RunState::default(),
        );

        let outcome = fx.orchestrator(|_| {}).run(Some(&spec), None).await.unwrap();

        assert_eq!(outcome, RunOutcome::Complete);
        let calls = fx.calls();
        assert_eq!(calls.len(), 5);
        assert!(calls[0].contains("Build a todo app."));
        assert_eq!(phase(&fx.state, 1.0).name, "Todo list");
    }

    #[tokio::test]
    async fn test_restored_question_is_answered_and_carried_into_the_prompt() {
        let mut unanswered = PhaseState::new(1.0, "Setup");
        unanswered.status = PhaseStatus::InProgress;
        unanswered.steps.set(Step::Discuss, StepStatus::InProgress);
        let open = |id: &str, kind| PendingQuestion {
            id: id.into(),
            phase: 1.0,
            step: Step::Discuss,
            kind,
            questions: vec![],
            created_at: Utc::now(),
            answered_at: None,
            answers: None,
        };
        let state = RunState {
            status: RunStatus::WaitingForHuman,
            phases: vec![unanswered],
            pending_questions: vec![open("agent-q", QuestionKind::Agent), open("esc-q", QuestionKind::Escalation)],
            ..RunState::default()
        };
        let fx = Fixture::with_state(
            Some("- [ ] **Phase 1: Setup**\n"),
            ScriptedInvoker::always_succeed(),
            state,
        );
        let orchestrator = fx.orchestrator(|_| {});

        let broker = orchestrator.broker();
        let mut rx = fx.events.subscribe();
        let answerer = tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if let LifecycleEvent::QuestionPending { question } = event {
                    let mut answers = Answers::new();
                    answers.insert("Which database?".into(), "SQLite".into());
                    assert!(broker.answer(&question.id, answers));
                    return question.id;
                }
            }
            String::new()
        });

        let outcome = orchestrator.run(None, None).await.unwrap();

        assert_eq!(answerer.await.unwrap(), "agent-q");
        assert_eq!(outcome, RunOutcome::Complete);
        let calls = fx.calls();
        assert!(calls[0].starts_with("/gsd:discuss-phase 1"));
        assert!(calls[0].contains("- Which database?: SQLite"));
        assert!(!calls[1].contains("Decisions already made"));

        let snapshot = fx.state.snapshot().unwrap();
        assert!(snapshot.pending_questions.iter().all(|q| q.is_answered()));
    }
}

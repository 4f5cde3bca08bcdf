use crate::events::LifecycleEvent;
use crate::prompts::phase_label;
use crate::state::Step;
use crate::ui::icons::{BLOCKER, CHECK, CROSS, QUESTION, RUNNING, SKIP, SPARKLE};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

/// Terminal view of a run, driven entirely by lifecycle events.
///
/// Two bars are stacked vertically:
/// - Phase bar: how many phases have completed
/// - Step bar: spinner naming the step the agent is working on
///
/// Everything else is printed above the bars through the shared
/// `MultiProgress`, so interactive prompts can suspend rendering.
pub struct RunUI {
    multi: MultiProgress,
    phase_bar: ProgressBar,
    step_bar: ProgressBar,
    verbose: bool,
}

impl RunUI {
    /// `total_phases` sizes the phase bar; `finished` phases are already counted.
    pub fn new(total_phases: u64, finished: u64, verbose: bool) -> Self {
        let multi = MultiProgress::new();

        let phase_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");

        let phase_bar = multi.add(ProgressBar::new(total_phases));
        phase_bar.set_style(phase_style);
        phase_bar.set_prefix("Phases");
        phase_bar.set_position(finished);

        let step_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg} {elapsed:.dim}")
            .expect("progress bar template is a valid static string");

        let step_bar = multi.add(ProgressBar::new_spinner());
        step_bar.set_style(step_style);
        step_bar.set_prefix("  Step");

        Self {
            multi,
            phase_bar,
            step_bar,
            verbose,
        }
    }

    /// Handle for suspending the bars while something else owns the terminal.
    pub fn multi(&self) -> MultiProgress {
        self.multi.clone()
    }

    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    pub fn handle(&self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::PhaseStarted { phase, name } => {
                self.phase_bar
                    .set_message(format!("{}: {}", style(phase_label(*phase)).yellow(), name));
                self.print_line(format!(
                    "{}{} {}",
                    RUNNING,
                    style(phase_label(*phase)).bold(),
                    name
                ));
            }
            LifecycleEvent::StepStarted { phase, step } => {
                self.step_bar.reset_elapsed();
                self.step_bar
                    .set_message(format!("{} {}", style(step_verb(*step)).cyan(), phase_label(*phase)));
                self.step_bar.enable_steady_tick(Duration::from_millis(100));
            }
            LifecycleEvent::StepCompleted { step, skipped, .. } => {
                if *skipped {
                    self.print_line(format!("    {}{} skipped", SKIP, step));
                } else if self.verbose {
                    self.print_line(format!("    {} {} done", style("→").dim(), style(step).dim()));
                }
                self.step_bar.disable_steady_tick();
                self.step_bar.set_message(style("idle").dim().to_string());
            }
            LifecycleEvent::PhaseCompleted { phase, name } => {
                self.phase_bar.inc(1);
                self.print_line(format!(
                    "{}{} {} complete",
                    CHECK,
                    style(phase_label(*phase)).green().bold(),
                    name
                ));
            }
            LifecycleEvent::ErrorEscalation {
                phase,
                step,
                message,
                attempts,
            } => {
                self.print_line(format!(
                    "{}{} {} failed {} times: {}",
                    CROSS,
                    phase_label(*phase),
                    step,
                    attempts,
                    style(message).red()
                ));
            }
            LifecycleEvent::GapEscalated { phase, iterations } => {
                self.print_line(format!(
                    "{}{}",
                    BLOCKER,
                    style(format!(
                        "{} still has gaps after {} verifications; needs a human",
                        phase_label(*phase),
                        iterations
                    ))
                    .red()
                    .bold()
                ));
            }
            LifecycleEvent::QuestionPending { question } => {
                self.step_bar
                    .set_message(format!("{}waiting for an answer", QUESTION));
                if self.verbose {
                    self.print_line(format!("    {}question {}", QUESTION, style(&question.id).dim()));
                }
            }
            LifecycleEvent::QuestionAnswered { .. } => {
                self.step_bar.set_message(style("resuming").dim().to_string());
            }
            LifecycleEvent::BuildComplete { phases } => {
                self.finish();
                self.print_line(format!(
                    "{}{}",
                    SPARKLE,
                    style(format!("All {} phases complete", phases)).green().bold()
                ));
            }
        }
    }

    pub fn finish(&self) {
        self.step_bar.finish_and_clear();
        self.phase_bar.finish();
    }

    /// Render events until the bus closes or the build completes.
    pub async fn follow(self, mut rx: broadcast::Receiver<LifecycleEvent>) {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let done = matches!(event, LifecycleEvent::BuildComplete { .. });
                    self.handle(&event);
                    if done {
                        return;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::debug!(component = "ui", missed, "progress view lagged behind events");
                }
                Err(RecvError::Closed) => {
                    self.finish();
                    return;
                }
            }
        }
    }
}

fn step_verb(step: Step) -> &'static str {
    match step {
        Step::Discuss => "Discussing",
        Step::Plan => "Planning",
        Step::Execute => "Executing",
        Step::Verify => "Verifying",
    }
}

//! Agent command text for each lifecycle step.

use crate::planning::phase_prefix;
use crate::state::PendingQuestion;

const COMMAND_PREFIX: &str = "/gsd:";

fn number(n: f64) -> String {
    n.to_string()
}

/// Bootstrap a project (and its roadmap) from a specification document.
pub fn new_project(spec_path: &str, spec_text: &str) -> String {
    format!(
        "{COMMAND_PREFIX}new-project\n\n\
         Initialize this project from the specification below (source: {spec_path}).\n\
         Work autonomously: do not ask for confirmation, accept sensible defaults and\n\
         write the roadmap to .planning/ROADMAP.md.\n\n\
         <specification>\n{spec_text}\n</specification>"
    )
}

pub fn discuss(phase: f64) -> String {
    format!("{COMMAND_PREFIX}discuss-phase {}", number(phase))
}

pub fn plan(phase: f64) -> String {
    format!("{COMMAND_PREFIX}plan-phase {}", number(phase))
}

pub fn plan_gaps(phase: f64) -> String {
    format!("{COMMAND_PREFIX}plan-phase {} --gaps", number(phase))
}

pub fn execute(phase: f64) -> String {
    format!("{COMMAND_PREFIX}execute-phase {}", number(phase))
}

pub fn execute_gaps(phase: f64) -> String {
    format!("{COMMAND_PREFIX}execute-phase {} --gaps-only", number(phase))
}

pub fn verify(phase: f64) -> String {
    format!("{COMMAND_PREFIX}verify-work {}", number(phase))
}

/// Append decisions answered while a previous run of this step was interrupted.
pub fn with_decisions<'a>(prompt: String, answered: impl IntoIterator<Item = &'a PendingQuestion>) -> String {
    let mut lines = Vec::new();
    for question in answered {
        let Some(answers) = &question.answers else {
            continue;
        };
        for (q, a) in answers {
            lines.push(format!("- {}: {}", q, a));
        }
    }
    if lines.is_empty() {
        return prompt;
    }
    format!(
        "{prompt}\n\nDecisions already made by the user for this step (do not ask again):\n{}",
        lines.join("\n")
    )
}

/// Label used in logs, e.g. `Phase 03.1`.
pub fn phase_label(phase: f64) -> String {
    format!("Phase {}", phase_prefix(phase))
}

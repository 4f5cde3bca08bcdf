//! Run inspection and reset: `autopilot status`, `autopilot reset`.

use anyhow::Result;
use console::style;
use std::path::Path;
use std::sync::Arc;

use autopilot::config::Config;
use autopilot::orchestrator::ResumeSummary;
use autopilot::planning::phase_prefix;
use autopilot::state::{FileStateStore, PhaseState, StateManager, Step, StepStatus};

fn step_cell(phase: &PhaseState, step: Step) -> String {
    let mark = match phase.steps.get(step) {
        StepStatus::Done => style("✓").green(),
        StepStatus::InProgress => style("…").yellow(),
        StepStatus::Idle => style("·").dim(),
    };
    format!("{} {}", step, mark)
}

pub fn cmd_status(project_dir: &Path) -> Result<()> {
    let config = Config::new(project_dir, false)?;

    println!();
    println!("Autopilot Status");
    println!("================");
    println!();
    println!("Project: {}", config.project_dir.display());
    let roadmap = if config.roadmap_file.exists() {
        "present"
    } else {
        "missing (run 'autopilot run --spec <file>' to bootstrap one)"
    };
    println!("Roadmap: {}", roadmap);

    if !config.state_file.exists() {
        println!();
        println!("No run recorded yet.");
        println!();
        return Ok(());
    }

    let state = StateManager::open(Arc::new(FileStateStore::new(config.state_file.clone())))?;
    let snapshot = state.snapshot()?;
    println!();
    print!("{}", ResumeSummary::from_state(&snapshot));
    println!();

    for phase in &snapshot.phases {
        let cells: Vec<String> = Step::ALL.iter().map(|s| step_cell(phase, *s)).collect();
        let mut line = format!(
            "  {:<6} {:<28} {:<12} {}",
            phase_prefix(phase.number),
            phase.name,
            phase.status.to_string(),
            cells.join("  ")
        );
        if phase.gap_iterations > 0 {
            line.push_str(&format!("  (gap cycles: {})", phase.gap_iterations));
        }
        println!("{}", line);
    }

    let open: Vec<_> = snapshot.unanswered_questions().collect();
    if !open.is_empty() {
        println!();
        println!("Waiting for answers:");
        for question in open {
            for item in &question.questions {
                println!("  [{} {}] {}", phase_prefix(question.phase), question.step, item.question);
            }
        }
    }
    println!();
    Ok(())
}

pub fn cmd_reset(project_dir: &Path, force: bool) -> Result<()> {
    use dialoguer::Confirm;

    let config = Config::new(project_dir, false)?;

    if !force {
        let confirm = Confirm::new()
            .with_prompt("This will reset all progress. Are you sure?")
            .default(false)
            .interact()
            .unwrap_or(false);

        if !confirm {
            println!("Reset cancelled");
            return Ok(());
        }
    }

    FileStateStore::new(config.state_file.clone()).reset()?;

    if config.log_dir.exists() {
        std::fs::remove_dir_all(&config.log_dir).ok();
    }

    println!("Reset complete");
    Ok(())
}

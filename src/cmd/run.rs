//! Phase orchestration: `autopilot run`.

use anyhow::{Context, Result};
use console::style;
use fs2::FileExt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};

use autopilot::command::ClaudeCli;
use autopilot::config::{CliOverrides, Config};
use autopilot::events::EventBus;
use autopilot::logging;
use autopilot::orchestrator::{Orchestrator, ResumeSummary, RunOutcome, RunSettings};
use autopilot::phase::{self, PhaseFilter};
use autopilot::shutdown::{FORCED_EXIT_CODE, ShutdownController};
use autopilot::state::{FileStateStore, StateManager};
use autopilot::ui::{ConsoleResponder, RunUI};

use super::super::Cli;

/// Exit code when verification gaps need a human.
const GAP_ESCALATED_EXIT_CODE: u8 = 2;

pub struct RunArgs {
    pub spec: Option<PathBuf>,
    pub phase: Option<String>,
    pub skip_discuss: bool,
    pub skip_verify: bool,
    pub timeout: Option<u64>,
    pub headless: bool,
}

/// Take the project lock, or fail if another run holds it.
fn acquire_lock(path: &Path) -> Result<File> {
    let file = File::create(path).with_context(|| format!("Failed to create lock file: {}", path.display()))?;
    file.try_lock_exclusive().map_err(|_| {
        anyhow::anyhow!(
            "Another autopilot run is already driving this project (lock: {})",
            path.display()
        )
    })?;
    Ok(file)
}

fn roadmap_phase_count(config: &Config) -> u64 {
    std::fs::read_to_string(&config.roadmap_file)
        .map(|text| phase::parse_roadmap(&text).len() as u64)
        .unwrap_or(0)
}

pub async fn cmd_run(cli: &Cli, project_dir: &Path, args: RunArgs) -> Result<ExitCode> {
    let mut config = Config::new(project_dir, cli.verbose)?;
    config.apply_overrides(&CliOverrides {
        skip_discuss: args.skip_discuss,
        skip_verify: args.skip_verify,
        timeout_secs: args.timeout,
    });
    config.ensure_directories()?;
    let _log_guard = logging::init(
        cli.verbose,
        config.json_logs.then_some(config.log_dir.as_path()),
    );

    let filter = args
        .phase
        .as_deref()
        .map(str::parse::<PhaseFilter>)
        .transpose()?;
    let spec = match &args.spec {
        Some(path) if path.is_relative() => Some(config.project_dir.join(path)),
        other => other.clone(),
    };

    let lock = acquire_lock(&config.lock_file)?;
    let store = Arc::new(FileStateStore::new(config.state_file.clone()));
    let state = Arc::new(StateManager::open(store)?);
    let invoker = Arc::new(ClaudeCli::new(
        config.claude_cmd.clone(),
        config.claude_flags(),
        config.project_dir.clone(),
    ));
    info!(
        component = "cli",
        project = %config.project_dir.display(),
        agent = %invoker.command_line(),
        "starting run"
    );

    let controller = Arc::new(ShutdownController::new());
    let signals = controller.install_signal_handlers();

    let mut settings = RunSettings::new(config.project_dir.clone());
    settings.skip_discuss = config.skip_discuss;
    settings.skip_verify = config.skip_verify;
    settings.step_timeout = config.step_timeout;
    let mut orchestrator = Orchestrator::new(settings, state, invoker, EventBus::default(), controller.flag());

    let mut consumers = Vec::new();
    if args.headless {
        // Nobody can answer an escalation, so a second failure aborts.
        orchestrator = orchestrator.with_escalation(None);
        warn!(component = "cli", "headless run: repeated failures abort, agent questions wait until shutdown");
    } else {
        let summary = orchestrator.state().read(ResumeSummary::from_state)?;
        let total = roadmap_phase_count(&config).max(summary.total as u64);
        let ui = RunUI::new(total, summary.finished as u64, cli.verbose);
        let responder = ConsoleResponder::new(orchestrator.broker(), Some(ui.multi()), controller.flag());
        consumers.push(responder.spawn(orchestrator.events().subscribe()));
        consumers.push(tokio::spawn(ui.follow(orchestrator.events().subscribe())));
    }
    for consumer in &consumers {
        let handle = consumer.abort_handle();
        controller.register_cleanup("stop event consumer", move || handle.abort());
    }

    let result = orchestrator.run(spec.as_deref(), filter.as_ref()).await;

    controller.run_cleanups();
    signals.abort();
    drop(lock);

    match result? {
        RunOutcome::Complete => {
            println!("{}", style("All phases complete.").green().bold());
            Ok(ExitCode::SUCCESS)
        }
        RunOutcome::Finished => {
            println!("Selected phases complete. Run again without --phase to continue.");
            Ok(ExitCode::SUCCESS)
        }
        RunOutcome::Interrupted => {
            println!("Interrupted. Progress is saved; run again to resume.");
            Ok(ExitCode::from(FORCED_EXIT_CODE as u8))
        }
        RunOutcome::GapEscalated { phase } => {
            println!(
                "{}",
                style(format!(
                    "Phase {} still has verification gaps after repeated remediation. Review it, then run again.",
                    phase
                ))
                .yellow()
                .bold()
            );
            Ok(ExitCode::from(GAP_ESCALATED_EXIT_CODE))
        }
    }
}

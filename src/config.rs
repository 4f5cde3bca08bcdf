use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::autopilot_config::{AutopilotToml, CONFIG_FILE};
use crate::planning;

/// Overrides taken from `run` flags. They win over file and environment.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub skip_discuss: bool,
    pub skip_verify: bool,
    pub timeout_secs: Option<u64>,
}

/// Runtime configuration for a project.
///
/// Bridges `autopilot.toml` with the paths and agent command line the
/// orchestrator needs.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub planning_dir: PathBuf,
    pub roadmap_file: PathBuf,
    pub state_file: PathBuf,
    pub lock_file: PathBuf,
    pub log_dir: PathBuf,
    pub config_file: PathBuf,
    pub claude_cmd: String,
    pub skip_permissions: bool,
    pub extra_flags: Vec<String>,
    pub step_timeout: Duration,
    pub skip_discuss: bool,
    pub skip_verify: bool,
    pub json_logs: bool,
    pub verbose: bool,
}

impl Config {
    pub fn new(project_dir: &Path, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let planning_dir = planning::planning_dir(&project_dir);
        let file = AutopilotToml::load_or_default(&planning_dir)?;
        Ok(Self::from_parts(project_dir, planning_dir, &file, verbose))
    }

    fn from_parts(project_dir: PathBuf, planning_dir: PathBuf, file: &AutopilotToml, verbose: bool) -> Self {
        Self {
            roadmap_file: planning::roadmap_path(&project_dir),
            state_file: planning_dir.join("autopilot-state.json"),
            lock_file: planning_dir.join("autopilot.lock"),
            log_dir: planning_dir.join("autopilot").join("logs"),
            config_file: planning_dir.join(CONFIG_FILE),
            claude_cmd: file.claude_cmd(),
            skip_permissions: file.skip_permissions(),
            extra_flags: file.agent.extra_flags.clone(),
            step_timeout: Duration::from_secs(file.timeout_secs()),
            skip_discuss: file.workflow.skip_discuss,
            skip_verify: file.workflow.skip_verify,
            json_logs: file.logging.json_file,
            verbose,
            project_dir,
            planning_dir,
        }
    }

    pub fn apply_overrides(&mut self, overrides: &CliOverrides) {
        self.skip_discuss |= overrides.skip_discuss;
        self.skip_verify |= overrides.skip_verify;
        if let Some(secs) = overrides.timeout_secs {
            self.step_timeout = Duration::from_secs(secs);
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        planning::ensure_layout(&self.project_dir)?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        Ok(())
    }

    /// Flags for a bidirectional stream-json agent session.
    pub fn claude_flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        if self.skip_permissions {
            flags.push("--dangerously-skip-permissions".to_string());
        }
        flags.push("--print".to_string());
        flags.push("--input-format".to_string());
        flags.push("stream-json".to_string());
        flags.push("--output-format".to_string());
        flags.push("stream-json".to_string());
        flags.push("--verbose".to_string());
        // Tool permission checks arrive as control requests on stdout.
        flags.push("--permission-prompt-tool".to_string());
        flags.push("stdio".to_string());
        flags.extend(self.extra_flags.iter().cloned());
        flags
    }
}

//! Orchestrator configuration file.
//!
//! Read from `.planning/autopilot.toml`; every key is optional. Values are
//! layered file → environment → CLI flags.
//!
//! ```toml
//! [agent]
//! claude_cmd = "claude"
//! skip_permissions = true
//! timeout_secs = 600
//! extra_flags = ["--model", "opus"]
//!
//! [workflow]
//! skip_discuss = false
//! skip_verify = false
//!
//! [logging]
//! json_file = true
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// File name inside the planning directory.
pub const CONFIG_FILE: &str = "autopilot.toml";

pub const ENV_CLAUDE_CMD: &str = "AUTOPILOT_CLAUDE_CMD";
pub const ENV_SKIP_PERMISSIONS: &str = "AUTOPILOT_SKIP_PERMISSIONS";
pub const ENV_TIMEOUT_SECS: &str = "AUTOPILOT_TIMEOUT_SECS";

/// External agent settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claude_cmd: Option<String>,
    #[serde(default = "default_skip_permissions")]
    pub skip_permissions: bool,
    /// Per-step timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Appended to the agent command line
    #[serde(default)]
    pub extra_flags: Vec<String>,
}

fn default_skip_permissions() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    600
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            claude_cmd: None,
            skip_permissions: default_skip_permissions(),
            timeout_secs: default_timeout_secs(),
            extra_flags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSection {
    #[serde(default)]
    pub skip_discuss: bool,
    #[serde(default)]
    pub skip_verify: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingSection {
    /// Write JSON logs under `.planning/autopilot/logs`
    #[serde(default = "default_json_file")]
    pub json_file: bool,
}

fn default_json_file() -> bool {
    true
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            json_file: default_json_file(),
        }
    }
}

/// The complete autopilot.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AutopilotToml {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub workflow: WorkflowSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl AutopilotToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse autopilot.toml")
    }

    /// Load from the planning directory, or defaults if the file doesn't exist.
    pub fn load_or_default(planning_dir: &Path) -> Result<Self> {
        let path = planning_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize autopilot.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Agent command; the environment variable overrides the file.
    pub fn claude_cmd(&self) -> String {
        resolve_claude_cmd(
            self.agent.claude_cmd.as_deref(),
            std::env::var(ENV_CLAUDE_CMD).ok().as_deref(),
        )
    }

    /// Environment variable overrides the file setting.
    pub fn skip_permissions(&self) -> bool {
        resolve_flag(
            self.agent.skip_permissions,
            std::env::var(ENV_SKIP_PERMISSIONS).ok().as_deref(),
        )
    }

    pub fn timeout_secs(&self) -> u64 {
        resolve_timeout(
            self.agent.timeout_secs,
            std::env::var(ENV_TIMEOUT_SECS).ok().as_deref(),
        )
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.agent.timeout_secs == 0 {
            warnings.push("agent.timeout_secs is 0: every step would time out immediately".into());
        }
        if let Some(cmd) = &self.agent.claude_cmd
            && cmd.trim().is_empty()
        {
            warnings.push("agent.claude_cmd is empty".into());
        }
        if self.workflow.skip_verify {
            warnings.push("workflow.skip_verify disables gap detection".into());
        }
        warnings
    }
}

fn resolve_claude_cmd(file: Option<&str>, env: Option<&str>) -> String {
    env.filter(|s| !s.trim().is_empty())
        .or(file)
        .filter(|s| !s.trim().is_empty())
        .unwrap_or("claude")
        .to_string()
}

fn resolve_flag(file: bool, env: Option<&str>) -> bool {
    match env {
        Some(v) => v != "false" && v != "0",
        None => file,
    }
}

fn resolve_timeout(file: u64, env: Option<&str>) -> u64 {
    env.and_then(|v| v.trim().parse().ok()).unwrap_or(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = AutopilotToml::parse("").unwrap();
        assert_eq!(config, AutopilotToml::default());
        assert!(config.agent.skip_permissions);
        assert_eq!(config.agent.timeout_secs, 600);
        assert!(config.logging.json_file);
    }

    #[test]
    fn test_parse_full_config() {
        let config = AutopilotToml::parse(
            r#"
            [agent]
            claude_cmd = "/opt/claude"
            skip_permissions = false
            timeout_secs = 120
            extra_flags = ["--model", "opus"]

            [workflow]
            skip_discuss = true
            "#,
        )
        .unwrap();
        assert_eq!(config.agent.claude_cmd.as_deref(), Some("/opt/claude"));
        assert!(!config.agent.skip_permissions);
        assert_eq!(config.agent.timeout_secs, 120);
        assert_eq!(config.agent.extra_flags, vec!["--model", "opus"]);
        assert!(config.workflow.skip_discuss);
        assert!(!config.workflow.skip_verify);
    }

    #[test]
    fn test_parse_invalid_toml() {
        assert!(AutopilotToml::parse("[agent\nbroken").is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let config = AutopilotToml::load_or_default(dir.path()).unwrap();
        assert_eq!(config, AutopilotToml::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let mut config = AutopilotToml::default();
        config.workflow.skip_verify = true;
        config.agent.timeout_secs = 42;
        let path = dir.path().join(CONFIG_FILE);
        config.save(&path).unwrap();

        let loaded = AutopilotToml::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_layering_helpers() {
        assert_eq!(resolve_claude_cmd(None, None), "claude");
        assert_eq!(resolve_claude_cmd(None, Some("/env/claude")), "/env/claude");
        assert_eq!(resolve_claude_cmd(Some("/file/claude"), Some("/env/claude")), "/env/claude");
        assert_eq!(resolve_claude_cmd(Some("/file/claude"), Some("")), "/file/claude");

        assert!(resolve_flag(true, None));
        assert!(!resolve_flag(true, Some("false")));
        assert!(!resolve_flag(true, Some("0")));
        assert!(resolve_flag(false, Some("true")));

        assert_eq!(resolve_timeout(600, None), 600);
        assert_eq!(resolve_timeout(600, Some("30")), 30);
        assert_eq!(resolve_timeout(600, Some("soon")), 600);
    }

    #[test]
    fn test_validate_warnings() {
        let mut config = AutopilotToml::default();
        assert!(config.validate().is_empty());
        config.agent.timeout_secs = 0;
        config.agent.claude_cmd = Some(" ".into());
        assert_eq!(config.validate().len(), 2);
    }
}

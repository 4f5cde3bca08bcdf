//! Project planning layout.
//!
//! The agent and the orchestrator share a `.planning/` directory:
//!
//! ```text
//! .planning/
//! ├── ROADMAP.md               # Phase list (checklist and/or headings)
//! ├── config.json              # Agent workflow settings (forced autonomous)
//! ├── autopilot.toml           # Orchestrator configuration (optional)
//! ├── autopilot-state.json     # Persisted RunState
//! ├── autopilot.lock           # Held while a run is active
//! ├── autopilot/logs/          # JSON logs
//! └── phases/
//!     └── 03-core/
//!         ├── 03-CONTEXT.md
//!         └── 03-VERIFICATION.md
//! ```

use anyhow::{Context, Result};
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::state::PhaseState;

/// The name of the planning directory.
pub const PLANNING_DIR: &str = ".planning";

pub fn planning_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(PLANNING_DIR)
}

pub fn roadmap_path(project_dir: &Path) -> PathBuf {
    planning_dir(project_dir).join("ROADMAP.md")
}

pub fn phases_dir(project_dir: &Path) -> PathBuf {
    planning_dir(project_dir).join("phases")
}

/// Create `.planning/` and `.planning/phases/` if missing.
pub fn ensure_layout(project_dir: &Path) -> Result<()> {
    let phases = phases_dir(project_dir);
    std::fs::create_dir_all(&phases)
        .with_context(|| format!("Failed to create directory: {}", phases.display()))
}

/// Write the agent workflow config that disables every interactive gate.
///
/// Keys already present in `config.json` that are unrelated to gating are kept.
pub fn write_autonomous_config(project_dir: &Path) -> Result<PathBuf> {
    ensure_layout(project_dir)?;
    let path = planning_dir(project_dir).join("config.json");

    let mut root = if path.exists() {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    } else {
        Map::new()
    };

    root.insert("mode".into(), json!("yolo"));
    root.insert(
        "gates".into(),
        json!({
            "confirm_project": false,
            "confirm_phases": false,
            "confirm_roadmap": false,
            "confirm_breakdown": false,
            "confirm_plan": false,
            "execute_next_plan": false,
            "issues_review": false,
            "confirm_transition": false
        }),
    );
    root.insert(
        "safety".into(),
        json!({
            "always_confirm_destructive": false,
            "always_confirm_external_services": false
        }),
    );

    let content = serde_json::to_string_pretty(&Value::Object(root))
        .context("Failed to serialize agent config")?;
    std::fs::write(&path, content)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    debug!(path = %path.display(), "autonomous agent config written");
    Ok(path)
}

/// Directory-name prefix for a phase: `3` → `03`, `3.1` → `03.1`.
pub fn phase_prefix(number: f64) -> String {
    let text = number.to_string();
    match text.split_once('.') {
        Some((whole, frac)) => format!("{:0>2}.{}", whole, frac),
        None => format!("{:0>2}", text),
    }
}

/// Lowercase, dash-separated, at most `max_len` characters.
pub fn slugify(name: &str, max_len: usize) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= max_len {
            break;
        }
    }
    slug.trim_matches('-').to_string()
}

/// Existing directory for a phase, matched by number prefix.
pub fn find_phase_dir(project_dir: &Path, number: f64) -> Option<PathBuf> {
    let prefix = format!("{}-", phase_prefix(number));
    let entries = std::fs::read_dir(phases_dir(project_dir)).ok()?;
    let mut matches: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
        .map(|e| e.path())
        .collect();
    matches.sort();
    matches.into_iter().next()
}

/// Directory for a phase, created as `NN-slug` when missing.
pub fn ensure_phase_dir(project_dir: &Path, number: f64, name: &str) -> Result<PathBuf> {
    if let Some(dir) = find_phase_dir(project_dir, number) {
        return Ok(dir);
    }
    let slug = slugify(name, 40);
    let dir_name = if slug.is_empty() {
        format!("{}-phase", phase_prefix(number))
    } else {
        format!("{}-{}", phase_prefix(number), slug)
    };
    let dir = phases_dir(project_dir).join(dir_name);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create phase directory: {}", dir.display()))?;
    Ok(dir)
}

/// Write a context document leaving every decision to the agent.
///
/// Used instead of the discuss step when discussion is skipped. An existing
/// context document is left untouched.
pub fn write_discretion_context(project_dir: &Path, phase: &PhaseState) -> Result<PathBuf> {
    let dir = ensure_phase_dir(project_dir, phase.number, &phase.name)?;
    let path = dir.join(format!("{}-CONTEXT.md", phase_prefix(phase.number)));
    if path.exists() {
        debug!(path = %path.display(), "context document already present");
        return Ok(path);
    }

    let content = format!(
        "# Phase {number}: {name} - Context\n\n\
         **Gathered:** {date}\n\
         **Status:** Ready for planning\n\n\
         ## Phase Boundary\n\n\
         Deliver phase {number} ({name}) as described in the roadmap.\n\n\
         ## Implementation Decisions\n\n\
         ### Claude's Discretion\n\n\
         All implementation decisions for this phase are at Claude's discretion.\n\
         No discussion was held; choose conventional, well-tested approaches that\n\
         fit the existing codebase.\n\n\
         ## Deferred Ideas\n\n\
         None.\n",
        number = phase.number,
        name = phase.name,
        date = chrono::Utc::now().format("%Y-%m-%d"),
    );
    std::fs::write(&path, content)
        .with_context(|| format!("Failed to write context document: {}", path.display()))?;
    Ok(path)
}

/// Most recent verification artifact for a phase, if verification ever wrote one.
pub fn verification_artifact(project_dir: &Path, number: f64) -> Option<PathBuf> {
    let dir = find_phase_dir(project_dir, number)?;
    let pattern = dir.join("*VERIFICATION.md");
    let mut found: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
        .ok()?
        .filter_map(|entry| entry.ok())
        .collect();
    found.sort();
    found.pop()
}

//! Verification gap detection.
//!
//! A verify step leaves an artifact in the phase directory. Gaps are read from
//! its `status:` front-matter field when present, otherwise from a fixed
//! vocabulary of markers in the body. A missing artifact means no gaps.

use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

use crate::planning;

/// Verifications allowed per phase before gaps are escalated to a human.
pub const MAX_GAP_ITERATIONS: u32 = 3;

/// Status values that mean verification found gaps.
const GAP_STATUSES: &[&str] = &["gaps_found", "gaps", "failed", "fail"];

/// Body markers that mean verification found gaps, matched case-insensitively.
const GAP_MARKERS: &[&str] = &[
    "gaps_found",
    "gaps found",
    "status: failed",
    "verification failed",
];

static STATUS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?mi)^\s*status:\s*"?([A-Za-z_\- ]+?)"?\s*$"#).expect("status regex is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GapVerdict {
    /// No verification artifact exists.
    NoArtifact,
    Passed,
    GapsFound { reason: String },
}

impl GapVerdict {
    pub fn has_gaps(&self) -> bool {
        matches!(self, GapVerdict::GapsFound { .. })
    }
}

/// Assess the text of a verification artifact.
pub fn assess_text(text: &str) -> GapVerdict {
    if let Some(caps) = STATUS_RE.captures(text) {
        let status = caps[1].trim().to_lowercase().replace([' ', '-'], "_");
        return if GAP_STATUSES.contains(&status.as_str()) {
            GapVerdict::GapsFound {
                reason: format!("status: {}", status),
            }
        } else {
            GapVerdict::Passed
        };
    }

    let lower = text.to_lowercase();
    match GAP_MARKERS.iter().find(|marker| lower.contains(*marker)) {
        Some(marker) => GapVerdict::GapsFound {
            reason: (*marker).to_string(),
        },
        None => GapVerdict::Passed,
    }
}

/// Assess the latest verification artifact of a phase.
pub fn assess_phase(project_dir: &Path, number: f64) -> GapVerdict {
    let Some(path) = planning::verification_artifact(project_dir, number) else {
        return GapVerdict::NoArtifact;
    };
    match std::fs::read_to_string(&path) {
        Ok(text) => assess_text(&text),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "unreadable verification artifact");
            GapVerdict::NoArtifact
        }
    }
}

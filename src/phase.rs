//! Phase list derivation from the project roadmap.
//!
//! This module provides:
//! - `RoadmapPhase`, one phase as declared by the roadmap
//! - Two independent extraction strategies: checklist lines and section headings
//! - `merge_phases`, a pure merge of both lists keyed by phase number
//! - `PhaseFilter` for restricting a run to some phases
//!
//! The roadmap is markdown. A phase can be declared as a checklist entry
//!
//! ```text
//! - [x] **Phase 3: Core** - the main engine
//! ```
//!
//! and/or as a heading, optionally marked inserted and followed by a dependency
//!
//! ```text
//! ### Phase 3.1: Hotfix (INSERTED)
//! **Depends on:** Phase 3
//! ```

use anyhow::{Context, Result};
use regex::Regex;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static CHECKLIST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*[-*]\s*\[([ xX])\]\s*\*\*Phase\s+(\d+(?:\.\d+)?)\s*:\s*(.+?)\*\*")
        .expect("checklist regex is valid")
});

static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^#{2,6}\s*Phase\s+(\d+(?:\.\d+)?)\s*:\s*(.+?)\s*$").expect("heading regex is valid")
});

static DEPENDS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\*\*Depends on:?\*\*:?\s*(.+?)\s*$").expect("depends regex is valid")
});

static INSERTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s*\(INSERTED\)").expect("inserted regex is valid"));

/// A phase as declared in the roadmap.
#[derive(Debug, Clone, PartialEq)]
pub struct RoadmapPhase {
    pub number: f64,
    pub name: String,
    /// Checked in the roadmap checklist. Only the checklist form carries this.
    pub completed: bool,
    pub inserted: bool,
    pub depends_on: Option<String>,
}

impl RoadmapPhase {
    fn new(number: f64, raw_name: &str) -> Self {
        let inserted = INSERTED_RE.is_match(raw_name);
        let name = INSERTED_RE.replace_all(raw_name, "").trim().to_string();
        Self {
            number,
            name,
            completed: false,
            inserted,
            depends_on: None,
        }
    }
}

/// Extract phases from checklist lines (`- [x] **Phase N: Name**`).
pub fn parse_checklist(text: &str) -> Vec<RoadmapPhase> {
    text.lines()
        .filter_map(|line| {
            let caps = CHECKLIST_RE.captures(line)?;
            let number: f64 = caps[2].parse().ok()?;
            let mut phase = RoadmapPhase::new(number, &caps[3]);
            phase.completed = caps[1].eq_ignore_ascii_case("x");
            Some(phase)
        })
        .collect()
}

/// Extract phases from heading lines (`## Phase N: Name`), picking up an
/// `(INSERTED)` marker and a `**Depends on:**` line inside the section.
pub fn parse_headings(text: &str) -> Vec<RoadmapPhase> {
    let mut phases: Vec<RoadmapPhase> = Vec::new();
    let mut in_section = false;

    for line in text.lines() {
        if let Some(caps) = HEADING_RE.captures(line) {
            match caps[1].parse::<f64>() {
                Ok(number) => {
                    phases.push(RoadmapPhase::new(number, &caps[2]));
                    in_section = true;
                }
                Err(_) => in_section = false,
            }
            continue;
        }
        if line.trim_start().starts_with('#') {
            in_section = false;
            continue;
        }
        if in_section
            && let Some(caps) = DEPENDS_RE.captures(line)
            && let Some(last) = phases.last_mut()
            && last.depends_on.is_none()
        {
            last.depends_on = Some(caps[1].to_string());
        }
    }

    phases
}

/// Merge checklist- and heading-derived phases by number.
///
/// A phase in either list appears once in the output. Enrichment (`inserted`,
/// `depends_on`, a non-empty name) is taken from whichever form has it;
/// completion comes from the checklist. The result is sorted numerically.
pub fn merge_phases(checklist: &[RoadmapPhase], headings: &[RoadmapPhase]) -> Vec<RoadmapPhase> {
    let mut merged: Vec<RoadmapPhase> = headings.to_vec();
    for phase in &mut merged {
        phase.completed = false;
    }
    merged.dedup_by(|a, b| a.number == b.number);

    for item in checklist {
        match merged.iter_mut().find(|p| p.number == item.number) {
            Some(existing) => {
                existing.completed = item.completed;
                existing.inserted |= item.inserted;
                if existing.depends_on.is_none() {
                    existing.depends_on = item.depends_on.clone();
                }
                if existing.name.is_empty() {
                    existing.name = item.name.clone();
                }
            }
            None => merged.push(item.clone()),
        }
    }

    merged.sort_by(|a, b| compare_numbers(a.number, b.number));
    merged
}

/// Parse both forms out of `text` and merge them.
pub fn parse_roadmap(text: &str) -> Vec<RoadmapPhase> {
    merge_phases(&parse_checklist(text), &parse_headings(text))
}

pub fn compare_numbers(a: f64, b: f64) -> Ordering {
    a.total_cmp(&b)
}

/// Source of the raw roadmap text.
pub trait PlanReader: Send + Sync {
    /// Raw roadmap text, or `None` when there is no roadmap yet.
    fn read_plan(&self) -> Result<Option<String>>;

    /// Where the roadmap lives, for messages.
    fn location(&self) -> PathBuf;
}

/// Reads the roadmap from a markdown file.
#[derive(Debug, Clone)]
pub struct FilePlanReader {
    path: PathBuf,
}

impl FilePlanReader {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl PlanReader for FilePlanReader {
    fn read_plan(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read roadmap: {}", self.path.display()))?;
        Ok(Some(text))
    }

    fn location(&self) -> PathBuf {
        self.path.clone()
    }
}

/// Restricts which phases a run touches.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseFilter {
    /// Only these phase numbers.
    Only(Vec<f64>),
    /// This phase and every later one.
    From(f64),
}

impl PhaseFilter {
    pub fn matches(&self, number: f64) -> bool {
        match self {
            PhaseFilter::Only(numbers) => numbers.contains(&number),
            PhaseFilter::From(start) => compare_numbers(number, *start) != Ordering::Less,
        }
    }
}

impl std::str::FromStr for PhaseFilter {
    type Err = anyhow::Error;

    /// `"3"` or `"2,3.1"` select exact phases; `"3+"` selects phase 3 onwards.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(start) = s.strip_suffix('+') {
            let start: f64 = start
                .trim()
                .parse()
                .with_context(|| format!("Invalid phase number '{}'", start))?;
            return Ok(PhaseFilter::From(start));
        }
        let numbers = s
            .split(',')
            .map(|part| {
                part.trim()
                    .parse::<f64>()
                    .with_context(|| format!("Invalid phase number '{}'", part.trim()))
            })
            .collect::<Result<Vec<_>>>()?;
        if numbers.is_empty() {
            anyhow::bail!("Phase filter is empty");
        }
        Ok(PhaseFilter::Only(numbers))
    }
}

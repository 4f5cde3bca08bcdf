use anyhow::{Context, Result};
use git2::{Oid, Repository, Sort};
use std::path::Path;

/// Read-only view of the project repository used to attribute commits to phases.
pub struct GitTracker {
    repo: Repository,
}

impl GitTracker {
    pub fn new(project_dir: &Path) -> Result<Self> {
        let repo = Repository::open(project_dir).context("Failed to open git repository")?;
        Ok(Self { repo })
    }

    /// Current HEAD SHA (None for unborn branches)
    pub fn head_sha(&self) -> Option<String> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
            .map(|c| c.id().to_string())
    }

    /// Commits reachable from HEAD but not from `base`, oldest first.
    ///
    /// With no base (the branch was unborn before the step) every commit on
    /// HEAD is returned.
    pub fn commits_since(&self, base: Option<&str>) -> Result<Vec<String>> {
        if self.head_sha().is_none() {
            return Ok(Vec::new());
        }
        let mut walk = self.repo.revwalk()?;
        walk.set_sorting(Sort::TOPOLOGICAL | Sort::REVERSE)?;
        walk.push_head()?;
        if let Some(base) = base {
            let oid = Oid::from_str(base).with_context(|| format!("Invalid commit id {}", base))?;
            walk.hide(oid)?;
        }
        walk.map(|oid| oid.map(|o| o.to_string()).map_err(anyhow::Error::from))
            .collect()
    }
}

/// HEAD of the repository at `project_dir`, if it is one.
pub fn head_commit(project_dir: &Path) -> Option<String> {
    GitTracker::new(project_dir).ok()?.head_sha()
}

/// Commits made since `base`; empty when the directory is not a repository.
pub fn commits_since(project_dir: &Path, base: Option<&str>) -> Vec<String> {
    let Ok(tracker) = GitTracker::new(project_dir) else {
        return Vec::new();
    };
    match tracker.commits_since(base) {
        Ok(commits) => commits,
        Err(e) => {
            tracing::warn!(error = %e, "could not list commits for phase");
            Vec::new()
        }
    }
}

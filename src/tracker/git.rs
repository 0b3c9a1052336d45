//! Git progress tracking between phases.
//!
//! Implementation phases are expected to commit their work. The tracker
//! observes HEAD after each one; a run of phases with no new commit means
//! the agent is burning budget without landing anything.

use git2::Repository;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Sentinel for "no repository / unborn branch".
pub const NO_COMMIT: &str = "none";

#[derive(Debug)]
pub struct ProgressTracker {
    repo_dir: PathBuf,
    last_commit: String,
    no_progress_count: u32,
    tolerance: u32,
}

impl ProgressTracker {
    pub fn new(repo_dir: impl Into<PathBuf>, tolerance: u32) -> Self {
        let repo_dir = repo_dir.into();
        let last_commit = head_sha(&repo_dir);
        Self {
            repo_dir,
            last_commit,
            no_progress_count: 0,
            tolerance,
        }
    }

    /// Record an observation after `phase` ran. Returns `false` once the
    /// no-progress count reaches the tolerance.
    ///
    /// Only phases that are expected to commit are counted; anything else
    /// leaves the tracker untouched.
    pub fn check(&mut self, phase: &str) -> bool {
        if !phase.starts_with("implement-") && !phase.starts_with("security-fix-") {
            return true;
        }

        let current = head_sha(&self.repo_dir);
        if current == self.last_commit && self.last_commit != NO_COMMIT && !self.last_commit.is_empty() {
            self.no_progress_count += 1;
            warn!(
                phase,
                count = self.no_progress_count,
                "no new git commits after phase"
            );
        } else {
            self.no_progress_count = 0;
            self.last_commit = current;
        }

        self.no_progress_count < self.tolerance
    }

    pub fn no_progress_count(&self) -> u32 {
        self.no_progress_count
    }
}

/// Current HEAD commit hash, or the `none` sentinel when there is no
/// repository or the branch is unborn.
pub fn head_sha(repo_dir: &Path) -> String {
    Repository::open(repo_dir)
        .ok()
        .and_then(|repo| {
            repo.head()
                .ok()
                .and_then(|head| head.peel_to_commit().ok())
                .map(|commit| commit.id().to_string())
        })
        .unwrap_or_else(|| NO_COMMIT.to_string())
}

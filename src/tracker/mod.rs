pub mod git;

pub use git::{GitTracker, commits_since, head_commit};

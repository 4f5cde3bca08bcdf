//! Typed error hierarchy for the autopilot orchestrator.
//!
//! Three top-level enums cover the three subsystems:
//! - `OrchestratorError`: phase loop, retry policy and escalation outcomes
//! - `StateError`: run-state persistence failures
//! - `AgentError`: failures starting or talking to the external agent

use crate::state::Step;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the orchestrator subsystem.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("No roadmap found at {path} and no spec file was given to bootstrap one")]
    MissingRoadmap { path: PathBuf },

    #[error("Roadmap at {path} does not declare any phases")]
    NoPhases { path: PathBuf },

    #[error("Run aborted at phase {phase} step {step}: {reason}")]
    Aborted {
        phase: f64,
        step: Step,
        reason: String,
    },

    /// Shutdown was requested while a step was in flight. Never retried or escalated.
    #[error("Aborted by shutdown request")]
    ShutdownInFlight,

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn is_shutdown(&self) -> bool {
        matches!(self, OrchestratorError::ShutdownInFlight)
    }
}

/// Errors from the run-state store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Failed to read state file at {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("State file at {path} is not valid JSON: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to write state file at {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize run state: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Run state lock poisoned")]
    LockPoisoned,
}

/// Errors from the external agent transport.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to spawn agent process `{cmd}`: {source}")]
    SpawnFailed {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Agent I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Agent session closed before it could receive input")]
    Closed,
}

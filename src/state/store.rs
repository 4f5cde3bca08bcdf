use super::RunState;
use crate::errors::StateError;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Durable storage for [`RunState`].
///
/// `save` must replace the stored record atomically: a reader never observes a
/// partially written state.
pub trait StateStore: Send + Sync {
    /// Load the stored state, or a fresh default when nothing was stored yet.
    fn load(&self) -> Result<RunState, StateError>;

    fn save(&self, state: &RunState) -> Result<(), StateError>;
}

/// JSON file store using temp-file + rename.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the state file if it exists.
    pub fn reset(&self) -> Result<(), StateError> {
        if self.path.exists() {
            fs::remove_file(&self.path).map_err(|source| StateError::WriteFailed {
                path: self.path.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<RunState, StateError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no run state yet, starting fresh");
            return Ok(RunState::default());
        }
        let contents = fs::read_to_string(&self.path).map_err(|source| StateError::ReadFailed {
            path: self.path.clone(),
            source,
        })?;
        let state: RunState =
            serde_json::from_str(&contents).map_err(|source| StateError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        debug!(
            path = %self.path.display(),
            status = %state.status,
            phases = state.phases.len(),
            "run state loaded"
        );
        Ok(state)
    }

    fn save(&self, state: &RunState) -> Result<(), StateError> {
        let mut buf = serde_json::to_string_pretty(state).map_err(StateError::Serialize)?;
        buf.push('\n');
        write_atomic(&self.path, &buf)
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<(), StateError> {
    let write_err = |source| StateError::WriteFailed {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents).map_err(write_err)?;
    fs::rename(&tmp_path, path).map_err(write_err)?;
    Ok(())
}

/// In-memory store that also keeps every saved snapshot, in order.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    current: Mutex<Option<RunState>>,
    history: Mutex<Vec<RunState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing state, as if it had been read from disk.
    pub fn with_state(state: RunState) -> Self {
        Self {
            current: Mutex::new(Some(state)),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Every state passed to `save`, oldest first.
    pub fn history(&self) -> Vec<RunState> {
        self.history
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    pub fn current(&self) -> Option<RunState> {
        self.current.lock().ok().and_then(|c| c.clone())
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<RunState, StateError> {
        let current = self.current.lock().map_err(|_| StateError::LockPoisoned)?;
        Ok(current.clone().unwrap_or_default())
    }

    fn save(&self, state: &RunState) -> Result<(), StateError> {
        *self.current.lock().map_err(|_| StateError::LockPoisoned)? = Some(state.clone());
        self.history
            .lock()
            .map_err(|_| StateError::LockPoisoned)?
            .push(state.clone());
        Ok(())
    }
}

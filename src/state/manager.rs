use super::{RunState, StateStore};
use crate::errors::StateError;
use chrono::Utc;
use std::sync::{Arc, Mutex};

/// Single-writer handle over the run state and its store.
///
/// Every `update` applies the patch to a copy of the state, refreshes
/// `last_updated_at` and persists it. The copy replaces the in-memory state
/// only once the store accepted it, so memory never runs ahead of disk.
pub struct StateManager {
    store: Arc<dyn StateStore>,
    state: Mutex<RunState>,
}

impl StateManager {
    /// Load the current state from `store`.
    pub fn open(store: Arc<dyn StateStore>) -> Result<Self, StateError> {
        let state = store.load()?;
        Ok(Self {
            store,
            state: Mutex::new(state),
        })
    }

    /// Clone of the current state.
    pub fn snapshot(&self) -> Result<RunState, StateError> {
        self.read(|s| s.clone())
    }

    pub fn read<R>(&self, f: impl FnOnce(&RunState) -> R) -> Result<R, StateError> {
        let state = self.state.lock().map_err(|_| StateError::LockPoisoned)?;
        Ok(f(&state))
    }

    /// Apply `patch`, stamp `last_updated_at`, persist.
    pub fn update<R>(&self, patch: impl FnOnce(&mut RunState) -> R) -> Result<R, StateError> {
        let mut state = self.state.lock().map_err(|_| StateError::LockPoisoned)?;
        let mut next = state.clone();
        let out = patch(&mut next);
        next.last_updated_at = Utc::now();
        self.store.save(&next)?;
        *state = next;
        Ok(out)
    }
}

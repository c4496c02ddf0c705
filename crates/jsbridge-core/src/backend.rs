//! Process-level coordination between runtime backends.
//!
//! Some native engines cannot coexist in one process, and some must not be
//! initialized concurrently. A [`BackendCoordinator`] tracks which backend
//! kinds are live and serializes runtime creation for the engines that
//! share it. It is an ordinary value: inject one into every
//! [`ScriptEngineBuilder`](crate::ScriptEngineBuilder) that must cooperate.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct CoordinatorState {
    active: HashMap<String, usize>,
    conflicts: Vec<(String, String)>,
}

impl CoordinatorState {
    fn conflicting_active(&self, kind: &str) -> Option<&str> {
        self.conflicts.iter().find_map(|(a, b)| {
            let other = if a == kind {
                b
            } else if b == kind {
                a
            } else {
                return None;
            };
            self.active
                .get(other)
                .is_some_and(|count| *count > 0)
                .then_some(other.as_str())
        })
    }
}

#[derive(Debug, Default)]
pub struct BackendCoordinator {
    state: Mutex<CoordinatorState>,
    creation: Mutex<()>,
}

impl BackendCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that backends `a` and `b` cannot be live at the same time.
    #[must_use]
    pub fn with_conflict(self, a: &str, b: &str) -> Self {
        self.declare_conflict(a, b);
        self
    }

    pub fn declare_conflict(&self, a: &str, b: &str) {
        self.state
            .lock()
            .conflicts
            .push((a.to_string(), b.to_string()));
    }

    /// Register a live instance of `kind`. Fails when a conflicting kind
    /// is live.
    pub fn acquire(self: &Arc<Self>, kind: &str) -> Result<BackendLease> {
        let mut state = self.state.lock();
        if let Some(other) = state.conflicting_active(kind) {
            return Err(Error::EngineLoad(format!(
                "backend '{kind}' cannot be loaded while '{other}' is active in this process"
            )));
        }
        *state.active.entry(kind.to_string()).or_insert(0) += 1;
        tracing::debug!(backend = kind, "backend lease acquired");
        Ok(BackendLease {
            coordinator: Arc::clone(self),
            kind: kind.to_string(),
        })
    }

    #[must_use]
    pub fn active_count(&self, kind: &str) -> usize {
        self.state.lock().active.get(kind).copied().unwrap_or(0)
    }

    /// Hold while creating a runtime.
    pub fn creation_guard(&self) -> MutexGuard<'_, ()> {
        self.creation.lock()
    }

    fn release(&self, kind: &str) {
        let mut state = self.state.lock();
        if let Some(count) = state.active.get_mut(kind) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.active.remove(kind);
            }
        }
        tracing::debug!(backend = kind, "backend lease released");
    }
}

/// A live backend registration; released on drop.
#[derive(Debug)]
pub struct BackendLease {
    coordinator: Arc<BackendCoordinator>,
    kind: String,
}

impl BackendLease {
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }
}

impl Drop for BackendLease {
    fn drop(&mut self) {
        self.coordinator.release(&self.kind);
    }
}

//! Task tracking for per-connection background tasks
//!
//! Keeps the keepalive task of every live socket so it can be aborted when
//! the socket closes or the server shuts down.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;

/// Tracks background tasks keyed by connection
#[derive(Default)]
pub struct TaskTracker {
    /// Map of connection key -> task handle
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a task for a connection, aborting any task it replaces
    pub fn register(&self, key: impl Into<String>, handle: JoinHandle<()>) {
        if let Some(old_handle) = self.tasks().insert(key.into(), handle) {
            old_handle.abort();
        }
    }

    /// Unregister and abort the task of a connection
    pub fn unregister(&self, key: &str) {
        if let Some(handle) = self.tasks().remove(key) {
            handle.abort();
        }
    }

    /// Abort every tracked task
    pub fn abort_all(&self) {
        let drained: Vec<_> = self.tasks().drain().collect();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "Aborting tracked tasks");
        }
        for (_, handle) in drained {
            handle.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! Per-session state and the process-wide session registry.
//!
//! Each session lives behind its own async mutex. Holding that guard for the
//! whole of an ingest (including inference and event delivery) serializes all
//! mutations of one session, while different sessions proceed in parallel.

use crate::core::history::HistoryLog;
use crate::core::inference::InferenceResult;
use crate::core::windowing::{WindowBuffer, WindowMode};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Everything the engine tracks for one session.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub mode: WindowMode,
    pub buffer: WindowBuffer,
    pub history: HistoryLog,
    pub last_result: Option<InferenceResult>,
}

impl SessionState {
    /// Fresh state with the given mode and history limit.
    pub fn new(mode: WindowMode, history_limit: usize) -> Self {
        Self {
            mode,
            buffer: WindowBuffer::new(),
            history: HistoryLog::new(history_limit),
            last_result: None,
        }
    }

    /// Clear buffer, history and last result, returning the compression count
    /// held before the reset. The mode is kept.
    pub fn reset(&mut self) -> usize {
        let before = self.history.len();
        self.buffer.clear();
        self.history.clear();
        self.last_result = None;
        before
    }
}

/// Shared handle to one session's serialized state.
pub type SessionHandle = Arc<Mutex<SessionState>>;

/// Table of all sessions, created lazily on first use.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    default_mode: WindowMode,
    history_limit: usize,
}

impl SessionRegistry {
    /// Empty registry; new sessions start in `default_mode`.
    pub fn new(default_mode: WindowMode, history_limit: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            default_mode,
            history_limit,
        }
    }

    /// Mode given to sessions on creation.
    pub fn default_mode(&self) -> WindowMode {
        self.default_mode
    }

    /// Look up a session, creating it with empty state and the default mode.
    pub async fn get_or_create(&self, session_id: &str) -> SessionHandle {
        if let Some(handle) = self.sessions.read().await.get(session_id) {
            return Arc::clone(handle);
        }

        let mut sessions = self.sessions.write().await;
        let handle = sessions.entry(session_id.to_string()).or_insert_with(|| {
            tracing::debug!(session_id, "Creating session");
            Arc::new(Mutex::new(SessionState::new(
                self.default_mode,
                self.history_limit,
            )))
        });
        Arc::clone(handle)
    }

    /// Look up a session without creating it.
    pub async fn get(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Number of known sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether no session has been created yet.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_does_not_create() {
        let registry = SessionRegistry::new(WindowMode::NonOverlap, 120);
        assert!(registry.get("never-seen").await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_get_or_create_is_lazy_and_shared() {
        let registry = SessionRegistry::new(WindowMode::NonOverlap, 120);
        assert!(registry.get("s1").await.is_none());

        let a = registry.get_or_create("s1").await;
        let b = registry.get_or_create("s1").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len().await, 1);

        let state = a.lock().await;
        assert_eq!(state.mode, WindowMode::NonOverlap);
        assert!(state.buffer.is_empty());
        assert!(state.history.is_empty());
        assert!(state.last_result.is_none());
    }

    #[tokio::test]
    async fn test_reset_keeps_mode() {
        let registry = SessionRegistry::new(WindowMode::NonOverlap, 120);
        let handle = registry.get_or_create("s1").await;
        {
            let mut state = handle.lock().await;
            state.mode = WindowMode::Sliding;
            for _ in 0..5 {
                state.buffer.push(5.0);
                state.history.push(5.0);
            }
        }

        let mut state = handle.lock().await;
        assert_eq!(state.reset(), 5);
        assert_eq!(state.mode, WindowMode::Sliding);
        assert!(state.buffer.is_empty());
        assert!(state.history.is_empty());
    }
}

//! Per-session event fan-out.
//!
//! Observers attach to a session and receive every event published for it
//! through their own bounded channel. Delivery is best effort: each observer
//! gets a bounded amount of time, and a full, slow or closed observer never
//! holds up the others or the publisher.
//!
//! ```text
//! engine ──publish(session, event)──▶ EventHub
//!                                        │  (per observer, bounded wait)
//!                        ┌───────────────┼───────────────┐
//!                        ▼               ▼               ▼
//!                    observer A      observer B      observer C
//! ```

use crate::core::inference::InferenceResult;
use crate::core::windowing::WindowMode;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Current time as fractional Unix seconds.
pub fn now_secs() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Events pushed to session observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A sample was accepted.
    DepthData {
        session_id: String,
        depth_cm: f32,
        buffer_len: usize,
        total_compressions: usize,
        timestamp: f64,
    },
    /// The history limit was reached and the session started over.
    SessionComplete {
        session_id: String,
        total_compressions: usize,
        message: String,
        timestamp: f64,
    },
    /// A window was classified.
    Inference {
        session_id: String,
        #[serde(flatten)]
        result: InferenceResult,
    },
    /// The session was reset on request.
    SessionReset {
        session_id: String,
        total_compressions_before_reset: usize,
        message: String,
        timestamp: f64,
    },
    /// The session's windowing mode was changed on request.
    ModeChange {
        session_id: String,
        old_mode: WindowMode,
        new_mode: WindowMode,
        message: String,
        timestamp: f64,
    },
}

impl SessionEvent {
    pub fn depth_data(
        session_id: &str,
        depth_cm: f32,
        buffer_len: usize,
        total_compressions: usize,
    ) -> Self {
        SessionEvent::DepthData {
            session_id: session_id.to_string(),
            depth_cm,
            buffer_len,
            total_compressions,
            timestamp: now_secs(),
        }
    }

    pub fn session_complete(session_id: &str, total_compressions: usize) -> Self {
        SessionEvent::SessionComplete {
            session_id: session_id.to_string(),
            total_compressions,
            message: format!("{total_compressions} compressions reached, session reset automatically."),
            timestamp: now_secs(),
        }
    }

    pub fn inference(session_id: &str, result: InferenceResult) -> Self {
        SessionEvent::Inference {
            session_id: session_id.to_string(),
            result,
        }
    }

    pub fn session_reset(session_id: &str, total_compressions_before_reset: usize) -> Self {
        SessionEvent::SessionReset {
            session_id: session_id.to_string(),
            total_compressions_before_reset,
            message: "Session reset by user.".to_string(),
            timestamp: now_secs(),
        }
    }

    pub fn mode_change(session_id: &str, old_mode: WindowMode, new_mode: WindowMode) -> Self {
        SessionEvent::ModeChange {
            session_id: session_id.to_string(),
            old_mode,
            new_mode,
            message: format!("Mode changed from {old_mode} to {new_mode}"),
            timestamp: now_secs(),
        }
    }

    /// The `type` tag this event serializes with.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::DepthData { .. } => "depth_data",
            SessionEvent::SessionComplete { .. } => "session_complete",
            SessionEvent::Inference { .. } => "inference",
            SessionEvent::SessionReset { .. } => "session_reset",
            SessionEvent::ModeChange { .. } => "mode_change",
        }
    }
}

/// Identifies one attached observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(Uuid);

impl ObserverId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Receiving side handed to an observer on attach.
#[derive(Debug)]
pub struct Subscription {
    pub id: ObserverId,
    pub session_id: String,
    pub receiver: mpsc::Receiver<SessionEvent>,
}

#[derive(Debug, Clone)]
struct Observer {
    id: ObserverId,
    tx: mpsc::Sender<SessionEvent>,
}

/// Outcome of one publish call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub dropped: usize,
}

/// Fan-out broadcaster grouping observers by session.
pub struct EventHub {
    observers: RwLock<HashMap<String, Vec<Observer>>>,
    delivery_timeout: Duration,
    buffer: usize,
}

impl EventHub {
    pub fn new(delivery_timeout: Duration, buffer: usize) -> Self {
        Self {
            observers: RwLock::new(HashMap::new()),
            delivery_timeout,
            buffer: buffer.max(1),
        }
    }

    /// Attach a new observer to `session_id`.
    pub async fn attach(&self, session_id: &str) -> Subscription {
        let (tx, receiver) = mpsc::channel(self.buffer);
        let id = ObserverId::new();

        self.observers
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push(Observer { id, tx });
        tracing::debug!(session_id, observer = %id, "Observer attached");

        Subscription {
            id,
            session_id: session_id.to_string(),
            receiver,
        }
    }

    /// Detach an observer. The session's group is dropped once empty.
    pub async fn detach(&self, session_id: &str, id: ObserverId) {
        let mut observers = self.observers.write().await;
        if let Some(group) = observers.get_mut(session_id) {
            group.retain(|o| o.id != id);
            if group.is_empty() {
                observers.remove(session_id);
            }
        }
        tracing::debug!(session_id, observer = %id, "Observer detached");
    }

    /// Deliver `event` to every observer of `session_id`.
    ///
    /// Each observer gets at most the configured delivery timeout. Failures are
    /// absorbed; observers whose channel is closed are pruned.
    pub async fn publish(&self, session_id: &str, event: &SessionEvent) -> Delivery {
        let targets: Vec<Observer> = match self.observers.read().await.get(session_id) {
            Some(group) => group.clone(),
            None => return Delivery::default(),
        };

        let mut delivery = Delivery::default();
        let mut closed = Vec::new();

        for observer in targets {
            match observer
                .tx
                .send_timeout(event.clone(), self.delivery_timeout)
                .await
            {
                Ok(()) => delivery.delivered += 1,
                Err(SendTimeoutError::Timeout(_)) => {
                    delivery.dropped += 1;
                    tracing::debug!(
                        session_id,
                        observer = %observer.id,
                        kind = event.kind(),
                        "Observer too slow, event dropped"
                    );
                }
                Err(SendTimeoutError::Closed(_)) => {
                    delivery.dropped += 1;
                    closed.push(observer.id);
                }
            }
        }

        for id in closed {
            tracing::warn!(session_id, observer = %id, "Pruning disconnected observer");
            self.detach(session_id, id).await;
        }

        delivery
    }

    /// Number of observers currently attached to `session_id`.
    pub async fn observer_count(&self, session_id: &str) -> usize {
        self.observers
            .read()
            .await
            .get(session_id)
            .map_or(0, Vec::len)
    }

    /// Whether any observer group exists for `session_id`.
    pub async fn has_group(&self, session_id: &str) -> bool {
        self.observers.read().await.contains_key(session_id)
    }
}

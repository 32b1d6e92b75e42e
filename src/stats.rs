//! Process-wide service statistics.
//!
//! Counters only; nothing here is tied to a session or survives a restart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by the engine.
#[derive(Debug)]
pub struct ServiceStats {
    samples_ingested: AtomicU64,
    inferences_run: AtomicU64,
    inference_failures: AtomicU64,
    samples_discarded: AtomicU64,
    sessions_completed: AtomicU64,
    manual_resets: AtomicU64,
    events_published: AtomicU64,
    deliveries_dropped: AtomicU64,
    started_at: DateTime<Utc>,
}

impl ServiceStats {
    pub fn new() -> Self {
        Self {
            samples_ingested: AtomicU64::new(0),
            inferences_run: AtomicU64::new(0),
            inference_failures: AtomicU64::new(0),
            samples_discarded: AtomicU64::new(0),
            sessions_completed: AtomicU64::new(0),
            manual_resets: AtomicU64::new(0),
            events_published: AtomicU64::new(0),
            deliveries_dropped: AtomicU64::new(0),
            started_at: Utc::now(),
        }
    }

    pub fn record_sample(&self) {
        self.samples_ingested.fetch_add(1, Ordering::Relaxed);
    }

    /// Record classified windows.
    pub fn record_inferences(&self, count: u64) {
        self.inferences_run.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_inference_failure(&self) {
        self.inference_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session completing at the history limit, along with the
    /// buffered samples thrown away before they formed a window.
    pub fn record_session_completed(&self, discarded: usize) {
        self.sessions_completed.fetch_add(1, Ordering::Relaxed);
        self.samples_discarded
            .fetch_add(discarded as u64, Ordering::Relaxed);
    }

    pub fn record_manual_reset(&self) {
        self.manual_resets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish(&self, dropped: usize) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
        self.deliveries_dropped
            .fetch_add(dropped as u64, Ordering::Relaxed);
    }

    /// Get the current statistics.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            samples_ingested: self.samples_ingested.load(Ordering::Relaxed),
            inferences_run: self.inferences_run.load(Ordering::Relaxed),
            inference_failures: self.inference_failures.load(Ordering::Relaxed),
            samples_discarded: self.samples_discarded.load(Ordering::Relaxed),
            sessions_completed: self.sessions_completed.load(Ordering::Relaxed),
            manual_resets: self.manual_resets.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            deliveries_dropped: self.deliveries_dropped.load(Ordering::Relaxed),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
        }
    }
}

impl Default for ServiceStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`ServiceStats`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub samples_ingested: u64,
    pub inferences_run: u64,
    pub inference_failures: u64,
    pub samples_discarded: u64,
    pub sessions_completed: u64,
    pub manual_resets: u64,
    pub events_published: u64,
    pub deliveries_dropped: u64,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
}

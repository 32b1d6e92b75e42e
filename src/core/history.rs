//! Rolling depth history kept for charting.
//!
//! The history is independent of inference: it only records raw samples so
//! observers can redraw recent compressions. Once it reaches its limit the
//! owning session is reset automatically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Number of compressions after which a session completes and starts over.
pub const HISTORY_LIMIT: usize = 120;

/// A recorded sample with its capture time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub depth_cm: f32,
    pub recorded_at: DateTime<Utc>,
}

/// One point of a history query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthPoint {
    /// Position within the returned slice
    pub index: usize,
    pub depth: f32,
    /// Capture time in Unix seconds
    pub timestamp: i64,
}

/// Outcome of appending to the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryPush {
    /// Sample recorded; carries the new length.
    Recorded(usize),
    /// The limit was reached; carries the count that triggered completion.
    LimitReached(usize),
}

/// Capped, append-only sample log.
#[derive(Debug, Clone)]
pub struct HistoryLog {
    entries: VecDeque<HistoryEntry>,
    limit: usize,
}

impl HistoryLog {
    /// Create an empty log that completes after `limit` samples.
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(limit),
            limit: limit.max(1),
        }
    }

    /// Record a sample. Reaching the limit is reported but the caller decides
    /// when to clear, so the completion event can be sent first.
    pub fn push(&mut self, depth_cm: f32) -> HistoryPush {
        self.entries.push_back(HistoryEntry {
            depth_cm,
            recorded_at: Utc::now(),
        });

        let len = self.entries.len();
        if len >= self.limit {
            HistoryPush::LimitReached(len)
        } else {
            HistoryPush::Recorded(len)
        }
    }

    /// Number of samples recorded since the last clear.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been recorded since the last clear.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sample count that completes a session.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Forget every recorded sample.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// The most recent `limit` samples, oldest first, indexed from zero.
    pub fn recent(&self, limit: usize) -> Vec<DepthPoint> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries
            .iter()
            .skip(skip)
            .enumerate()
            .map(|(index, entry)| DepthPoint {
                index,
                depth: entry.depth_cm,
                timestamp: entry.recorded_at.timestamp(),
            })
            .collect()
    }
}

impl Default for HistoryLog {
    fn default() -> Self {
        Self::new(HISTORY_LIMIT)
    }
}

//! Window management for turning a stream of depth samples into
//! fixed-size classification windows.
//!
//! Two policies are supported:
//! - **Sliding**: every sample after warm-up produces a window made of the
//!   most recent `WINDOW_SIZE` samples (stride 1).
//! - **Non-overlap**: a window fires only when the buffer holds exactly
//!   `WINDOW_SIZE` samples, after which the buffer is cleared
//!   (stride `WINDOW_SIZE`).

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

/// Number of compressions in one classification window.
pub const WINDOW_SIZE: usize = 10;

/// Mode strings that select the non-overlapping policy after normalization.
const NONOVERLAP_ALIASES: [&str; 4] = ["nonoverlap", "nonoverlapping", "block", "batch"];

/// Windowing mode held per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowMode {
    /// Overlapping windows, one inference per new sample after warm-up.
    Sliding,
    /// Disjoint windows, one inference per `WINDOW_SIZE` samples.
    #[default]
    #[serde(rename = "nonoverlap")]
    NonOverlap,
}

impl WindowMode {
    /// Canonical names accepted by the explicit mode-change operation.
    pub const AVAILABLE: [&'static str; 2] = ["sliding", "nonoverlap"];

    /// Map an arbitrary mode string onto a mode.
    ///
    /// Case is ignored and `-` / `_` separators are stripped. Any of
    /// `nonoverlap`, `nonoverlapping`, `block` or `batch` selects
    /// [`WindowMode::NonOverlap`]; everything else is [`WindowMode::Sliding`].
    pub fn normalize(raw: &str) -> Self {
        let token: String = raw
            .trim()
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .flat_map(char::to_lowercase)
            .collect();

        if NONOVERLAP_ALIASES.contains(&token.as_str()) {
            WindowMode::NonOverlap
        } else {
            WindowMode::Sliding
        }
    }

    /// Resolve the effective mode for one sample.
    ///
    /// Precedence: request override, then the mode carried in the sample
    /// payload, then the session's stored mode. The stored mode already
    /// starts out as the configured default. Blank strings count as absent.
    pub fn resolve(override_mode: Option<&str>, payload_mode: Option<&str>, stored: Self) -> Self {
        let given = |m: &&str| !m.trim().is_empty();
        match override_mode.filter(given).or(payload_mode.filter(given)) {
            Some(raw) => Self::normalize(raw),
            None => stored,
        }
    }

    /// Number of samples a window advances between inferences.
    pub fn stride(self) -> usize {
        match self {
            WindowMode::Sliding => 1,
            WindowMode::NonOverlap => WINDOW_SIZE,
        }
    }

    /// Canonical wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            WindowMode::Sliding => "sliding",
            WindowMode::NonOverlap => "nonoverlap",
        }
    }
}

impl fmt::Display for WindowMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strict parse used by the mode-change operation: only the canonical names.
impl FromStr for WindowMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sliding" => Ok(WindowMode::Sliding),
            "nonoverlap" => Ok(WindowMode::NonOverlap),
            other => Err(format!(
                "mode must be 'sliding' or 'nonoverlap', got '{other}'"
            )),
        }
    }
}

/// Readiness and consumption rules for a windowing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPolicy {
    mode: WindowMode,
    window_size: usize,
}

impl WindowPolicy {
    /// Policy for `mode` over windows of [`WINDOW_SIZE`] samples.
    pub fn new(mode: WindowMode) -> Self {
        Self {
            mode,
            window_size: WINDOW_SIZE,
        }
    }

    /// The mode this policy applies.
    pub fn mode(&self) -> WindowMode {
        self.mode
    }

    /// Samples per classification window.
    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Samples consumed by each inference.
    pub fn stride(&self) -> usize {
        self.mode.stride()
    }

    /// Whether a buffer of `buffer_len` samples holds a window to classify.
    ///
    /// Non-overlap requires the length to be exactly the window size so that a
    /// partially refilled buffer never re-triggers.
    pub fn is_ready(&self, buffer_len: usize) -> bool {
        match self.mode {
            WindowMode::Sliding => buffer_len >= self.window_size,
            WindowMode::NonOverlap => buffer_len == self.window_size,
        }
    }

    /// Number of samples to keep after a window has been consumed.
    pub fn retain_after_inference(&self) -> usize {
        self.window_size.saturating_sub(self.stride())
    }

    /// Consume the buffer after an inference attempt.
    pub fn consume(&self, buffer: &mut WindowBuffer) {
        buffer.retain_latest(self.retain_after_inference());
    }
}

/// Bounded queue of recent depth samples used to assemble windows.
#[derive(Debug, Clone, Default)]
pub struct WindowBuffer {
    samples: VecDeque<f32>,
}

impl WindowBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(WINDOW_SIZE * 2),
        }
    }

    /// Append one sample at the back.
    pub fn push(&mut self, depth_cm: f32) {
        self.samples.push_back(depth_cm);
    }

    /// Number of buffered samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no samples are buffered.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Drop every buffered sample.
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// The most recent `size` samples in arrival order, if that many exist.
    pub fn latest_window(&self, size: usize) -> Option<Vec<f32>> {
        if self.samples.len() < size {
            return None;
        }
        Some(self.samples.iter().skip(self.samples.len() - size).copied().collect())
    }

    /// Drop samples from the front until at most `keep` remain.
    fn retain_latest(&mut self, keep: usize) {
        while self.samples.len() > keep {
            self.samples.pop_front();
        }
    }
}

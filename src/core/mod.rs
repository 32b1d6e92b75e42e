//! Core functionality for the CPR stream agent.
//!
//! This module contains:
//! - Windowing policies that turn samples into classification windows
//! - The rolling depth history used for charting
//! - Window classification on top of a pluggable classifier
//! - Per-session state and the session registry

pub mod history;
pub mod inference;
pub mod session;
pub mod windowing;

// Re-export commonly used types
pub use history::{DepthPoint, HistoryLog, HistoryPush, HISTORY_LIMIT};
pub use inference::{
    softmax, Classifier, ClassifierError, InferenceDispatcher, InferenceError, InferenceResult,
    Tensor,
};
pub use session::{SessionHandle, SessionRegistry, SessionState};
pub use windowing::{WindowBuffer, WindowMode, WindowPolicy, WINDOW_SIZE};

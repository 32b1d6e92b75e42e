//! CPR Stream Agent - live classification of chest-compression depth.
//!
//! This library turns an unbounded stream of compression depths (in
//! centimeters) into fixed-size windows, classifies each window with a
//! pre-trained model and pushes live results to every observer of a session.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      CPR Stream Agent                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  sample ──▶ SessionRegistry ──▶ SessionState                │
//! │                                   │   │                     │
//! │                     ┌─────────────┘   └──────────┐          │
//! │                     ▼                            ▼          │
//! │              ┌─────────────┐              ┌────────────┐    │
//! │              │ WindowBuffer│──(policy)──▶ │ Dispatcher │    │
//! │              └─────────────┘              └────────────┘    │
//! │              ┌─────────────┐                     │          │
//! │              │ HistoryLog  │ (120, auto-reset)   │          │
//! │              └─────────────┘                     ▼          │
//! │                     └──────────────────────▶ EventHub ──▶ observers
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use cpr_stream_agent::{Config, Sample, StreamEngine};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let engine = StreamEngine::from_config(&Config::default())?;
//!
//! let mut events = engine.subscribe("s1").await;
//! let outcome = engine.ingest("s1", Sample::new(5.4), None).await?;
//! println!("buffer now holds {} samples", outcome.buffer_len);
//!
//! while let Some(event) = events.receiver.recv().await {
//!     println!("{}", event.kind());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod engine;
pub mod events;
pub mod model;
pub mod stats;

#[cfg(feature = "server")]
pub mod server;

// Re-export key types at crate root for convenience
pub use config::{ClassLabels, Config, ConfigError, ScalerParams};
pub use core::{
    Classifier, ClassifierError, InferenceDispatcher, InferenceResult, Tensor, WindowMode,
    HISTORY_LIMIT, WINDOW_SIZE,
};
pub use engine::{
    EngineError, EngineOptions, HistorySnapshot, IngestOutcome, LastResult, ModeChange, Sample,
    StreamEngine,
};
pub use events::{EventHub, ObserverId, SessionEvent, Subscription};
pub use model::LinearModel;
pub use stats::{ServiceStats, StatsSnapshot};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

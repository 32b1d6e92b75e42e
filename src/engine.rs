//! Streaming windowing and inference-dispatch engine.
//!
//! [`StreamEngine`] is the single entry point used by the transport layer.
//! It owns the session registry, the event hub and the inference dispatcher.
//!
//! # Event order within one ingest
//!
//! 1. `session_complete` when the sample reaches the history limit. The
//!    history and window buffer are then cleared and the sample's own
//!    `depth_data` is skipped.
//! 2. `depth_data` otherwise.
//! 3. `inference` when the sample completed a window.
//!
//! `session_reset` and `mode_change` come from their own operations. All
//! events of one session are published while its lock is held, so observers
//! see them in the order the state changed.

use crate::config::{ClassLabels, Config, ConfigError, ScalerParams};
use crate::core::history::{DepthPoint, HistoryPush};
use crate::core::inference::{InferenceDispatcher, InferenceError, InferenceResult};
use crate::core::session::SessionRegistry;
use crate::core::windowing::{WindowMode, WindowPolicy, WINDOW_SIZE};
use crate::events::{EventHub, ObserverId, SessionEvent, Subscription};
use crate::model::LinearModel;
use crate::stats::{ServiceStats, StatsSnapshot};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Errors reported to the caller of a single request.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed input; nothing was changed.
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("invalid mode: {0}")]
    InvalidMode(String),
    /// The classifier produced something other than `[batch, num_classes]`.
    #[error("model output is not [batch, num_classes]: {0}")]
    ModelShape(String),
    #[error("classifier error: {0}")]
    Classifier(String),
}

impl EngineError {
    /// Whether the caller sent a bad request, as opposed to a processing failure.
    pub fn is_client_error(&self) -> bool {
        matches!(self, EngineError::Validation(_) | EngineError::InvalidMode(_))
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "INVALID_PAYLOAD",
            EngineError::InvalidMode(_) => "INVALID_MODE",
            EngineError::ModelShape(_) => "MODEL_OUTPUT",
            EngineError::Classifier(_) => "CLASSIFIER_ERROR",
        }
    }
}

impl From<InferenceError> for EngineError {
    fn from(err: InferenceError) -> Self {
        match err {
            InferenceError::InvalidWindow(msg) => EngineError::Validation(msg),
            InferenceError::ModelShape(msg) => EngineError::ModelShape(msg),
            InferenceError::Classifier(e) => EngineError::Classifier(e.to_string()),
        }
    }
}

/// Tunables for the engine, usually taken from [`Config`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub default_mode: WindowMode,
    pub history_limit: usize,
    pub delivery_timeout: Duration,
    pub observer_buffer: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for EngineOptions {
    fn from(config: &Config) -> Self {
        Self {
            default_mode: config.default_mode,
            history_limit: config.history_limit,
            delivery_timeout: config.delivery_timeout,
            observer_buffer: config.observer_buffer,
        }
    }
}

/// One incoming depth sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub depth_cm: f64,
    /// Mode requested by the device alongside the sample
    #[serde(default)]
    pub mode: Option<String>,
}

impl Sample {
    pub fn new(depth_cm: f64) -> Self {
        Self {
            depth_cm,
            mode: None,
        }
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }
}

/// Result of ingesting one sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub mode: WindowMode,
    pub window_size: usize,
    pub stride: usize,
    /// Buffer length after any consumption
    pub buffer_len: usize,
    pub inferred: bool,
    pub result: Option<InferenceResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LastResult {
    pub buffer_len: usize,
    pub result: Option<InferenceResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistorySnapshot {
    pub buffer_len: usize,
    pub depth_data: Vec<DepthPoint>,
    pub total_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeChange {
    pub old_mode: WindowMode,
    pub new_mode: WindowMode,
}

/// Per-session windowing, inference and event fan-out.
pub struct StreamEngine {
    registry: SessionRegistry,
    hub: EventHub,
    dispatcher: Arc<InferenceDispatcher>,
    stats: ServiceStats,
}

impl StreamEngine {
    pub fn new(dispatcher: InferenceDispatcher, options: EngineOptions) -> Self {
        Self {
            registry: SessionRegistry::new(options.default_mode, options.history_limit),
            hub: EventHub::new(options.delivery_timeout, options.observer_buffer),
            dispatcher: Arc::new(dispatcher),
            stats: ServiceStats::new(),
        }
    }

    /// Build an engine from configuration: load calibration and model, check
    /// them against the label table and run a warm-up inference.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let scaler_path = config.resolved_scaler_path();
        let scaler = ScalerParams::load(&scaler_path)?;
        tracing::info!("Loaded calibration from {:?}", scaler_path);

        let model = LinearModel::load(&config.model_path)?;
        let labels = ClassLabels::new(config.class_labels.clone())?;
        if model.num_classes() != labels.len() {
            return Err(ConfigError::InvalidModel(format!(
                "model has {} classes but {} labels are configured",
                model.num_classes(),
                labels.len()
            )));
        }
        tracing::info!(
            "Loaded model from {:?} ({} classes)",
            config.model_path,
            model.num_classes()
        );

        let dispatcher = InferenceDispatcher::new(Arc::new(model), scaler, labels);
        dispatcher
            .warm_up()
            .map_err(|e| ConfigError::InvalidModel(format!("warm-up failed: {e}")))?;

        Ok(Self::new(dispatcher, EngineOptions::from(config)))
    }

    pub fn dispatcher(&self) -> &InferenceDispatcher {
        &self.dispatcher
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn default_mode(&self) -> WindowMode {
        self.registry.default_mode()
    }

    /// Number of sessions seen since startup.
    pub async fn session_count(&self) -> usize {
        self.registry.len().await
    }

    /// Attach an observer to a session's event stream.
    pub async fn subscribe(&self, session_id: &str) -> Subscription {
        self.hub.attach(session_id).await
    }

    pub async fn unsubscribe(&self, session_id: &str, id: ObserverId) {
        self.hub.detach(session_id, id).await;
    }

    /// Feed one depth sample into a session.
    ///
    /// The mode is resolved from `mode_override`, then the sample's own mode,
    /// then the session's stored mode, and is stored back on the session.
    pub async fn ingest(
        &self,
        session_id: &str,
        sample: Sample,
        mode_override: Option<&str>,
    ) -> Result<IngestOutcome, EngineError> {
        validate_session_id(session_id)?;
        // Checked after narrowing: values beyond f32 range become infinite.
        let depth = sample.depth_cm as f32;
        if !depth.is_finite() {
            return Err(EngineError::Validation(format!(
                "depth_cm must be a finite number, got {}",
                sample.depth_cm
            )));
        }

        let handle = self.registry.get_or_create(session_id).await;
        let mut state = handle.lock().await;

        let mode = WindowMode::resolve(mode_override, sample.mode.as_deref(), state.mode);
        state.mode = mode;
        let policy = WindowPolicy::new(mode);

        state.buffer.push(depth);
        self.stats.record_sample();

        match state.history.push(depth) {
            HistoryPush::LimitReached(total) => {
                tracing::info!(session_id, total, "History limit reached, completing session");
                self.publish(session_id, SessionEvent::session_complete(session_id, total))
                    .await;
                self.stats.record_session_completed(state.buffer.len());
                state.history.clear();
                state.buffer.clear();
            }
            HistoryPush::Recorded(total) => {
                let event = SessionEvent::depth_data(session_id, depth, state.buffer.len(), total);
                self.publish(session_id, event).await;
            }
        }

        let mut result = None;
        if policy.is_ready(state.buffer.len()) {
            if let Some(window) = state.buffer.latest_window(WINDOW_SIZE) {
                let outcome = self.run_inference(vec![window]).await;
                // A failed window is consumed too, so it is never retried.
                policy.consume(&mut state.buffer);

                let inferred = match outcome {
                    Ok(mut results) => results.pop(),
                    Err(e) => {
                        tracing::warn!(session_id, "Inference failed: {}", e);
                        return Err(e);
                    }
                };
                if let Some(inferred) = inferred {
                    state.last_result = Some(inferred.clone());
                    self.publish(session_id, SessionEvent::inference(session_id, inferred.clone()))
                        .await;
                    result = Some(inferred);
                }
            }
        }

        tracing::debug!(
            session_id,
            %mode,
            buffer_len = state.buffer.len(),
            inferred = result.is_some(),
            "Sample ingested"
        );

        Ok(IngestOutcome {
            mode,
            window_size: policy.window_size(),
            stride: policy.stride(),
            buffer_len: state.buffer.len(),
            inferred: result.is_some(),
            result,
        })
    }

    /// Classify one window directly, bypassing the session buffer.
    pub async fn predict(
        &self,
        session_id: &str,
        window: Vec<f32>,
    ) -> Result<InferenceResult, EngineError> {
        let mut results = self.predict_batch(session_id, vec![window]).await?;
        results
            .pop()
            .ok_or_else(|| EngineError::ModelShape("empty batch output".to_string()))
    }

    /// Classify several windows in one classifier call. The last result
    /// becomes the session's last result and is published.
    pub async fn predict_batch(
        &self,
        session_id: &str,
        windows: Vec<Vec<f32>>,
    ) -> Result<Vec<InferenceResult>, EngineError> {
        validate_session_id(session_id)?;
        for (i, window) in windows.iter().enumerate() {
            validate_window(i, window)?;
        }
        if windows.is_empty() {
            return Ok(Vec::new());
        }

        let handle = self.registry.get_or_create(session_id).await;
        let mut state = handle.lock().await;

        let results = self.run_inference(windows).await.map_err(|e| {
            tracing::warn!(session_id, "Direct prediction failed: {}", e);
            e
        })?;

        if let Some(last) = results.last() {
            state.last_result = Some(last.clone());
            self.publish(session_id, SessionEvent::inference(session_id, last.clone()))
                .await;
        }

        Ok(results)
    }

    /// Last result and current buffer length; defaults for unknown sessions.
    pub async fn get_last(&self, session_id: &str) -> LastResult {
        match self.registry.get(session_id).await {
            Some(handle) => {
                let state = handle.lock().await;
                LastResult {
                    buffer_len: state.buffer.len(),
                    result: state.last_result.clone(),
                }
            }
            None => LastResult::default(),
        }
    }

    /// The most recent `limit` recorded samples of a session.
    pub async fn get_history(&self, session_id: &str, limit: usize) -> HistorySnapshot {
        match self.registry.get(session_id).await {
            Some(handle) => {
                let state = handle.lock().await;
                let depth_data = state.history.recent(limit);
                HistorySnapshot {
                    buffer_len: state.buffer.len(),
                    total_count: depth_data.len(),
                    depth_data,
                }
            }
            None => HistorySnapshot::default(),
        }
    }

    /// Clear a session's buffer, history and last result.
    ///
    /// Returns the compression count before the reset; unknown sessions are
    /// left alone and report zero.
    pub async fn reset(&self, session_id: &str) -> usize {
        let Some(handle) = self.registry.get(session_id).await else {
            return 0;
        };

        let mut state = handle.lock().await;
        let before = state.reset();
        self.stats.record_manual_reset();
        tracing::info!(session_id, before, "Session reset");

        self.publish(session_id, SessionEvent::session_reset(session_id, before))
            .await;
        before
    }

    /// Change a session's windowing mode. Only canonical mode names are
    /// accepted here.
    pub async fn set_mode(&self, session_id: &str, mode: &str) -> Result<ModeChange, EngineError> {
        validate_session_id(session_id)?;
        let new_mode: WindowMode = mode.parse().map_err(EngineError::InvalidMode)?;

        let handle = self.registry.get_or_create(session_id).await;
        let mut state = handle.lock().await;
        let old_mode = std::mem::replace(&mut state.mode, new_mode);
        tracing::info!(session_id, %old_mode, %new_mode, "Mode changed");

        self.publish(
            session_id,
            SessionEvent::mode_change(session_id, old_mode, new_mode),
        )
        .await;

        Ok(ModeChange { old_mode, new_mode })
    }

    /// A session's stored mode, or the default for unknown sessions.
    pub async fn get_mode(&self, session_id: &str) -> WindowMode {
        match self.registry.get(session_id).await {
            Some(handle) => handle.lock().await.mode,
            None => self.registry.default_mode(),
        }
    }

    /// Run the classifier off the async runtime.
    async fn run_inference(
        &self,
        windows: Vec<Vec<f32>>,
    ) -> Result<Vec<InferenceResult>, EngineError> {
        let dispatcher = Arc::clone(&self.dispatcher);
        let outcome = tokio::task::spawn_blocking(move || dispatcher.infer_batch(&windows))
            .await
            .map_err(|e| EngineError::Classifier(format!("inference task failed: {e}")))?;

        match outcome {
            Ok(results) => {
                self.stats.record_inferences(results.len() as u64);
                Ok(results)
            }
            Err(e) => {
                self.stats.record_inference_failure();
                Err(e.into())
            }
        }
    }

    async fn publish(&self, session_id: &str, event: SessionEvent) {
        let delivery = self.hub.publish(session_id, &event).await;
        self.stats.record_publish(delivery.dropped);
    }
}

fn validate_session_id(session_id: &str) -> Result<(), EngineError> {
    if session_id.trim().is_empty() {
        return Err(EngineError::Validation("session_id must not be empty".to_string()));
    }
    Ok(())
}

fn validate_window(index: usize, window: &[f32]) -> Result<(), EngineError> {
    if window.len() != WINDOW_SIZE {
        return Err(EngineError::Validation(format!(
            "window {index} has {} values, expected {WINDOW_SIZE}",
            window.len()
        )));
    }
    if window.iter().any(|v| !v.is_finite()) {
        return Err(EngineError::Validation(format!(
            "window {index} contains a non-finite value"
        )));
    }
    Ok(())
}

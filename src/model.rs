//! File-backed linear classifier.
//!
//! The model artifact is a JSON dense layer mapping a standardized window to
//! one score per class:
//!
//! ```json
//! { "weights": [[w0, ..., w9], ...], "bias": [b0, ...] }
//! ```

use crate::config::ConfigError;
use crate::core::inference::{Classifier, ClassifierError, Tensor};
use crate::core::windowing::WINDOW_SIZE;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Dense `[K, WINDOW_SIZE]` weights plus `[K]` bias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub weights: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
}

impl LinearModel {
    /// Read and validate a model artifact.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let model: LinearModel =
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        model.validate()?;
        Ok(model)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.weights.is_empty() {
            return Err(ConfigError::InvalidModel("model has no classes".to_string()));
        }
        if self.bias.len() != self.weights.len() {
            return Err(ConfigError::InvalidModel(format!(
                "{} weight rows but {} bias values",
                self.weights.len(),
                self.bias.len()
            )));
        }
        if let Some(row) = self.weights.iter().position(|r| r.len() != WINDOW_SIZE) {
            return Err(ConfigError::InvalidModel(format!(
                "weight row {row} does not have {WINDOW_SIZE} values"
            )));
        }
        Ok(())
    }

    pub fn num_classes(&self) -> usize {
        self.weights.len()
    }

    fn score<'a>(&'a self, window: &'a [f32]) -> impl Iterator<Item = f32> + 'a {
        self.weights.iter().zip(&self.bias).map(move |(row, b)| {
            row.iter().zip(window).map(|(w, x)| w * x).sum::<f32>() + b
        })
    }
}

impl Classifier for LinearModel {
    fn run(&self, input: &Tensor) -> Result<Vec<Tensor>, ClassifierError> {
        let shape = input.shape();
        if shape.len() != 3 || shape[1] != WINDOW_SIZE || shape[2] != 1 {
            return Err(ClassifierError::Failed(format!(
                "expected input [batch, {WINDOW_SIZE}, 1], got {shape:?}"
            )));
        }

        let batch = shape[0];
        let mut scores = Vec::with_capacity(batch * self.num_classes());
        for window in input.data().chunks(WINDOW_SIZE) {
            scores.extend(self.score(window));
        }

        Ok(vec![Tensor::new(vec![batch, self.num_classes()], scores)?])
    }
}

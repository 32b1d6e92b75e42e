//! Window classification.
//!
//! The dispatcher standardizes each window with the calibration parameters,
//! runs the classifier on a `[batch, WINDOW_SIZE, 1]` tensor and turns the
//! `[batch, K]` scores into labelled probabilities.

use crate::config::{ClassLabels, ScalerParams};
use crate::core::windowing::WINDOW_SIZE;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Dense row-major numeric tensor exchanged with a [`Classifier`].
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// Build a tensor, checking that `data` fills `shape` exactly.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, ClassifierError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(ClassifierError::Failed(format!(
                "tensor shape {shape:?} needs {expected} values, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Row `i` of a 2-D tensor.
    pub fn row(&self, i: usize) -> Option<&[f32]> {
        if self.ndim() != 2 || i >= self.shape[0] {
            return None;
        }
        let width = self.shape[1];
        self.data.get(i * width..(i + 1) * width)
    }
}

/// Errors raised by a classifier implementation.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("classifier failed: {0}")]
    Failed(String),
}

/// A pre-trained model that scores depth windows.
///
/// Input is shaped `[batch, WINDOW_SIZE, 1]`; the first output must hold
/// un-normalized scores shaped `[batch, K]`. Implementations must be
/// deterministic for identical input.
pub trait Classifier: Send + Sync {
    fn run(&self, input: &Tensor) -> Result<Vec<Tensor>, ClassifierError>;
}

/// Labelled prediction for one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub class_index: usize,
    pub class_label: String,
    pub probs: Vec<f64>,
}

/// Failures while classifying windows.
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("invalid window: {0}")]
    InvalidWindow(String),
    /// The model artifact does not produce `[batch, num_classes]` scores.
    #[error("model output is not [batch, num_classes]: {0}")]
    ModelShape(String),
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
}

/// Numerically stable softmax over one row of scores.
pub fn softmax(scores: &[f32]) -> Vec<f64> {
    let max = scores
        .iter()
        .copied()
        .map(f64::from)
        .fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores.iter().map(|&s| (f64::from(s) - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Index of the largest value; ties resolve to the first occurrence.
pub fn argmax(values: &[f64]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |(best, best_val), (i, &v)| {
            if v > best_val {
                (i, v)
            } else {
                (best, best_val)
            }
        })
        .0
}

fn round6(p: f64) -> f64 {
    (p * 1e6).round() / 1e6
}

/// Runs the classifier on standardized windows and post-processes its scores.
pub struct InferenceDispatcher {
    classifier: Arc<dyn Classifier>,
    scaler: ScalerParams,
    labels: ClassLabels,
}

impl InferenceDispatcher {
    pub fn new(classifier: Arc<dyn Classifier>, scaler: ScalerParams, labels: ClassLabels) -> Self {
        Self {
            classifier,
            scaler,
            labels,
        }
    }

    pub fn labels(&self) -> &ClassLabels {
        &self.labels
    }

    /// Classify a single window.
    pub fn infer(&self, window: &[f32]) -> Result<InferenceResult, InferenceError> {
        let mut results = self.infer_batch(&[window.to_vec()])?;
        results
            .pop()
            .ok_or_else(|| InferenceError::ModelShape("empty batch output".to_string()))
    }

    /// Classify several windows in one classifier call.
    pub fn infer_batch(&self, windows: &[Vec<f32>]) -> Result<Vec<InferenceResult>, InferenceError> {
        if windows.is_empty() {
            return Ok(Vec::new());
        }

        let input = self.to_model_input(windows)?;
        let outputs = self.classifier.run(&input)?;
        let scores = self.check_scores(&outputs, windows.len())?;

        (0..windows.len())
            .map(|i| {
                let row = scores
                    .row(i)
                    .ok_or_else(|| InferenceError::ModelShape(format!("missing row {i}")))?;
                Ok(self.postprocess(row))
            })
            .collect()
    }

    /// Run one all-zero window through the model to surface artifact problems
    /// before serving.
    pub fn warm_up(&self) -> Result<(), InferenceError> {
        let input = Tensor::zeros(vec![1, WINDOW_SIZE, 1]);
        let outputs = self.classifier.run(&input)?;
        self.check_scores(&outputs, 1)?;
        Ok(())
    }

    /// The first output must be `[batch, num_labels]`.
    fn check_scores<'a>(
        &self,
        outputs: &'a [Tensor],
        batch: usize,
    ) -> Result<&'a Tensor, InferenceError> {
        let scores = outputs
            .first()
            .ok_or_else(|| InferenceError::ModelShape("classifier returned no outputs".to_string()))?;

        if scores.ndim() != 2 {
            return Err(InferenceError::ModelShape(format!(
                "got {} dimensions {:?}",
                scores.ndim(),
                scores.shape()
            )));
        }
        if scores.shape()[0] != batch {
            return Err(InferenceError::ModelShape(format!(
                "batch size {} does not match input batch {}",
                scores.shape()[0],
                batch
            )));
        }
        if scores.shape()[1] != self.labels.len() {
            return Err(InferenceError::ModelShape(format!(
                "{} classes but {} labels configured",
                scores.shape()[1],
                self.labels.len()
            )));
        }
        Ok(scores)
    }

    fn to_model_input(&self, windows: &[Vec<f32>]) -> Result<Tensor, InferenceError> {
        let mut data = Vec::with_capacity(windows.len() * WINDOW_SIZE);
        for (i, window) in windows.iter().enumerate() {
            if window.len() != WINDOW_SIZE {
                return Err(InferenceError::InvalidWindow(format!(
                    "window {i} has {} values, expected {WINDOW_SIZE}",
                    window.len()
                )));
            }
            if window.iter().any(|v| !v.is_finite()) {
                return Err(InferenceError::InvalidWindow(format!(
                    "window {i} contains a non-finite value"
                )));
            }
            data.extend(self.scaler.standardize(window));
        }

        Tensor::new(vec![windows.len(), WINDOW_SIZE, 1], data).map_err(InferenceError::from)
    }

    fn postprocess(&self, scores: &[f32]) -> InferenceResult {
        let probs = softmax(scores);
        let class_index = argmax(&probs);
        InferenceResult {
            class_index,
            class_label: self.labels.label(class_index).to_string(),
            probs: probs.into_iter().map(round6).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scores each window by its first standardized value.
    struct FirstValueClassifier;

    impl Classifier for FirstValueClassifier {
        fn run(&self, input: &Tensor) -> Result<Vec<Tensor>, ClassifierError> {
            let batch = input.shape()[0];
            let mut data = Vec::with_capacity(batch * 4);
            for b in 0..batch {
                let first = input.data()[b * WINDOW_SIZE];
                data.extend([first, -first, 0.0, 0.5]);
            }
            Ok(vec![Tensor::new(vec![batch, 4], data)?])
        }
    }

    struct FlatClassifier;

    impl Classifier for FlatClassifier {
        fn run(&self, _input: &Tensor) -> Result<Vec<Tensor>, ClassifierError> {
            Ok(vec![Tensor::zeros(vec![4])])
        }
    }

    fn dispatcher(classifier: Arc<dyn Classifier>) -> InferenceDispatcher {
        InferenceDispatcher::new(classifier, ScalerParams::identity(), ClassLabels::default())
    }

    #[test]
    fn test_softmax_properties() {
        let cases: [&[f32]; 4] = [
            &[1.0, 2.0, 3.0, 4.0],
            &[1000.0, 999.0, -1000.0, 0.0],
            &[-5.0, -5.0, -5.0, -5.0],
            &[0.0, 88.0, -88.0, 3.5],
        ];

        for scores in cases {
            let probs = softmax(scores);
            let sum: f64 = probs.iter().sum();
            assert!((sum - 1.0).abs() < 1e-6, "sum {sum} for {scores:?}");
            assert!(probs.iter().all(|p| (0.0..=1.0).contains(p)));

            let raw: Vec<f64> = scores.iter().map(|&s| f64::from(s)).collect();
            assert_eq!(argmax(&probs), argmax(&raw));
        }
    }

    #[test]
    fn test_infer_single_window() {
        let dispatcher = dispatcher(Arc::new(FirstValueClassifier));
        let result = dispatcher.infer(&[3.0; WINDOW_SIZE]).unwrap();

        assert_eq!(result.class_index, 0);
        assert_eq!(result.class_label, "stabil");
        assert_eq!(result.probs.len(), 4);
    }

    #[test]
    fn test_infer_batch_matches_single() {
        let dispatcher = dispatcher(Arc::new(FirstValueClassifier));
        let windows = vec![vec![3.0; WINDOW_SIZE], vec![-3.0; WINDOW_SIZE]];

        let batch = dispatcher.infer_batch(&windows).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0], dispatcher.infer(&windows[0]).unwrap());
        assert_eq!(batch[1], dispatcher.infer(&windows[1]).unwrap());
        assert_eq!(batch[1].class_label, "ga stabil");
    }

    #[test]
    fn test_wrong_length_is_invalid() {
        let dispatcher = dispatcher(Arc::new(FirstValueClassifier));
        let err = dispatcher.infer(&[1.0; 9]).unwrap_err();
        assert!(matches!(err, InferenceError::InvalidWindow(_)));
    }

    #[test]
    fn test_non_2d_output_is_shape_error() {
        let dispatcher = dispatcher(Arc::new(FlatClassifier));
        let err = dispatcher.infer(&[1.0; WINDOW_SIZE]).unwrap_err();
        assert!(matches!(err, InferenceError::ModelShape(_)));
    }

    #[test]
    fn test_warm_up_checks_output_shape() {
        assert!(dispatcher(Arc::new(FirstValueClassifier)).warm_up().is_ok());

        let err = dispatcher(Arc::new(FlatClassifier)).warm_up().unwrap_err();
        assert!(matches!(err, InferenceError::ModelShape(_)));

        let three_labels = ClassLabels::new(vec!["a".into(), "b".into(), "c".into()]).unwrap();
        let mismatched = InferenceDispatcher::new(
            Arc::new(FirstValueClassifier),
            ScalerParams::identity(),
            three_labels,
        );
        assert!(matches!(mismatched.warm_up(), Err(InferenceError::ModelShape(_))));
    }

    #[test]
    fn test_tensor_rows() {
        let t = Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(t.row(1), Some(&[4.0, 5.0, 6.0][..]));
        assert_eq!(t.row(2), None);
        assert!(Tensor::new(vec![2, 2], vec![1.0]).is_err());
    }
}

//! Categorical losses over batched class-probability predictions.
//!
//! Losses operate on `N x C` arrays: `y_true` holds one-hot or soft labels
//! and `y_pred` holds predicted class probabilities. They return one loss
//! value per sample; reduction over the batch is left to the caller.

use std::fmt;

use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fuzz factor used to keep predictions away from exactly 0 and 1.
pub const EPSILON: f32 = 1e-7;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LossError {
    #[error("Shape mismatch: {what} has {actual} but expected {expected}")]
    ShapeMismatch {
        what: &'static str,
        expected: String,
        actual: String,
    },
    #[error("Invalid class weights: {0}")]
    InvalidWeights(String),
}

/// A per-sample loss with its gradient with respect to the predictions.
pub trait Loss: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Computes one loss value per row of the batch.
    fn compute(&self, y_true: ArrayView2<'_, f32>, y_pred: ArrayView2<'_, f32>)
        -> Result<Array1<f32>, LossError>;

    /// Returns `d loss_i / d y_pred[i, j]` for every sample.
    fn gradient(&self, y_true: ArrayView2<'_, f32>, y_pred: ArrayView2<'_, f32>)
        -> Result<Array2<f32>, LossError>;

    /// Mean of `compute` over the batch; zero for an empty batch.
    fn mean(&self, y_true: ArrayView2<'_, f32>, y_pred: ArrayView2<'_, f32>) -> Result<f32, LossError> {
        let per_sample = self.compute(y_true, y_pred)?;
        Ok(per_sample.mean().unwrap_or(0.0))
    }
}

/// Serializable selection of the loss a model is compiled with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LossSpec {
    CategoricalCrossentropy,
    WeightedCategoricalCrossentropy { weights: Vec<f32> },
}

impl Default for LossSpec {
    fn default() -> Self {
        Self::CategoricalCrossentropy
    }
}

impl LossSpec {
    /// Instantiates the selected loss.
    ///
    /// # Errors
    /// - `InvalidWeights` if the weighted variant carries unusable weights
    pub fn build(&self) -> Result<Box<dyn Loss>, LossError> {
        match self {
            Self::CategoricalCrossentropy => Ok(Box::new(CategoricalCrossentropy)),
            Self::WeightedCategoricalCrossentropy { weights } => {
                Ok(Box::new(make_weighted_loss(weights.clone())?))
            }
        }
    }
}

impl fmt::Display for LossSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CategoricalCrossentropy => write!(f, "categorical_crossentropy"),
            Self::WeightedCategoricalCrossentropy { weights } => {
                write!(f, "weighted_categorical_crossentropy{:?}", weights)
            }
        }
    }
}

/// Standard categorical cross-entropy: `-sum_c y_true * ln(y_pred)` after
/// row normalization and clipping.
#[derive(Debug, Clone, Copy, Default)]
pub struct CategoricalCrossentropy;

impl Loss for CategoricalCrossentropy {
    fn name(&self) -> &'static str {
        "categorical_crossentropy"
    }

    fn compute(&self, y_true: ArrayView2<'_, f32>, y_pred: ArrayView2<'_, f32>)
        -> Result<Array1<f32>, LossError>
    {
        check_batch(y_true, y_pred)?;
        let probs = normalize_and_clip(y_pred);
        Ok((&y_true * &probs.mapv(f32::ln)).sum_axis(Axis(1)).mapv(|v| -v))
    }

    fn gradient(&self, y_true: ArrayView2<'_, f32>, y_pred: ArrayView2<'_, f32>)
        -> Result<Array2<f32>, LossError>
    {
        check_batch(y_true, y_pred)?;
        let ones = Array1::ones(y_true.ncols());
        Ok(weighted_gradient(y_true, y_pred, &ones))
    }
}

/// Categorical cross-entropy with a fixed per-class weight vector.
///
/// For each sample the predicted probabilities are renormalized to sum to
/// one, clipped into `[EPSILON, 1 - EPSILON]`, and the loss is
/// `-sum_c(y_true[c] * ln(y_pred[c]) * weights[c])`.
///
/// ```
/// use finetune::loss::{make_weighted_loss, Loss};
/// use ndarray::array;
///
/// let loss = make_weighted_loss(vec![1.0, 6.0, 6.0, 13.0, 13.0]).unwrap();
/// let y_true = array![[0.0, 1.0, 0.0, 0.0, 0.0]];
/// let y_pred = array![[0.1, 0.6, 0.1, 0.1, 0.1]];
/// let values = loss.compute(y_true.view(), y_pred.view()).unwrap();
/// assert!((values[0] - 6.0 * -(0.6f32.ln())).abs() < 1e-5);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedCategoricalCrossentropy {
    weights: Array1<f32>,
}

/// Builds a weighted categorical cross-entropy over `weights`.
///
/// # Errors
/// - `InvalidWeights` if `weights` is empty or holds a non-finite or
///   non-positive value
pub fn make_weighted_loss(weights: impl Into<Vec<f32>>) -> Result<WeightedCategoricalCrossentropy, LossError> {
    WeightedCategoricalCrossentropy::new(weights)
}

impl WeightedCategoricalCrossentropy {
    pub fn new(weights: impl Into<Vec<f32>>) -> Result<Self, LossError> {
        let weights = weights.into();
        if weights.is_empty() {
            return Err(LossError::InvalidWeights("weight vector cannot be empty".into()));
        }
        if let Some(pos) = weights.iter().position(|w| !w.is_finite() || *w <= 0.0) {
            return Err(LossError::InvalidWeights(format!(
                "weight {} must be a positive finite number, got {}",
                pos, weights[pos]
            )));
        }
        Ok(Self { weights: Array1::from(weights) })
    }

    pub fn weights(&self) -> &Array1<f32> {
        &self.weights
    }

    pub fn num_classes(&self) -> usize {
        self.weights.len()
    }

    fn check_weights(&self, classes: usize) -> Result<(), LossError> {
        if self.weights.len() != classes {
            return Err(LossError::ShapeMismatch {
                what: "class weight vector",
                expected: format!("{} classes", classes),
                actual: format!("{} weights", self.weights.len()),
            });
        }
        Ok(())
    }
}

impl Loss for WeightedCategoricalCrossentropy {
    fn name(&self) -> &'static str {
        "weighted_categorical_crossentropy"
    }

    fn compute(&self, y_true: ArrayView2<'_, f32>, y_pred: ArrayView2<'_, f32>)
        -> Result<Array1<f32>, LossError>
    {
        check_batch(y_true, y_pred)?;
        self.check_weights(y_true.ncols())?;
        let probs = normalize_and_clip(y_pred);
        let terms = &y_true * &probs.mapv(f32::ln) * &self.weights;
        Ok(terms.sum_axis(Axis(1)).mapv(|v| -v))
    }

    fn gradient(&self, y_true: ArrayView2<'_, f32>, y_pred: ArrayView2<'_, f32>)
        -> Result<Array2<f32>, LossError>
    {
        check_batch(y_true, y_pred)?;
        self.check_weights(y_true.ncols())?;
        Ok(weighted_gradient(y_true, y_pred, &self.weights))
    }
}

fn check_batch(y_true: ArrayView2<'_, f32>, y_pred: ArrayView2<'_, f32>) -> Result<(), LossError> {
    if y_true.dim() != y_pred.dim() {
        return Err(LossError::ShapeMismatch {
            what: "y_pred",
            expected: format!("{:?}", y_true.dim()),
            actual: format!("{:?}", y_pred.dim()),
        });
    }
    Ok(())
}

fn row_sums(y_pred: ArrayView2<'_, f32>) -> Array1<f32> {
    y_pred.sum_axis(Axis(1)).mapv(|s| s.max(EPSILON))
}

/// Divides each row by its sum, then clips into `[EPSILON, 1 - EPSILON]`.
pub fn normalize_and_clip(y_pred: ArrayView2<'_, f32>) -> Array2<f32> {
    let sums = row_sums(y_pred).insert_axis(Axis(1));
    (&y_pred / &sums).mapv(|p| p.clamp(EPSILON, 1.0 - EPSILON))
}

/// Gradient of `-sum_c a_c ln(clip(p_c / S))` with `a_c = w_c * y_c` and
/// `S = sum_c p_c`. Classes whose normalized probability was clipped
/// contribute nothing.
fn weighted_gradient(y_true: ArrayView2<'_, f32>, y_pred: ArrayView2<'_, f32>, weights: &Array1<f32>) -> Array2<f32> {
    let sums = row_sums(y_pred);
    let mut grad = Array2::zeros(y_pred.dim());
    for (i, mut row) in grad.axis_iter_mut(Axis(0)).enumerate() {
        let s = sums[i];
        let mut shared = 0.0f32;
        let mut direct = vec![0.0f32; row.len()];
        for c in 0..row.len() {
            let p = y_pred[[i, c]];
            let q = p / s;
            if q <= EPSILON || q >= 1.0 - EPSILON {
                continue;
            }
            let a = weights[c] * y_true[[i, c]];
            shared += a / s;
            direct[c] = -a / p;
        }
        for (g, d) in row.iter_mut().zip(direct) {
            *g = d + shared;
        }
    }
    grad
}

/// Fraction of samples whose arg-max prediction matches the arg-max label.
pub fn categorical_accuracy(y_true: ArrayView2<'_, f32>, y_pred: ArrayView2<'_, f32>) -> Result<f32, LossError> {
    check_batch(y_true, y_pred)?;
    if y_true.nrows() == 0 {
        return Ok(0.0);
    }
    let correct = y_true
        .axis_iter(Axis(0))
        .zip(y_pred.axis_iter(Axis(0)))
        .filter(|(t, p)| argmax(t.iter()) == argmax(p.iter()))
        .count();
    Ok(correct as f32 / y_true.nrows() as f32)
}

pub(crate) fn argmax<'a>(values: impl Iterator<Item = &'a f32>) -> Option<usize> {
    values
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
}

/// Per-class weight vectors for imbalanced data.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassWeights(Vec<f32>);

impl ClassWeights {
    /// Inverse-frequency weights `total / (C * count_c)`.
    ///
    /// # Errors
    /// - `InvalidWeights` if `counts` is empty or any class has no samples
    pub fn balanced(counts: &[usize]) -> Result<Self, LossError> {
        if counts.is_empty() {
            return Err(LossError::InvalidWeights("class counts cannot be empty".into()));
        }
        if let Some(pos) = counts.iter().position(|&c| c == 0) {
            return Err(LossError::InvalidWeights(format!("class {} has no samples", pos)));
        }
        let total: usize = counts.iter().sum();
        let classes = counts.len() as f32;
        Ok(Self(counts.iter().map(|&c| total as f32 / (classes * c as f32)).collect()))
    }

    /// The hand-tuned weights used for the five-class retinal grading data.
    pub fn reference() -> Self {
        Self(vec![1.0, 6.0, 6.0, 13.0, 13.0])
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn into_loss(self) -> Result<WeightedCategoricalCrossentropy, LossError> {
        make_weighted_loss(self.0)
    }
}

impl From<ClassWeights> for Vec<f32> {
    fn from(weights: ClassWeights) -> Self {
        weights.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_weighted_matches_manual() {
        let loss = make_weighted_loss(vec![2.0, 1.0, 0.5]).unwrap();
        let y_true = array![[0.0, 1.0, 0.0], [1.0, 0.0, 0.0]];
        let y_pred = array![[0.1, 0.6, 0.3], [0.8, 0.1, 0.1]];
        let values = loss.compute(y_true.view(), y_pred.view()).unwrap();
        assert!((values[0] - -(0.6f32.ln())).abs() < 1e-6);
        assert!((values[1] - 2.0 * -(0.8f32.ln())).abs() < 1e-6);
    }

    #[test]
    fn test_soft_labels() {
        let loss = make_weighted_loss(vec![1.0, 3.0]).unwrap();
        let y_true = array![[0.5, 0.5]];
        let y_pred = array![[0.5, 0.5]];
        let values = loss.compute(y_true.view(), y_pred.view()).unwrap();
        let expected = -(0.5 * 0.5f32.ln() * 1.0 + 0.5 * 0.5f32.ln() * 3.0);
        assert!((values[0] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_all_zero_row_is_finite() {
        let loss = make_weighted_loss(vec![1.0; 3]).unwrap();
        let y_true = array![[1.0, 0.0, 0.0]];
        let y_pred = array![[0.0, 0.0, 0.0]];
        let values = loss.compute(y_true.view(), y_pred.view()).unwrap();
        assert!(values[0].is_finite());
    }

    #[test]
    fn test_rejects_bad_weights() {
        assert!(matches!(make_weighted_loss(Vec::<f32>::new()), Err(LossError::InvalidWeights(_))));
        assert!(matches!(make_weighted_loss(vec![1.0, 0.0]), Err(LossError::InvalidWeights(_))));
        assert!(matches!(make_weighted_loss(vec![1.0, f32::NAN]), Err(LossError::InvalidWeights(_))));
    }

    #[test]
    fn test_weight_length_mismatch() {
        let loss = make_weighted_loss(vec![1.0, 2.0]).unwrap();
        let y_true = array![[1.0, 0.0, 0.0]];
        let y_pred = array![[0.5, 0.25, 0.25]];
        assert!(matches!(
            loss.compute(y_true.view(), y_pred.view()),
            Err(LossError::ShapeMismatch { what: "class weight vector", .. })
        ));
    }

    #[test]
    fn test_batch_shape_mismatch() {
        let y_true = array![[1.0, 0.0]];
        let y_pred = array![[0.5, 0.25, 0.25]];
        assert!(CategoricalCrossentropy.compute(y_true.view(), y_pred.view()).is_err());
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let loss = make_weighted_loss(vec![1.0, 4.0, 2.0]).unwrap();
        let y_true = array![[0.2, 0.7, 0.1]];
        let y_pred = array![[0.3, 0.5, 0.4]];
        let grad = loss.gradient(y_true.view(), y_pred.view()).unwrap();

        let h = 1e-3f32;
        for j in 0..3 {
            let mut plus = y_pred.clone();
            plus[[0, j]] += h;
            let mut minus = y_pred.clone();
            minus[[0, j]] -= h;
            let lp = loss.compute(y_true.view(), plus.view()).unwrap()[0];
            let lm = loss.compute(y_true.view(), minus.view()).unwrap()[0];
            let numeric = (lp - lm) / (2.0 * h);
            assert!(
                (numeric - grad[[0, j]]).abs() < 1e-2,
                "class {}: numeric {} vs analytic {}",
                j, numeric, grad[[0, j]]
            );
        }
    }

    #[test]
    fn test_accuracy() {
        let y_true = array![[1.0, 0.0], [0.0, 1.0], [0.0, 1.0]];
        let y_pred = array![[0.9, 0.1], [0.2, 0.8], [0.7, 0.3]];
        let acc = categorical_accuracy(y_true.view(), y_pred.view()).unwrap();
        assert!((acc - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_balanced_weights() {
        let weights = ClassWeights::balanced(&[50, 25, 25]).unwrap();
        assert_eq!(weights.as_slice(), &[100.0 / 150.0, 100.0 / 75.0, 100.0 / 75.0]);
        assert!(ClassWeights::balanced(&[10, 0]).is_err());
    }

    #[test]
    fn test_loss_spec_json() {
        let spec = LossSpec::WeightedCategoricalCrossentropy { weights: vec![1.0, 6.0] };
        let json = serde_json::to_string(&spec).unwrap();
        assert_eq!(json, r#"{"type":"weighted_categorical_crossentropy","weights":[1.0,6.0]}"#);
        let back: LossSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
        assert_eq!(back.build().unwrap().name(), "weighted_categorical_crossentropy");
    }
}

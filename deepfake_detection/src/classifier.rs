use crate::labels::Labels;
use ndarray::ArrayViewD;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("ONNX Runtime error: {0}")]
    Ort(#[from] ort::Error),
    #[error("Model returned no class scores")]
    EmptyScores,
    #[error("Model returned non-finite class scores")]
    NonFiniteScores,
    #[error("Model produced no output named {0:?}")]
    MissingOutput(String),
    #[error("Classifier failed: {0}")]
    Backend(String),
}

/// Outcome of one classifier call. Fields are fixed once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionRecord {
    label: String,
    confidence: f32,
    raw_scores: Vec<f32>,
    probabilities: Vec<f32>,
}

impl PredictionRecord {
    pub fn new(label: impl Into<String>, confidence: f32, raw_scores: Vec<f32>) -> Self {
        let probabilities = softmax(&raw_scores);
        Self {
            label: label.into(),
            confidence,
            raw_scores,
            probabilities,
        }
    }

    /// Picks the most probable class of `raw_scores` after a softmax.
    pub fn from_scores(raw_scores: Vec<f32>, labels: &Labels) -> Result<Self, InferenceError> {
        let probabilities = softmax(&raw_scores);
        let index = argmax(&probabilities).ok_or(InferenceError::EmptyScores)?;
        let confidence = probabilities[index];
        if !confidence.is_finite() {
            return Err(InferenceError::NonFiniteScores);
        }

        Ok(Self {
            label: labels.label_for(index),
            confidence,
            raw_scores,
            probabilities,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn raw_scores(&self) -> &[f32] {
        &self.raw_scores
    }

    pub fn probabilities(&self) -> &[f32] {
        &self.probabilities
    }
}

/// Opaque pretrained model: tensor batch in, one prediction out.
///
/// Implementations must not mutate the input and must return the same
/// prediction for the same input and weights. Callers may share one
/// classifier across threads, so implementations serialize access to any
/// non-reentrant model state themselves.
pub trait Classifier: Send + Sync {
    fn classify(&self, input: ArrayViewD<'_, f32>) -> Result<PredictionRecord, InferenceError>;
}

pub fn softmax(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scores.iter().map(|score| (score - max).exp()).collect();
    let sum: f32 = exps.iter().sum();

    exps.into_iter().map(|value| value / sum).collect()
}

/// Index of the largest value; the first one wins on ties.
pub fn argmax(values: &[f32]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .reduce(|best, candidate| {
            if candidate.1.total_cmp(best.1).is_gt() {
                candidate
            } else {
                best
            }
        })
        .map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_output_names_the_output() {
        let err = InferenceError::MissingOutput("probs".to_string());

        assert_eq!(err.to_string(), "Model produced no output named \"probs\"");
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let probabilities = softmax(&[2.0, -1.0, 0.5, 10.0]);

        let sum: f32 = probabilities.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(probabilities.iter().all(|&p| (0.0..=1.0).contains(&p)));
    }

    #[test]
    fn test_softmax_is_stable_for_large_logits() {
        let probabilities = softmax(&[1000.0, 1000.0]);

        assert_eq!(probabilities, vec![0.5, 0.5]);
    }

    #[test]
    fn test_argmax_prefers_first_on_ties() {
        assert_eq!(argmax(&[0.1, 0.7, 0.7]), Some(1));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn test_from_scores_picks_top_class() {
        let labels = Labels::new(vec!["Real".to_string(), "Fake".to_string()]);
        let record = PredictionRecord::from_scores(vec![-1.2, 2.3], &labels).unwrap();

        assert_eq!(record.label(), "Fake");
        let expected = 1.0 / (1.0 + (-3.5f32).exp());
        assert!((record.confidence() - expected).abs() < 1e-6);
        assert_eq!(record.raw_scores(), &[-1.2, 2.3]);
        assert_eq!(record.probabilities().len(), 2);
    }

    #[test]
    fn test_from_scores_rejects_empty_and_nan() {
        let labels = Labels::new(Vec::new());

        assert!(matches!(
            PredictionRecord::from_scores(Vec::new(), &labels),
            Err(InferenceError::EmptyScores)
        ));
        assert!(matches!(
            PredictionRecord::from_scores(vec![f32::NAN, 1.0], &labels),
            Err(InferenceError::NonFiniteScores)
        ));
    }
}

use crate::classifier::PredictionRecord;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregationError {
    #[error("Cannot aggregate an empty prediction set")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateResult {
    pub final_label: String,
    pub confidence: f32,
    pub per_unit_predictions: Vec<PredictionRecord>,
}

/// Majority vote over prediction units (frames or clips).
///
/// The winning label is the most frequent one; on equal counts the label
/// that appeared first in the sequence wins. Confidence is the mean over the
/// units that voted for the winner.
pub fn aggregate(predictions: Vec<PredictionRecord>) -> Result<AggregateResult, AggregationError> {
    let mut tallies: Vec<(&str, usize)> = Vec::new();
    for prediction in &predictions {
        match tallies.iter_mut().find(|(label, _)| *label == prediction.label()) {
            Some((_, count)) => *count += 1,
            None => tallies.push((prediction.label(), 1)),
        }
    }

    let mut winner: Option<(&str, usize)> = None;
    for &(label, count) in &tallies {
        if winner.map_or(true, |(_, best)| count > best) {
            winner = Some((label, count));
        }
    }
    let (final_label, votes) = winner.ok_or(AggregationError::Empty)?;
    let final_label = final_label.to_string();

    let confidence = predictions
        .iter()
        .filter(|prediction| prediction.label() == final_label)
        .map(|prediction| prediction.confidence())
        .sum::<f32>()
        / votes as f32;

    tracing::debug!(
        "Aggregated {} units into {} ({} votes, confidence {:.3})",
        predictions.len(),
        final_label,
        votes,
        confidence
    );

    Ok(AggregateResult {
        final_label,
        confidence,
        per_unit_predictions: predictions,
    })
}

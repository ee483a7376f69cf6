use crate::{
    llm::{ChatClient, ChatMessage, ExplanationServiceError},
    telemetry::Metrics,
};
use deepfake_detection::detector::Detection;
use std::{fmt, sync::Arc};

pub use crate::llm::Intent;

/// How much technical depth the reader asked for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TechnicalLevel {
    Basic,
    #[default]
    Intermediate,
    Expert,
}

impl TechnicalLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TechnicalLevel::Basic => "basic",
            TechnicalLevel::Intermediate => "intermediate",
            TechnicalLevel::Expert => "expert",
        }
    }
}

impl fmt::Display for TechnicalLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for TechnicalLevel {
    fn from(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "basic" => TechnicalLevel::Basic,
            "expert" => TechnicalLevel::Expert,
            _ => TechnicalLevel::Intermediate,
        }
    }
}

pub fn analysis_prompt(detection: &Detection, filename: &str, level: TechnicalLevel) -> String {
    let classification = if detection.label.eq_ignore_ascii_case("fake") {
        "DEEPFAKE DETECTED"
    } else {
        "AUTHENTIC CONTENT"
    };

    let methods = if detection.artifacts.is_empty() {
        "None detected".to_string()
    } else {
        detection
            .artifacts
            .iter()
            .map(|artifact| artifact.kind.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };

    let findings = if detection.artifacts.is_empty() {
        "No artifacts to report.".to_string()
    } else {
        detection
            .artifacts
            .iter()
            .map(|artifact| format!("{}: {:.1}%", artifact.kind, artifact.score))
            .collect::<Vec<_>>()
            .join("; ")
    };

    format!(
        "Analysis Results for \"{filename}\":\n\
         - Classification: {classification}\n\
         - Confidence Score: {confidence:.1}%\n\
         - Detection Methods: {methods}\n\
         - Key Findings: {findings}\n\n\
         User Technical Level: {level}\n\n\
         Generate a professional forensic analysis report explaining these findings. Include:\n\
         1. Executive summary\n\
         2. Explanation of detection methods used\n\
         3. Key evidence found\n\
         4. Confidence assessment\n\
         5. Recommendations\n\n\
         Adapt the technical depth to the user's level: {level}.",
        confidence = detection.confidence * 100.0,
    )
}

/// Turns detections and chat messages into prose. Never fails: any service
/// error is logged and replaced by the intent's fallback text.
pub struct Explainer {
    client: ChatClient,
    metrics: Arc<Metrics>,
}

impl Explainer {
    pub fn new(client: ChatClient, metrics: Arc<Metrics>) -> Self {
        Self { client, metrics }
    }

    pub async fn explain(&self, detection: &Detection, filename: &str, level: TechnicalLevel) -> String {
        let prompt = analysis_prompt(detection, filename, level);
        self.respond(&prompt, Intent::Analysis, &[]).await
    }

    pub async fn respond(&self, message: &str, intent: Intent, context: &[ChatMessage]) -> String {
        let result = self.client.complete(intent, context, message).await;
        self.or_fallback(result, intent)
    }

    fn or_fallback(&self, result: Result<String, ExplanationServiceError>, intent: Intent) -> String {
        match result {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("Explanation service unavailable ({}), using fallback for {}", e, intent.as_str());
                self.metrics.record_fallback(intent.as_str());
                intent.fallback().to_string()
            }
        }
    }
}

use crate::config::LlmConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::instrument;

/// Number of earlier messages forwarded with each request.
pub const CONTEXT_WINDOW: usize = 6;

#[derive(Error, Debug)]
pub enum ExplanationServiceError {
    #[error("No API key configured")]
    MissingApiKey,
    #[error("Request timed out")]
    Timeout,
    #[error("Request failed: {0}")]
    Transport(reqwest::Error),
    #[error("Service responded with status {0}")]
    Status(u16),
    #[error("Malformed response body: {0}")]
    Malformed(reqwest::Error),
    #[error("Response contained no completion")]
    EmptyCompletion,
}

impl From<reqwest::Error> for ExplanationServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExplanationServiceError::Timeout
        } else {
            ExplanationServiceError::Transport(err)
        }
    }
}

/// What the caller wants from the text-generation service. Selects the
/// system role and the canned reply used when the service is unavailable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Intent {
    Analysis,
    Educational,
    #[default]
    Conversational,
    ThreatAnalysis,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Analysis => "analysis",
            Intent::Educational => "educational",
            Intent::Conversational => "conversational",
            Intent::ThreatAnalysis => "threat_analysis",
        }
    }

    pub fn system_prompt(&self) -> &'static str {
        match self {
            Intent::Analysis => "You are DeepShield AI, a forensic expert in deepfake detection. Provide detailed, professional analysis of detection results in clear, educational language.",
            Intent::Educational => "You are DeepShield AI, an expert educator in AI security and deepfake detection. Explain complex concepts clearly and adapt to the user's technical level.",
            Intent::Conversational => "You are DeepShield AI, a helpful AI security expert. Provide professional yet approachable responses about deepfakes, AI security, and digital forensics.",
            Intent::ThreatAnalysis => "You are DeepShield AI, a cybersecurity expert specializing in deepfake threats. Provide comprehensive threat landscape analysis.",
        }
    }

    pub fn fallback(&self) -> &'static str {
        match self {
            Intent::Analysis => "Based on multi-method forensic analysis, this content shows the indicated confidence level for authenticity assessment.",
            Intent::Educational => "Advanced computer vision and ML techniques were used, including facial landmarks, texture patterns, and frequency-based filters.",
            Intent::Conversational => "I'm DeepShield AI, your assistant in spotting and explaining deepfakes. Ask me anything about media security!",
            Intent::ThreatAnalysis => "Deepfakes pose threats to democracy, finance, and individual safety. Early detection is vital to protect digital ecosystems.",
        }
    }
}

impl From<&str> for Intent {
    /// Unknown names map to [`Intent::Conversational`].
    fn from(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "analysis" => Intent::Analysis,
            "educational" => Intent::Educational,
            "threat_analysis" => Intent::ThreatAnalysis,
            _ => Intent::Conversational,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// System role, the last [`CONTEXT_WINDOW`] context messages, then the prompt.
pub fn build_messages(intent: Intent, context: &[ChatMessage], prompt: &str) -> Vec<ChatMessage> {
    let recent = &context[context.len().saturating_sub(CONTEXT_WINDOW)..];

    std::iter::once(ChatMessage::new(Role::System, intent.system_prompt()))
        .chain(recent.iter().cloned())
        .chain(std::iter::once(ChatMessage::new(Role::User, prompt)))
        .collect()
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// Client for an OpenAI-compatible `chat/completions` endpoint. One attempt
/// per call, bounded by the configured timeout.
#[derive(Debug, Clone)]
pub struct ChatClient {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl ChatClient {
    pub fn new(config: &LlmConfig) -> Result<Self, ExplanationServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(ExplanationServiceError::Transport)?;

        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    #[instrument(skip(self, context, prompt), fields(intent = intent.as_str()))]
    pub async fn complete(
        &self,
        intent: Intent,
        context: &[ChatMessage],
        prompt: &str,
    ) -> Result<String, ExplanationServiceError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(ExplanationServiceError::MissingApiKey)?;

        let body = CompletionRequest {
            model: &self.model,
            messages: build_messages(intent, context, prompt),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExplanationServiceError::Status(status.as_u16()));
        }

        let completion: CompletionResponse = response.json().await.map_err(|err| {
            if err.is_timeout() {
                ExplanationServiceError::Timeout
            } else {
                ExplanationServiceError::Malformed(err)
            }
        })?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(ExplanationServiceError::EmptyCompletion)
    }
}

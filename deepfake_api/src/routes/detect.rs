use crate::{explanation::TechnicalLevel, server::SharedState};
use axum::{
    body::Bytes,
    extract::{
        multipart::{MultipartError, MultipartRejection},
        Multipart, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use deepfake_detection::detector::{Detection, DetectionError, MediaKind};
use serde::Serialize;
use serde_json::json;
use std::time::Instant;
use thiserror::Error;
use tracing::instrument;

const DEFAULT_FILENAME: &str = "uploaded_file";

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("No file uploaded")]
    NoFile,
    #[error("Unsupported file type")]
    UnsupportedFileType,
    #[error("Invalid multipart body: {0}")]
    Multipart(#[from] MultipartError),
    #[error("{0}")]
    Detection(#[from] DetectionError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NoFile
            | ApiError::UnsupportedFileType
            | ApiError::Detection(DetectionError::UnsupportedMediaType(_)) => StatusCode::BAD_REQUEST,
            ApiError::Multipart(err) => err.status(),
            ApiError::Detection(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = match &self {
            ApiError::Detection(DetectionError::UnsupportedMediaType(_)) => {
                ApiError::UnsupportedFileType.to_string()
            }
            other => other.to_string(),
        };

        if status.is_server_error() {
            tracing::error!("Request failed: {}", message);
        } else {
            tracing::warn!("Rejected request: {}", message);
        }

        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// A detection, optionally followed by its prose explanation.
#[derive(Debug, Serialize)]
pub struct DetectionResponse {
    #[serde(flatten)]
    pub detection: Detection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

struct Upload {
    bytes: Bytes,
    content_type: String,
    filename: String,
    technical_level: TechnicalLevel,
}

/// A request that is not multipart at all is treated like one without a file.
async fn read_upload(multipart: Result<Multipart, MultipartRejection>) -> Result<Upload, ApiError> {
    let mut multipart = multipart.map_err(|_| ApiError::NoFile)?;
    let mut file: Option<(Bytes, String, String)> = None;
    let mut technical_level = TechnicalLevel::default();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let content_type = field.content_type().unwrap_or_default().to_string();
                let filename = field.file_name().unwrap_or(DEFAULT_FILENAME).to_string();
                let bytes = field.bytes().await?;
                file = Some((bytes, content_type, filename));
            }
            "technical_level" => {
                technical_level = TechnicalLevel::from(field.text().await?.as_str());
            }
            _ => {}
        }
    }

    let (bytes, content_type, filename) = file.ok_or(ApiError::NoFile)?;
    if MediaKind::from_mime(&content_type).is_none() {
        return Err(ApiError::UnsupportedFileType);
    }

    Ok(Upload {
        bytes,
        content_type,
        filename,
        technical_level,
    })
}

async fn run_detection(state: &SharedState, upload: &Upload) -> Result<Detection, ApiError> {
    let detector = state.detector.clone();
    let bytes = upload.bytes.clone();
    let mime = upload.content_type.clone();

    let started = Instant::now();
    let detection = tokio::task::spawn_blocking(move || detector.detect_upload(&bytes, &mime))
        .await
        .unwrap_or_else(|err| Err(DetectionError::TaskFailed(err.to_string())))?;

    let elapsed_ms = started.elapsed().as_millis() as u64;
    tracing::info!(
        "Detected {} as {} ({:.3}) in {}ms",
        upload.filename,
        detection.label,
        detection.confidence,
        elapsed_ms
    );
    state
        .metrics
        .record_detection(detection.media.as_str(), &detection.label, elapsed_ms);

    Ok(detection)
}

#[instrument(skip(state, multipart))]
pub async fn detect(
    State(state): State<SharedState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<DetectionResponse>, ApiError> {
    state.metrics.record_request("/api/detect");

    let upload = read_upload(multipart).await?;
    let detection = run_detection(&state, &upload).await?;

    Ok(Json(DetectionResponse {
        detection,
        explanation: None,
    }))
}

#[instrument(skip(state, multipart))]
pub async fn agent_detect(
    State(state): State<SharedState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<DetectionResponse>, ApiError> {
    state.metrics.record_request("/api/agent-detect");

    let upload = read_upload(multipart).await?;
    let detection = run_detection(&state, &upload).await?;
    let explanation = state
        .explainer
        .explain(&detection, &upload.filename, upload.technical_level)
        .await;

    Ok(Json(DetectionResponse {
        detection,
        explanation: Some(explanation),
    }))
}

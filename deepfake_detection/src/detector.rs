use crate::{
    aggregate::{aggregate, AggregateResult, AggregationError},
    classifier::{Classifier, InferenceError, PredictionRecord},
    config::{DecoderKind, DetectorConfig, Granularity},
    decoder::{decode_image, DecodeError, FfmpegDecoder, VideoDecoder},
    frame::FrameBatch,
    ort_service::{ModelLoadError, OrtClassifier},
    preprocess::Preprocessor,
    sampler::FrameSampler,
};
use serde::Serialize;
use std::{io::Write, path::Path, sync::Arc};
use thiserror::Error;
use tracing::instrument;

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp"];
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "webm"];

#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("Unsupported file type: {0}")]
    UnsupportedMediaType(String),
    #[error("Decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("Inference failed: {0}")]
    Inference(#[from] InferenceError),
    #[error("Aggregation failed: {0}")]
    Aggregation(#[from] AggregationError),
    #[error("Failed to build input tensor: {0}")]
    Tensor(#[from] ndarray::ShapeError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Detection task failed: {0}")]
    TaskFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn from_mime(mime: &str) -> Option<Self> {
        let mime = mime.trim().to_ascii_lowercase();
        if mime.starts_with("image/") {
            Some(Self::Image)
        } else if mime.starts_with("video/") {
            Some(Self::Video)
        } else {
            None
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        if IMAGE_EXTENSIONS.contains(&extension.as_str()) {
            Some(Self::Image)
        } else if VIDEO_EXTENSIONS.contains(&extension.as_str()) {
            Some(Self::Video)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }

    fn artifact_type(&self) -> &'static str {
        match self {
            MediaKind::Image => "face_texture",
            MediaKind::Video => "frame_consistency",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Artifact {
    #[serde(rename = "type")]
    pub kind: String,
    /// Percentage in `[0, 100]`.
    pub score: f32,
}

/// Final verdict for one image or video.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    #[serde(rename = "type")]
    pub media: MediaKind,
    pub label: String,
    pub confidence: f32,
    pub artifacts: Vec<Artifact>,
    pub predictions: Vec<PredictionRecord>,
}

impl Detection {
    pub fn new(media: MediaKind, result: AggregateResult) -> Self {
        let artifacts = vec![Artifact {
            kind: media.artifact_type().to_string(),
            score: result.confidence * 100.0,
        }];

        Self {
            media,
            label: result.final_label,
            confidence: result.confidence,
            artifacts,
            predictions: result.per_unit_predictions,
        }
    }
}

/// A classifier together with the preprocessing its inputs need.
#[derive(Clone)]
pub struct ModelHandle {
    pub model: Arc<dyn Classifier>,
    pub preprocessor: Preprocessor,
}

impl ModelHandle {
    pub fn new(model: Arc<dyn Classifier>, preprocessor: Preprocessor) -> Self {
        Self {
            model,
            preprocessor,
        }
    }
}

/// Runs the sample, preprocess, infer, aggregate pipeline.
///
/// Built once at startup and shared by reference; every call is
/// synchronous and keeps the frame order of its input.
pub struct Detector {
    image: ModelHandle,
    video: ModelHandle,
    decoder: Arc<dyn VideoDecoder>,
    sampler: FrameSampler,
    granularity: Granularity,
}

impl Detector {
    pub fn new(
        image: ModelHandle,
        video: ModelHandle,
        decoder: Arc<dyn VideoDecoder>,
        sampler: FrameSampler,
        granularity: Granularity,
    ) -> Self {
        Self {
            image,
            video,
            decoder,
            sampler,
            granularity,
        }
    }

    /// Loads both ONNX models. The ONNX Runtime environment must already be
    /// initialized.
    pub fn from_config(config: &DetectorConfig) -> Result<Self, ModelLoadError> {
        let image = ModelHandle::new(
            Arc::new(OrtClassifier::new(&config.image_model)?),
            Preprocessor::from_config(&config.image_model),
        );
        let video = ModelHandle::new(
            Arc::new(OrtClassifier::new(&config.video_model)?),
            Preprocessor::from_config(&config.video_model),
        );

        // Video frames are decoded straight to the input size of the model
        // that will consume them.
        let (height, width) = match config.video.granularity {
            Granularity::Clip => video.preprocessor.dimensions(),
            Granularity::Frame => image.preprocessor.dimensions(),
        };
        let decoder: Arc<dyn VideoDecoder> = match config.video.decoder {
            DecoderKind::Ffmpeg => Arc::new(FfmpegDecoder::new(
                &config.video.ffmpeg_path,
                &config.video.ffprobe_path,
                width,
                height,
            )),
            #[cfg(feature = "opencv")]
            DecoderKind::Opencv => Arc::new(crate::decoder::OpenCvDecoder),
        };

        tracing::info!(
            "Detector ready: {} frames per video, {:?} granularity, {:?} decoder",
            config.video.num_frames,
            config.video.granularity,
            config.video.decoder
        );

        Ok(Self::new(
            image,
            video,
            decoder,
            FrameSampler::new(config.video.num_frames),
            config.video.granularity,
        ))
    }

    #[instrument(skip(self, bytes), fields(bytes = bytes.len()))]
    pub fn detect_image(&self, bytes: &[u8]) -> Result<Detection, DetectionError> {
        let frame = decode_image(bytes)?;
        let input = self.image.preprocessor.image_tensor(&frame);
        let prediction = self.image.model.classify(input.view().into_dyn())?;

        Ok(Detection::new(MediaKind::Image, aggregate(vec![prediction])?))
    }

    #[instrument(skip(self))]
    pub fn detect_video_path(&self, path: &Path) -> Result<Detection, DetectionError> {
        let batch = self.sampler.sample_video(self.decoder.as_ref(), path)?;
        self.classify_batch(&batch)
    }

    /// Spills the upload to a temporary file so the decoder can seek in it.
    #[instrument(skip(self, bytes), fields(bytes = bytes.len()))]
    pub fn detect_video_bytes(&self, bytes: &[u8], suffix: &str) -> Result<Detection, DetectionError> {
        let mut file = tempfile::Builder::new()
            .prefix("upload-")
            .suffix(suffix)
            .tempfile()?;
        file.write_all(bytes)?;
        file.flush()?;

        self.detect_video_path(file.path())
    }

    /// Dispatches an upload on its MIME type.
    pub fn detect_upload(&self, bytes: &[u8], mime: &str) -> Result<Detection, DetectionError> {
        match MediaKind::from_mime(mime) {
            Some(MediaKind::Image) => self.detect_image(bytes),
            Some(MediaKind::Video) => self.detect_video_bytes(bytes, video_suffix(mime)),
            None => Err(DetectionError::UnsupportedMediaType(mime.to_string())),
        }
    }

    /// Dispatches a file on its extension.
    pub fn detect_path(&self, path: &Path) -> Result<Detection, DetectionError> {
        match MediaKind::from_path(path) {
            Some(MediaKind::Image) => self.detect_image(&std::fs::read(path)?),
            Some(MediaKind::Video) => self.detect_video_path(path),
            None => Err(DetectionError::UnsupportedMediaType(path.display().to_string())),
        }
    }

    fn classify_batch(&self, batch: &FrameBatch) -> Result<Detection, DetectionError> {
        let predictions = match self.granularity {
            Granularity::Clip => {
                let input = self.video.preprocessor.clip_tensor(batch)?;
                vec![self.video.model.classify(input.view().into_dyn())?]
            }
            Granularity::Frame => batch
                .iter()
                .map(|frame| {
                    let input = self.image.preprocessor.image_tensor(frame);
                    self.image.model.classify(input.view().into_dyn())
                })
                .collect::<Result<Vec<_>, _>>()?,
        };

        Ok(Detection::new(MediaKind::Video, aggregate(predictions)?))
    }
}

fn video_suffix(mime: &str) -> &'static str {
    let subtype = mime
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    match subtype.as_str() {
        "video/quicktime" => ".mov",
        "video/x-msvideo" | "video/avi" => ".avi",
        "video/webm" => ".webm",
        "video/x-matroska" => ".mkv",
        _ => ".mp4",
    }
}

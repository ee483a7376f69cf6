use crate::frame::ChannelOrder;
use serde::{de::DeserializeOwned, Deserialize};
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub detector: DetectorConfig,
    pub batch: BatchConfig,
}

pub fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

pub trait Validatable {
    fn validate(&self) -> Result<(), String>;
}

#[derive(Debug, Deserialize, Clone)]
pub struct DetectorConfig {
    pub image_model: ModelConfig,
    pub video_model: ModelConfig,
    #[serde(default)]
    pub video: VideoConfig,
}

impl Validatable for DetectorConfig {
    fn validate(&self) -> Result<(), String> {
        self.image_model.validate()?;
        self.video_model.validate()?;
        self.video.validate()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    pub onnx_file: String,
    pub model_dir: PathBuf,
    pub labels_file: String,
    #[serde(default = "default_model_instances")]
    pub num_instances: usize,
    #[serde(default = "default_output_name")]
    pub output_name: String,
    pub height: u32,
    pub width: u32,
    #[serde(default = "default_image_stat")]
    pub image_mean: [f32; 3],
    #[serde(default = "default_image_stat")]
    pub image_std: [f32; 3],
    #[serde(default)]
    pub channel_order: ChannelOrder,
}

fn default_model_instances() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}

fn default_output_name() -> String {
    "logits".to_string()
}

fn default_image_stat() -> [f32; 3] {
    [0.5, 0.5, 0.5]
}

impl ModelConfig {
    pub fn get_path(&self) -> PathBuf {
        self.model_dir.join(&self.onnx_file)
    }

    pub fn get_labels_path(&self) -> PathBuf {
        self.model_dir.join(&self.labels_file)
    }
}

impl Validatable for ModelConfig {
    fn validate(&self) -> Result<(), String> {
        if !self.get_path().exists() {
            return Err(format!("Model file not found: {:?}", self.get_path()));
        }
        if !self.get_labels_path().exists() {
            return Err(format!("Labels file not found: {:?}", self.get_labels_path()));
        }
        if self.num_instances == 0 {
            return Err("num_instances must be at least 1".to_string());
        }
        if self.height == 0 || self.width == 0 {
            return Err(format!(
                "Invalid model resolution {}x{}",
                self.height, self.width
            ));
        }
        if self.image_std.iter().any(|&std| std == 0.0 || !std.is_finite()) {
            return Err(format!("Invalid image_std {:?}", self.image_std));
        }
        Ok(())
    }
}

/// How a video is split into prediction units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// All sampled frames go through the video model as one clip.
    #[default]
    Clip,
    /// Every sampled frame goes through the image model on its own.
    Frame,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoderKind {
    #[default]
    Ffmpeg,
    #[cfg(feature = "opencv")]
    Opencv,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VideoConfig {
    #[serde(default = "default_num_frames")]
    pub num_frames: usize,
    #[serde(default)]
    pub granularity: Granularity,
    #[serde(default)]
    pub decoder: DecoderKind,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: PathBuf,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            num_frames: default_num_frames(),
            granularity: Granularity::default(),
            decoder: DecoderKind::default(),
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
        }
    }
}

fn default_num_frames() -> usize {
    16
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_path() -> PathBuf {
    PathBuf::from("ffprobe")
}

impl Validatable for VideoConfig {
    fn validate(&self) -> Result<(), String> {
        if self.num_frames == 0 {
            return Err("video.num_frames must be at least 1".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BatchConfig {
    pub input_dir: PathBuf,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "default_output_file")]
    pub output_file: PathBuf,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_extensions() -> Vec<String> {
    vec!["mp4".to_string()]
}

fn default_output_file() -> PathBuf {
    PathBuf::from("deepfake_results.json")
}

fn default_max_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

/// Layers `configuration/base.yaml`, the `APP_ENVIRONMENT` file and
/// `<env_prefix>_*` environment variables (`__` separates nested keys).
pub fn load_configuration<T: DeserializeOwned>(env_prefix: &str) -> Result<T, config::ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| config::ConfigError::Message(format!("Failed to determine the current directory: {}", e)))?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(config::File::from(
            configuration_directory.join(format!("{}.yaml", environment.as_str())),
        ))
        .add_source(
            config::Environment::with_prefix(env_prefix)
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    config.try_deserialize::<T>()
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let config: Config = load_configuration("DFD")?;

    if let Err(e) = config.detector.validate() {
        tracing::error!("Configuration validation failed: {}", e);
        return Err(config::ConfigError::Message(e));
    }

    Ok(config)
}

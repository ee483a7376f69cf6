mod app;

pub mod aggregate;
pub mod batch;
pub mod classifier;
pub mod config;
pub mod decoder;
pub mod detector;
pub mod frame;
pub mod labels;
pub mod ort_service;
pub mod preprocess;
pub mod sampler;

pub use app::start_batch;

use crate::{
    config::ModelConfig,
    frame::{ChannelOrder, Frame, FrameBatch},
};
use image::{imageops::FilterType, DynamicImage};
use ndarray::{Array3, Array4, Array5, Axis};

/// Converts frames into the normalized, channel-first tensors a model expects.
#[derive(Debug, Clone, PartialEq)]
pub struct Preprocessor {
    height: u32,
    width: u32,
    mean: [f32; 3],
    std: [f32; 3],
    channel_order: ChannelOrder,
}

impl Preprocessor {
    pub fn new(
        height: u32,
        width: u32,
        mean: [f32; 3],
        std: [f32; 3],
        channel_order: ChannelOrder,
    ) -> Self {
        Self {
            height,
            width,
            mean,
            std,
            channel_order,
        }
    }

    pub fn from_config(model_config: &ModelConfig) -> Self {
        Self::new(
            model_config.height,
            model_config.width,
            model_config.image_mean,
            model_config.image_std,
            model_config.channel_order,
        )
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.height, self.width)
    }

    /// `(3, H, W)` tensor holding `(value / 255 - mean_c) / std_c`.
    ///
    /// The frame is scaled to `[0, 1]` first and then resized to exactly
    /// `(H, W)` without cropping, so the aspect ratio is not preserved.
    pub fn frame_tensor(&self, frame: &Frame) -> Array3<f32> {
        let pixels = DynamicImage::ImageRgb8(frame.to_order(self.channel_order)).into_rgb32f();
        let pixels = if pixels.dimensions() == (self.width, self.height) {
            pixels
        } else {
            image::imageops::resize(&pixels, self.width, self.height, FilterType::Triangle)
        };

        let mut tensor = Array3::zeros((3, self.height as usize, self.width as usize));
        for (x, y, pixel) in pixels.enumerate_pixels() {
            for channel in 0..3 {
                tensor[[channel, y as usize, x as usize]] =
                    (pixel.0[channel] - self.mean[channel]) / self.std[channel];
            }
        }

        tensor
    }

    /// `(1, 3, H, W)` input for single-image models.
    pub fn image_tensor(&self, frame: &Frame) -> Array4<f32> {
        self.frame_tensor(frame).insert_axis(Axis(0))
    }

    /// `(1, N, 3, H, W)` input for clip models, frames kept in batch order.
    pub fn clip_tensor(&self, batch: &FrameBatch) -> Result<Array5<f32>, ndarray::ShapeError> {
        let tensors: Vec<Array3<f32>> = batch.iter().map(|frame| self.frame_tensor(frame)).collect();
        let views: Vec<_> = tensors.iter().map(|tensor| tensor.view()).collect();
        let stacked = ndarray::stack(Axis(0), &views)?;

        Ok(stacked.insert_axis(Axis(0)))
    }
}

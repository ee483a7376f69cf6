use image::RgbImage;
use serde::Deserialize;

/// Order in which the three color channels of a decoded frame are stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    #[default]
    Rgb,
    Bgr,
}

/// A single decoded 8-bit, 3-channel picture.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pixels: RgbImage,
    order: ChannelOrder,
}

impl Frame {
    pub fn new(pixels: RgbImage, order: ChannelOrder) -> Self {
        Self { pixels, order }
    }

    /// Wraps a packed `height * width * 3` buffer. Returns `None` when the
    /// buffer length does not match the dimensions.
    pub fn from_raw(width: u32, height: u32, data: Vec<u8>, order: ChannelOrder) -> Option<Self> {
        RgbImage::from_raw(width, height, data).map(|pixels| Self { pixels, order })
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn order(&self) -> ChannelOrder {
        self.order
    }

    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    /// Returns the pixels with channels laid out in `target` order.
    pub fn to_order(&self, target: ChannelOrder) -> RgbImage {
        let mut pixels = self.pixels.clone();
        if self.order != target {
            for pixel in pixels.pixels_mut() {
                pixel.0.swap(0, 2);
            }
        }
        pixels
    }
}

/// Frames selected from one source, in temporal order. Always holds exactly
/// the number of frames the sampler was asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameBatch {
    frames: Vec<Frame>,
}

impl FrameBatch {
    pub(crate) fn new(frames: Vec<Frame>) -> Self {
        Self { frames }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Frame> {
        self.frames.iter()
    }
}

use crate::{
    decoder::{DecodeError, VideoDecoder},
    frame::{Frame, FrameBatch},
};
use std::path::Path;

/// Picks `num_samples` frame indices covering `[0, total - 1]`.
///
/// Short sources keep every frame and repeat the last one until the count is
/// reached. Longer sources are sampled at evenly spaced positions, truncated
/// to integers, so the first and last frames are always included.
pub fn sample_indices(total: usize, num_samples: usize) -> Vec<usize> {
    if total == 0 || num_samples == 0 {
        return Vec::new();
    }

    if total <= num_samples {
        let mut indices: Vec<usize> = (0..total).collect();
        indices.resize(num_samples, total - 1);
        return indices;
    }

    if num_samples == 1 {
        return vec![0];
    }

    (0..num_samples)
        .map(|i| i * (total - 1) / (num_samples - 1))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSampler {
    num_frames: usize,
}

impl FrameSampler {
    pub fn new(num_frames: usize) -> Self {
        Self {
            num_frames: num_frames.max(1),
        }
    }

    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    /// Reduces (or pads) a decoded frame sequence to exactly `num_frames`.
    pub fn sample(&self, frames: Vec<Frame>, source: &str) -> Result<FrameBatch, DecodeError> {
        if frames.is_empty() {
            return Err(DecodeError::NoFrames(source.to_string()));
        }

        tracing::debug!("Total frames in {}: {}", source, frames.len());

        let batch = sample_indices(frames.len(), self.num_frames)
            .into_iter()
            .map(|index| frames[index].clone())
            .collect();

        Ok(FrameBatch::new(batch))
    }

    /// Counts the frames of `path`, picks the sample positions and decodes
    /// only those.
    pub fn sample_video(
        &self,
        decoder: &dyn VideoDecoder,
        path: &Path,
    ) -> Result<FrameBatch, DecodeError> {
        let source = path.display().to_string();
        let total = decoder.frame_count(path)?;
        if total == 0 {
            return Err(DecodeError::NoFrames(source));
        }

        tracing::debug!("Total frames in {}: {}", source, total);

        let wanted = sample_indices(total, self.num_frames);
        let decoded = decoder.decode_frames(path, &wanted)?;
        assemble(&wanted, &decoded, &source)
    }
}

/// Builds the batch for `wanted` from the frames actually decoded. When the
/// stream ended before a wanted position, the nearest earlier decoded frame
/// stands in, which matches padding with the last frame.
fn assemble(
    wanted: &[usize],
    decoded: &[(usize, Frame)],
    source: &str,
) -> Result<FrameBatch, DecodeError> {
    if decoded.is_empty() {
        return Err(DecodeError::NoFrames(source.to_string()));
    }

    let frames = wanted
        .iter()
        .map(|&index| {
            let position = decoded.partition_point(|(decoded_index, _)| *decoded_index <= index);
            decoded[position.saturating_sub(1)].1.clone()
        })
        .collect();

    Ok(FrameBatch::new(frames))
}

use crate::frame::{ChannelOrder, Frame};
use std::{
    ffi::OsString,
    io::{BufReader, ErrorKind, Read},
    path::{Path, PathBuf},
    process::{Command, Stdio},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Could not read any frames from {0}")]
    NoFrames(String),
    #[error("Failed to decode image: {0}")]
    Image(#[from] image::ImageError),
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} failed: {stderr}")]
    ProcessFailed { program: String, stderr: String },
    #[error("Invalid video dimensions: {0:?}")]
    InvalidDimensions(String),
    #[error("Invalid frame count: {0:?}")]
    InvalidFrameCount(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "opencv")]
    #[error("OpenCV error: {0}")]
    OpenCv(#[from] opencv::Error),
}

/// Turns a video file into its full, ordered list of frames.
/// Source of video frames.
///
/// Callers count the frames first, choose the positions they need and then
/// decode only those, so a long video never has to be held in memory.
pub trait VideoDecoder: Send + Sync {
    /// Number of frames in the first video stream of `path`.
    fn frame_count(&self, path: &Path) -> Result<usize, DecodeError>;

    /// Decodes `path` in order and keeps the frames whose positions appear in
    /// `wanted` (ascending, repeats allowed). Each kept position is returned
    /// once. Decoding stops after the last wanted position; a stream shorter
    /// than announced simply yields fewer frames.
    fn decode_frames(&self, path: &Path, wanted: &[usize]) -> Result<Vec<(usize, Frame)>, DecodeError>;
}

/// Walks an ascending list of wanted frame positions.
#[derive(Debug, Clone)]
pub struct FrameSelector {
    wanted: Vec<usize>,
    cursor: usize,
}

impl FrameSelector {
    pub fn new(wanted: &[usize]) -> Self {
        let mut wanted = wanted.to_vec();
        wanted.sort_unstable();
        wanted.dedup();
        Self { wanted, cursor: 0 }
    }

    /// Whether the frame at `index` should be kept. Positions must be offered
    /// in increasing order.
    pub fn select(&mut self, index: usize) -> bool {
        while self.wanted.get(self.cursor).is_some_and(|&w| w < index) {
            self.cursor += 1;
        }
        if self.wanted.get(self.cursor) == Some(&index) {
            self.cursor += 1;
            true
        } else {
            false
        }
    }

    /// True once every wanted position has been passed.
    pub fn is_done(&self) -> bool {
        self.cursor >= self.wanted.len()
    }
}

pub fn decode_image(bytes: &[u8]) -> Result<Frame, DecodeError> {
    let image = image::ImageReader::new(std::io::Cursor::new(bytes))
        .with_guessed_format()?
        .decode()?;

    Ok(Frame::new(image.to_rgb8(), ChannelOrder::Rgb))
}

/// Splits a packed `rgb24` stream into frames, keeping only the selected
/// positions. Reads one frame at a time and stops as soon as the selector is
/// done, so at most one unselected frame is buffered. A trailing partial
/// frame is dropped.
pub fn read_raw_frames<R: Read>(
    reader: R,
    width: u32,
    height: u32,
    selector: &mut FrameSelector,
) -> Result<Vec<(usize, Frame)>, DecodeError> {
    let frame_size = width as usize * height as usize * 3;
    if frame_size == 0 {
        return Err(DecodeError::InvalidDimensions(format!("{}x{}", width, height)));
    }

    let mut reader = BufReader::with_capacity(frame_size, reader);
    let mut buffer = vec![0u8; frame_size];
    let mut frames = Vec::new();
    let mut index = 0;

    while !selector.is_done() {
        match reader.read_exact(&mut buffer) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        if selector.select(index) {
            let frame = Frame::from_raw(width, height, buffer.clone(), ChannelOrder::Rgb)
                .ok_or_else(|| DecodeError::InvalidDimensions(format!("{}x{}", width, height)))?;
            frames.push((index, frame));
        }
        index += 1;
    }

    Ok(frames)
}

/// Decodes through the `ffmpeg` and `ffprobe` command line tools.
///
/// Frames are scaled by ffmpeg to a fixed `width x height`, after ffmpeg has
/// applied any rotation metadata, so the raw stride is always known.
#[derive(Debug, Clone)]
pub struct FfmpegDecoder {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    width: u32,
    height: u32,
}

impl FfmpegDecoder {
    pub fn new(
        ffmpeg: impl Into<PathBuf>,
        ffprobe: impl Into<PathBuf>,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            width,
            height,
        }
    }

    /// Arguments for a raw `rgb24` decode of the first video stream, scaled
    /// to the output size. Rotation metadata is left to ffmpeg's default
    /// auto-rotation, which runs before the scale filter.
    fn decode_args(&self, path: &Path) -> Vec<OsString> {
        let scale = format!("scale={}:{}:flags=bilinear", self.width, self.height);
        ["-v", "error", "-nostdin", "-i"]
            .into_iter()
            .map(OsString::from)
            .chain(std::iter::once(path.as_os_str().to_owned()))
            .chain(
                [
                    "-map", "0:v:0", "-an", "-sn", "-vf", &scale, "-f", "rawvideo", "-pix_fmt", "rgb24",
                    "pipe:1",
                ]
                .into_iter()
                .map(OsString::from),
            )
            .collect()
    }
}

impl VideoDecoder for FfmpegDecoder {
    fn frame_count(&self, path: &Path) -> Result<usize, DecodeError> {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-count_packets",
                "-show_entries",
                "stream=nb_read_packets",
                "-of",
                "csv=p=0",
            ])
            .arg(path)
            .output()
            .map_err(|source| DecodeError::Spawn {
                program: self.ffprobe.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(DecodeError::ProcessFailed {
                program: self.ffprobe.display().to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        parse_frame_count(&String::from_utf8_lossy(&output.stdout))
    }

    fn decode_frames(&self, path: &Path, wanted: &[usize]) -> Result<Vec<(usize, Frame)>, DecodeError> {
        let program = self.ffmpeg.display().to_string();
        tracing::debug!("Decoding {} frames of {} at {}x{}", wanted.len(), path.display(), self.width, self.height);

        let mut child = Command::new(&self.ffmpeg)
            .args(self.decode_args(path))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| DecodeError::Spawn {
                program: program.clone(),
                source,
            })?;

        // Drained on its own thread so a chatty decoder cannot block on a full pipe.
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            std::thread::spawn(move || {
                let mut text = String::new();
                let _ = stderr.read_to_string(&mut text);
                text
            })
        });

        let mut selector = FrameSelector::new(wanted);
        let frames = match child.stdout.take() {
            Some(stdout) => read_raw_frames(stdout, self.width, self.height, &mut selector),
            None => Ok(Vec::new()),
        };

        let stopped_early = selector.is_done();
        if stopped_early || frames.is_err() {
            // The rest of the stream is not needed.
            let _ = child.kill();
        }
        let status = child.wait()?;
        let stderr = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default()
            .trim()
            .to_string();
        let frames = frames?;

        if !status.success() && !stopped_early {
            if frames.is_empty() {
                return Err(DecodeError::ProcessFailed { program, stderr });
            }
            tracing::warn!("ffmpeg stopped early on {}: {}", path.display(), stderr);
        }

        Ok(frames)
    }
}

fn parse_frame_count(probe_output: &str) -> Result<usize, DecodeError> {
    let line = probe_output.lines().next().unwrap_or_default().trim();
    line.trim_end_matches(',')
        .parse()
        .map_err(|_| DecodeError::InvalidFrameCount(line.to_string()))
}

#[cfg(feature = "opencv")]
pub use self::opencv_decoder::OpenCvDecoder;

#[cfg(feature = "opencv")]
mod opencv_decoder {
    use super::{DecodeError, FrameSelector, VideoDecoder};
    use crate::frame::{ChannelOrder, Frame};
    use opencv::{core::Mat, prelude::*, videoio};
    use std::path::Path;

    /// Decodes videos through OpenCV's `VideoCapture`. Frames come out in BGR.
    #[derive(Debug, Clone, Default)]
    pub struct OpenCvDecoder;

    impl OpenCvDecoder {
        fn open(path: &Path) -> Result<videoio::VideoCapture, DecodeError> {
            let source = path.display().to_string();
            let capture = videoio::VideoCapture::from_file(&source, videoio::CAP_ANY)?;
            if !capture.is_opened()? {
                return Err(DecodeError::NoFrames(source));
            }
            Ok(capture)
        }
    }

    impl VideoDecoder for OpenCvDecoder {
        fn frame_count(&self, path: &Path) -> Result<usize, DecodeError> {
            let mut capture = Self::open(path)?;
            let count = capture.get(videoio::CAP_PROP_FRAME_COUNT)?;
            capture.release()?;

            Ok(count.max(0.0) as usize)
        }

        fn decode_frames(&self, path: &Path, wanted: &[usize]) -> Result<Vec<(usize, Frame)>, DecodeError> {
            let mut capture = Self::open(path)?;
            let mut selector = FrameSelector::new(wanted);
            let mut frames = Vec::new();
            let mut index = 0;

            while !selector.is_done() {
                let mut mat = Mat::default();
                if !capture.read(&mut mat)? || mat.empty() {
                    break;
                }
                if selector.select(index) {
                    frames.push((index, mat_to_frame(&mat)?));
                }
                index += 1;
            }
            capture.release()?;

            Ok(frames)
        }
    }

    fn mat_to_frame(mat: &Mat) -> Result<Frame, DecodeError> {
        let width = mat.cols() as u32;
        let height = mat.rows() as u32;
        let data = if mat.is_continuous() {
            mat.data_bytes()?.to_vec()
        } else {
            mat.try_clone()?.data_bytes()?.to_vec()
        };

        Frame::from_raw(width, height, data, ChannelOrder::Bgr)
            .ok_or_else(|| DecodeError::InvalidDimensions(format!("{}x{}", width, height)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use std::io::Cursor;

    fn packed_frames(count: u8, width: u32, height: u32) -> Vec<u8> {
        (0..count)
            .flat_map(|i| std::iter::repeat(i).take(width as usize * height as usize * 3))
            .collect()
    }

    #[test]
    fn test_parse_frame_count() {
        assert_eq!(parse_frame_count("300\n").unwrap(), 300);
        assert_eq!(parse_frame_count("42,\n").unwrap(), 42);
        assert!(matches!(parse_frame_count(""), Err(DecodeError::InvalidFrameCount(_))));
        assert!(parse_frame_count("N/A").is_err());
    }

    #[test]
    fn test_selector_skips_unwanted_positions() {
        let mut selector = FrameSelector::new(&[4, 0, 2, 2]);

        let kept: Vec<usize> = (0..6).filter(|&i| selector.select(i)).collect();

        assert_eq!(kept, vec![0, 2, 4]);
        assert!(selector.is_done());
        assert!(FrameSelector::new(&[]).is_done());
    }

    #[test]
    fn test_read_raw_frames_keeps_selected_positions() {
        let mut selector = FrameSelector::new(&[0, 2, 2, 4]);
        let stream = packed_frames(5, 3, 2);

        let frames = read_raw_frames(Cursor::new(stream), 3, 2, &mut selector).unwrap();

        let positions: Vec<usize> = frames.iter().map(|(i, _)| *i).collect();
        assert_eq!(positions, vec![0, 2, 4]);
        for (index, frame) in &frames {
            assert_eq!((frame.width(), frame.height()), (3, 2));
            assert!(frame.pixels().as_raw().iter().all(|&v| v == *index as u8));
        }
    }

    #[test]
    fn test_read_raw_frames_stops_after_last_wanted_frame() {
        let frame_size = 4 * 4 * 3;
        let mut selector = FrameSelector::new(&[1]);
        let mut cursor = Cursor::new(packed_frames(200, 4, 4));

        let frames = read_raw_frames(&mut cursor, 4, 4, &mut selector).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, 1);
        // Only buffered reads past frame 1, never the whole stream.
        assert!(cursor.position() < 200 * frame_size as u64);
    }

    #[test]
    fn test_read_raw_frames_drops_partial_tail() {
        let mut stream = packed_frames(3, 2, 2);
        stream.extend_from_slice(&[9; 5]);
        let mut selector = FrameSelector::new(&[0, 1, 2, 3, 4]);

        let frames = read_raw_frames(Cursor::new(stream), 2, 2, &mut selector).unwrap();

        assert_eq!(frames.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(!selector.is_done());
    }

    #[test]
    fn test_read_raw_frames_rejects_empty_dimensions() {
        let mut selector = FrameSelector::new(&[0]);

        assert!(matches!(
            read_raw_frames(Cursor::new(vec![0u8; 12]), 0, 2, &mut selector),
            Err(DecodeError::InvalidDimensions(_))
        ));
    }

    #[test]
    fn test_decode_image() {
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(8, 4, Rgb([255, 0, 0]));
        let mut image_data: Vec<u8> = Vec::new();
        img.write_to(&mut Cursor::new(&mut image_data), image::ImageFormat::Png)
            .unwrap();

        let frame = decode_image(&image_data).unwrap();

        assert_eq!((frame.width(), frame.height()), (8, 4));
        assert_eq!(frame.order(), ChannelOrder::Rgb);
        assert_eq!(frame.pixels().get_pixel(0, 0).0, [255, 0, 0]);
    }

    #[test]
    fn test_decode_image_rejects_garbage() {
        assert!(decode_image(b"definitely not an image").is_err());
    }

    #[test]
    fn test_decode_args_fix_output_size_after_rotation() {
        let decoder = FfmpegDecoder::new("ffmpeg", "ffprobe", 224, 160);

        let args: Vec<String> = decoder
            .decode_args(Path::new("portrait.mov"))
            .into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();

        let input = args.iter().position(|arg| arg == "-i").unwrap();
        assert_eq!(args[input + 1], "portrait.mov");
        let filter = args.iter().position(|arg| arg == "-vf").unwrap();
        assert_eq!(args[filter + 1], "scale=224:160:flags=bilinear");
        assert!(!args.iter().any(|arg| arg == "-noautorotate"));
        assert!(args.ends_with(&["-f".into(), "rawvideo".into(), "-pix_fmt".into(), "rgb24".into(), "pipe:1".into()]));
    }

    #[test]
    fn test_ffmpeg_decoder_reports_missing_binary() {
        let decoder = FfmpegDecoder::new("/nonexistent/ffmpeg", "/nonexistent/ffprobe", 224, 224);

        assert!(matches!(
            decoder.frame_count(Path::new("clip.mp4")),
            Err(DecodeError::Spawn { .. })
        ));
        assert!(matches!(
            decoder.decode_frames(Path::new("clip.mp4"), &[0, 1]),
            Err(DecodeError::Spawn { .. })
        ));
    }
}

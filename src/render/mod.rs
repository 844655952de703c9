//! Gaze overlay video synthesis
//!
//! Decodes the scene video frame by frame, burns a gaze marker onto every
//! frame and re-encodes the result. Decoding and encoding run through ffmpeg
//! subprocesses exchanging raw `rgb24` frames over pipes.
//!
//! # Example
//!
//! ```rust,no_run
//! use gazecode::render::{FfmpegDecoder, FfmpegEncoder, GazeOverlayRenderer, RenderConfig, VideoProbe};
//!
//! # async fn run(rows: Vec<gazecode::FrameRecord>) -> anyhow::Result<()> {
//! let config = RenderConfig::default();
//! let probe = VideoProbe::run(&config.ffprobe_path, "scene.mp4".as_ref()).await?;
//! let mut source = FfmpegDecoder::spawn(&config, "scene.mp4".as_ref(), &probe)?;
//! let mut sink = FfmpegEncoder::spawn(&config, "gaze_overlay.mp4".as_ref(), probe.width, probe.height)?;
//! let report = GazeOverlayRenderer::new(config.marker()).render(&rows, &mut source, &mut sink).await?;
//! println!("{} frames written", report.frames_written);
//! # Ok(())
//! # }
//! ```

pub mod decoder;
pub mod encoder;
pub mod frames;
pub mod marker;
pub mod overlay;
pub mod probe;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use decoder::{DecodedFrame, FfmpegDecoder, FrameSource};
pub use encoder::{FfmpegEncoder, FrameSink};
pub use frames::{FrameExtractor, FrameStore, SourceStamp};
pub use marker::GazeMarker;
pub use overlay::{GazeOverlayRenderer, RenderReport};
pub use probe::{TimeBase, VideoProbe};

/// Rendering errors
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("FFmpeg error: {0}")]
    Ffmpeg(String),

    #[error("Cannot open video {path}: {reason}")]
    Open { path: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Frame size mismatch: expected {expected} bytes, got {actual}")]
    FrameSize { expected: usize, actual: usize },

    #[error("Cancelled before the video was fully processed")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, RenderError>;

/// Overlay rendering and frame extraction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Path to ffmpeg binary
    pub ffmpeg_path: String,
    /// Path to ffprobe binary
    pub ffprobe_path: String,
    /// Nominal output frame rate
    pub fps: u32,
    /// Video codec for the overlay video
    pub codec: String,
    /// Constant rate factor passed to the encoder
    pub crf: u8,
    /// Marker ring radius in pixels
    pub marker_radius: u32,
    /// Marker ring thickness in pixels
    pub marker_thickness: u32,
    /// Marker color as RGB
    pub marker_color: [u8; 3],
    /// Longest side of the JPEG frames sent for annotation
    pub image_max_dim: u32,
    /// JPEG quality (1-100) of the annotation frames
    pub jpeg_quality: u8,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: locate_binary("ffmpeg"),
            ffprobe_path: locate_binary("ffprobe"),
            fps: 30,
            codec: "libx264".to_string(),
            crf: 18,
            marker_radius: 20,
            marker_thickness: 10,
            marker_color: [255, 0, 0],
            image_max_dim: 768,
            jpeg_quality: 85,
        }
    }
}

impl RenderConfig {
    /// Marker described by this config
    #[must_use]
    pub fn marker(&self) -> GazeMarker {
        GazeMarker::new(self.marker_radius, self.marker_thickness, self.marker_color)
    }
}

/// Resolve a binary through PATH, falling back to the bare name
pub(crate) fn locate_binary(name: &str) -> String {
    which::which(name).map_or_else(|_| name.to_string(), |p| p.to_string_lossy().to_string())
}

//! Frame-by-frame video decoding through an ffmpeg pipe

use async_trait::async_trait;
use image::RgbImage;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, warn};

use super::{RenderConfig, RenderError, Result, VideoProbe};

/// One decoded frame with its presentation timestamp
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub pts: u64,
    pub image: RgbImage,
}

/// Sequential source of decoded frames in presentation order
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, or `None` once the stream is exhausted
    async fn next_frame(&mut self) -> Result<Option<DecodedFrame>>;
}

/// Decodes a video to raw `rgb24` frames via an ffmpeg subprocess
pub struct FfmpegDecoder {
    child: Child,
    stdout: BufReader<ChildStdout>,
    width: u32,
    height: u32,
    pts: std::vec::IntoIter<u64>,
    decoded: usize,
}

impl FfmpegDecoder {
    /// Start decoding `video`; frame pts are taken from `probe` in order
    pub fn spawn(config: &RenderConfig, video: &Path, probe: &VideoProbe) -> Result<Self> {
        let mut child = Command::new(&config.ffmpeg_path)
            .args(["-hide_banner", "-loglevel", "error", "-i"])
            .arg(video)
            .args([
                "-map", "0:v:0",
                "-vsync", "passthrough",
                "-f", "rawvideo",
                "-pix_fmt", "rgb24",
                "pipe:1",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RenderError::Open {
                path: video.display().to_string(),
                reason: e.to_string(),
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RenderError::Ffmpeg("Failed to capture ffmpeg stdout".to_string()))?;

        debug!(path = %video.display(), "Started ffmpeg decoder");

        Ok(Self {
            child,
            stdout: BufReader::new(stdout),
            width: probe.width,
            height: probe.height,
            pts: probe.pts.clone().into_iter(),
            decoded: 0,
        })
    }

    fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

#[async_trait]
impl FrameSource for FfmpegDecoder {
    async fn next_frame(&mut self) -> Result<Option<DecodedFrame>> {
        let mut buffer = vec![0u8; self.frame_len()];
        let filled = read_full(&mut self.stdout, &mut buffer).await?;

        if filled == 0 {
            let status = self.child.wait().await?;
            if !status.success() && self.decoded == 0 {
                return Err(RenderError::Ffmpeg(format!(
                    "ffmpeg decoder exited with status: {status}"
                )));
            }
            debug!(frames = self.decoded, "End of the file");
            return Ok(None);
        }
        if filled < buffer.len() {
            warn!(
                expected = buffer.len(),
                actual = filled,
                "Truncated trailing frame from decoder, ignoring"
            );
            return Ok(None);
        }

        let Some(pts) = self.pts.next() else {
            warn!(
                frame = self.decoded,
                "Decoder produced more frames than probed pts, stopping"
            );
            return Ok(None);
        };

        let image = RgbImage::from_raw(self.width, self.height, buffer).ok_or(
            RenderError::FrameSize {
                expected: self.frame_len(),
                actual: filled,
            },
        )?;

        self.decoded += 1;
        Ok(Some(DecodedFrame { pts, image }))
    }
}

/// Fill `buf` from `reader`, returning fewer bytes only at end of stream
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

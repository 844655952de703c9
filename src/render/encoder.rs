//! Overlay video encoding through an ffmpeg pipe

use async_trait::async_trait;
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, info};

use super::{RenderConfig, RenderError, Result};

/// Sequential consumer of rendered frames
#[async_trait]
pub trait FrameSink: Send {
    /// Append one frame to the output
    async fn write_frame(&mut self, frame: &RgbImage) -> Result<()>;

    /// Flush buffered frames and finalize the output
    async fn finish(&mut self) -> Result<()>;
}

/// Encodes raw `rgb24` frames at a fixed frame rate via an ffmpeg subprocess
pub struct FfmpegEncoder {
    child: Child,
    stdin: Option<ChildStdin>,
    output: PathBuf,
    width: u32,
    height: u32,
    written: u64,
}

impl FfmpegEncoder {
    /// Start an encoder writing `output` at `width`x`height`
    pub fn spawn(config: &RenderConfig, output: &Path, width: u32, height: u32) -> Result<Self> {
        let args = build_args(config, width, height);
        debug!("ffmpeg encoder args: {:?}", args);

        let mut child = Command::new(&config.ffmpeg_path)
            .args(&args)
            .arg(output)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RenderError::Ffmpeg(format!("Failed to start encoder: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RenderError::Ffmpeg("Failed to capture ffmpeg stdin".to_string()))?;

        Ok(Self {
            child,
            stdin: Some(stdin),
            output: output.to_path_buf(),
            width,
            height,
            written: 0,
        })
    }
}

/// Encoder arguments up to (excluding) the output path
fn build_args(config: &RenderConfig, width: u32, height: u32) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "warning"]
        .iter()
        .map(std::string::ToString::to_string)
        .collect();

    // Raw frames on stdin
    args.extend([
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        "rgb24".to_string(),
        "-s".to_string(),
        format!("{width}x{height}"),
        "-r".to_string(),
        config.fps.to_string(),
        "-i".to_string(),
        "pipe:0".to_string(),
    ]);

    args.extend([
        "-c:v".to_string(),
        config.codec.clone(),
        "-crf".to_string(),
        config.crf.to_string(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-y".to_string(), // Overwrite
    ]);

    args
}

#[async_trait]
impl FrameSink for FfmpegEncoder {
    async fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
        if frame.width() != self.width || frame.height() != self.height {
            return Err(RenderError::FrameSize {
                expected: self.width as usize * self.height as usize * 3,
                actual: frame.as_raw().len(),
            });
        }

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| RenderError::Ffmpeg("Encoder already finished".to_string()))?;
        stdin.write_all(frame.as_raw()).await?;
        self.written += 1;
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        // Closing stdin signals EOF; ffmpeg drains its buffered frames and exits
        if let Some(mut stdin) = self.stdin.take() {
            stdin.flush().await?;
            drop(stdin);
        }

        let status = self.child.wait().await?;
        if !status.success() {
            return Err(RenderError::Ffmpeg(format!("ffmpeg exited with status: {status}")));
        }

        info!(
            path = %self.output.display(),
            frames = self.written,
            "Encoded overlay video"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_args_fixed_rate_and_codec() {
        let config = RenderConfig::default();
        let args = build_args(&config, 1600, 1200);

        let pos = |flag: &str| args.iter().position(|a| a == flag).unwrap();
        assert_eq!(args[pos("-s") + 1], "1600x1200");
        assert_eq!(args[pos("-r") + 1], "30");
        assert_eq!(args[pos("-c:v") + 1], "libx264");
        assert_eq!(args[pos("-crf") + 1], "18");
        assert_eq!(args.last().unwrap(), "-y");
        // Input options come before the input
        assert!(pos("-r") < pos("-i"));
    }
}

//! Stream metadata and per-frame pts via ffprobe

use serde::Deserialize;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{RenderError, Result};
use crate::recording::FrameRecord;

/// Rational stream time base (seconds per pts tick)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBase {
    pub num: u64,
    pub den: u64,
}

impl TimeBase {
    /// Parse ffprobe's `"1/90000"` notation
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let (num, den) = s.split_once('/')?;
        let num: u64 = num.trim().parse().ok()?;
        let den: u64 = den.trim().parse().ok()?;
        (den != 0).then_some(Self { num, den })
    }

    /// Convert a pts delta to nanoseconds
    #[must_use]
    pub fn ticks_to_ns(&self, ticks: u64) -> u64 {
        let ns = u128::from(ticks) * u128::from(self.num) * 1_000_000_000 / u128::from(self.den);
        u64::try_from(ns).unwrap_or(u64::MAX)
    }
}

/// Video stream description with frame pts in decoder output order
#[derive(Debug, Clone)]
pub struct VideoProbe {
    pub width: u32,
    pub height: u32,
    pub time_base: TimeBase,
    pub start_pts: u64,
    /// Frame count claimed by the container, if any
    pub declared_frames: Option<u64>,
    /// Frame pts in the order the decoder emits frames
    pub pts: Vec<u64>,
}

impl VideoProbe {
    /// Probe `video` with ffprobe.
    ///
    /// Fails when the file cannot be opened or has no video stream; nothing
    /// downstream can proceed without it.
    pub async fn run(ffprobe_path: &str, video: &Path) -> Result<Self> {
        let output = Command::new(ffprobe_path)
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=width,height,time_base,start_pts,nb_frames:frame=pts,pkt_dts,best_effort_timestamp",
                "-of",
                "json",
            ])
            .arg(video)
            .output()
            .await
            .map_err(|e| RenderError::Open {
                path: video.display().to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RenderError::Open {
                path: video.display().to_string(),
                reason: format!("ffprobe failed: {}", stderr.trim()),
            });
        }

        let probe = Self::from_json(&output.stdout)?;
        info!(
            path = %video.display(),
            width = probe.width,
            height = probe.height,
            frames = probe.pts.len(),
            "Probed video"
        );
        Ok(probe)
    }

    /// Build from ffprobe JSON output
    pub fn from_json(json: &[u8]) -> Result<Self> {
        let raw: FfprobeOutput = serde_json::from_slice(json)?;

        let stream = raw
            .streams
            .first()
            .ok_or_else(|| RenderError::Ffmpeg("No video stream found".to_string()))?;

        let (width, height) = match (stream.width, stream.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
            _ => return Err(RenderError::Ffmpeg("Video stream has no dimensions".to_string())),
        };

        let time_base = stream
            .time_base
            .as_deref()
            .and_then(TimeBase::parse)
            .ok_or_else(|| RenderError::Ffmpeg("Video stream has no time base".to_string()))?;

        let mut signed = Vec::with_capacity(raw.frames.len());
        let mut dts_matches = true;
        for (i, frame) in raw.frames.iter().enumerate() {
            let Some(value) = frame.pts.or(frame.best_effort_timestamp) else {
                debug!(frame = i, "Frame without pts skipped");
                continue;
            };
            match frame.pkt_dts {
                Some(dts) => dts_matches &= dts == value,
                None => debug!(frame = i, "Decoding timestamp is missing"),
            }
            signed.push(value);
        }

        // Edit lists can put leading frames before zero; shift so every pts stays distinct
        let shift = signed
            .iter()
            .chain(stream.start_pts.as_ref())
            .copied()
            .min()
            .filter(|min| *min < 0)
            .map_or(0, i64::saturating_neg);
        if shift > 0 {
            warn!(shift, "Negative pts in video, offsetting all timestamps");
        }
        let offset = |value: i64| u64::try_from(value.saturating_add(shift)).unwrap_or(0);
        let pts: Vec<u64> = signed.into_iter().map(offset).collect();

        if !pts.windows(2).all(|w| w[0] <= w[1]) {
            warn!("Pts are not monotonic increasing");
        }
        if dts_matches && !pts.is_empty() {
            debug!("Pts and dts are equal, using pts");
        }

        let declared_frames = stream.nb_frames.as_deref().and_then(|n| n.parse().ok());
        match declared_frames {
            Some(n) if n != pts.len() as u64 => warn!(
                declared = n,
                decoded = pts.len(),
                "Frame count differs from stream metadata, using decoded count"
            ),
            _ => debug!(frames = pts.len(), "Video frame count"),
        }

        Ok(Self {
            width,
            height,
            time_base,
            start_pts: offset(stream.start_pts.unwrap_or(0)),
            declared_frames,
            pts,
        })
    }

    /// `(pts, offset_ns)` per frame, sorted by pts
    #[must_use]
    pub fn timings(&self) -> Vec<(u64, u64)> {
        let mut pts = self.pts.clone();
        pts.sort_unstable();
        pts.into_iter()
            .map(|p| (p, self.time_base.ticks_to_ns(p.saturating_sub(self.start_pts))))
            .collect()
    }

    /// Frame table of this video alone, timestamps relative to stream start
    #[must_use]
    pub fn frame_table(&self) -> Vec<FrameRecord> {
        self.timings()
            .into_iter()
            .enumerate()
            .map(|(i, (pts, offset_ns))| FrameRecord {
                frame_index: i as u64,
                pts,
                timestamp_ns: offset_ns,
                timestamp_s: offset_ns as f64 / 1e9,
                gaze_x: None,
                gaze_y: None,
            })
            .collect()
    }
}

/// `FFprobe` JSON output structure
#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    frames: Vec<FfprobeFrame>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    width: Option<u32>,
    height: Option<u32>,
    time_base: Option<String>,
    start_pts: Option<i64>,
    nb_frames: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFrame {
    pts: Option<i64>,
    pkt_dts: Option<i64>,
    best_effort_timestamp: Option<i64>,
}

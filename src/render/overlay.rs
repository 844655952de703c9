//! The gaze overlay render loop

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{DecodedFrame, FrameSink, FrameSource, GazeMarker, Result};
use crate::recording::FrameRecord;

/// Outcome of one overlay render
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderReport {
    /// Rows in the fused table
    pub rows: usize,
    /// Frames handed to the encoder
    pub frames_written: usize,
    /// Rows served from the cached last decoded frame
    pub reused_frames: usize,
    /// Requested pts that were missing and replaced by the next frame
    pub substituted_frames: usize,
    /// Source ran out before all rows were rendered
    pub truncated: bool,
    /// Stopped early by the cancel flag
    #[serde(default)]
    pub cancelled: bool,
}

/// Burns the gaze marker into each frame of the fused table
pub struct GazeOverlayRenderer {
    marker: GazeMarker,
    cancel: Option<Arc<AtomicBool>>,
}

impl GazeOverlayRenderer {
    #[must_use]
    pub fn new(marker: GazeMarker) -> Self {
        Self {
            marker,
            cancel: None,
        }
    }

    /// Stop between frames once `cancel` is raised
    #[must_use]
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Render one output frame per row of `rows`, strictly in order.
    ///
    /// Frames are pulled from `source` until one reaches the row's pts. A row
    /// whose pts is not ahead of the last decoded frame reuses that frame.
    /// When the source is exhausted early or the cancel flag is raised,
    /// rendering stops with a warning and the sink is still finalized.
    pub async fn render<S, K>(
        &self,
        rows: &[FrameRecord],
        source: &mut S,
        sink: &mut K,
    ) -> Result<RenderReport>
    where
        S: FrameSource + ?Sized,
        K: FrameSink + ?Sized,
    {
        let mut report = RenderReport {
            rows: rows.len(),
            ..Default::default()
        };
        let mut last: Option<DecodedFrame> = None;

        for row in rows {
            if self.cancel.as_ref().is_some_and(|c| c.load(Ordering::SeqCst)) {
                warn!(rendered = report.frames_written, "Overlay rendering cancelled");
                report.cancelled = true;
                break;
            }

            let reuse = last.as_ref().is_some_and(|frame| row.pts <= frame.pts);

            if reuse {
                debug!(pts = row.pts, "This frame was already decoded");
                report.reused_frames += 1;
            } else {
                match seek_forward(source, row.pts).await? {
                    Some((frame, exact)) => {
                        if !exact {
                            warn!(
                                requested = row.pts,
                                used = frame.pts,
                                "Frame not found in video, using next frame"
                            );
                            report.substituted_frames += 1;
                        }
                        last = Some(frame);
                    }
                    None => {
                        warn!(
                            rendered = report.frames_written,
                            expected = rows.len(),
                            "Source video exhausted before all rows were rendered"
                        );
                        report.truncated = true;
                        break;
                    }
                }
            }

            let Some(frame) = last.as_ref() else { break };
            let mut canvas = frame.image.clone();
            if let Some((x, y)) = row.gaze() {
                self.marker.draw(&mut canvas, x, y);
            }

            sink.write_frame(&canvas).await?;
            report.frames_written += 1;
        }

        sink.finish().await?;

        info!(
            frames = report.frames_written,
            rows = report.rows,
            truncated = report.truncated,
            "Gaze overlay video has been created"
        );
        Ok(report)
    }
}

/// Decode until a frame at or past `pts`; the flag says whether it matched exactly
async fn seek_forward<S: FrameSource + ?Sized>(
    source: &mut S,
    pts: u64,
) -> Result<Option<(DecodedFrame, bool)>> {
    while let Some(frame) = source.next_frame().await? {
        debug!(read = frame.pts, wanted = pts, "Frame read from video");
        if frame.pts == pts {
            return Ok(Some((frame, true)));
        }
        if frame.pts > pts {
            return Ok(Some((frame, false)));
        }
    }
    Ok(None)
}

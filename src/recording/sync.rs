//! Nearest-timestamp fusion of video frames and gaze samples
//!
//! Gaze and scene camera run on independent clocks, so frames are joined to
//! the gaze sample closest in time rather than by exact match or
//! interpolation. Ties go to the earlier sample.

use tracing::{debug, warn};

use super::{FrameRecord, GazeSample};

/// Timing of one decoded video frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTime {
    /// Codec presentation timestamp
    pub pts: u64,
    /// Absolute capture time
    pub timestamp_ns: u64,
}

/// Pair decoded frames with recorded world timestamps.
///
/// `decoded` holds `(pts, offset_ns)` per frame in presentation order, where
/// `offset_ns` is the frame's time from stream start. The decoded count is
/// authoritative: extra world timestamps are dropped, and frames past the
/// end of `world` are placed at `world[0] + offset_ns`.
#[must_use]
pub fn align_world_timestamps(decoded: &[(u64, u64)], world: &[u64]) -> Vec<FrameTime> {
    if decoded.len() != world.len() {
        warn!(
            decoded = decoded.len(),
            world = world.len(),
            "Frame count mismatch between video and world timestamps, using decoded count"
        );
    }

    let origin = world.first().copied();

    decoded
        .iter()
        .enumerate()
        .map(|(i, &(pts, offset_ns))| {
            let timestamp_ns = match (world.get(i), origin) {
                (Some(&ts), _) => ts,
                (None, Some(origin)) => origin.saturating_add(offset_ns),
                (None, None) => offset_ns,
            };
            FrameTime { pts, timestamp_ns }
        })
        .collect()
}

/// Fuses the frame stream with the gaze stream
pub struct TimestampSynchronizer;

impl TimestampSynchronizer {
    /// Build the dense per-frame table.
    ///
    /// Output has exactly one row per input frame, sorted by time, with
    /// `frame_index` renumbered `0..N`. `timestamp_s` is relative to the
    /// first frame. Gaze columns are `None` only when `gaze` is empty.
    #[must_use]
    pub fn fuse(frames: &[FrameTime], gaze: &[GazeSample]) -> Vec<FrameRecord> {
        let mut frames = frames.to_vec();
        frames.sort_by_key(|f| (f.timestamp_ns, f.pts));

        if !frames.windows(2).all(|w| w[0].pts <= w[1].pts) {
            warn!("Frame pts are not monotonic increasing in timestamp order");
        }

        let mut gaze = gaze.to_vec();
        gaze.sort_by_key(|g| g.timestamp_ns);

        let origin = frames.first().map_or(0, |f| f.timestamp_ns);

        let rows: Vec<FrameRecord> = frames
            .iter()
            .enumerate()
            .map(|(i, frame)| {
                let sample = nearest(&gaze, frame.timestamp_ns);
                FrameRecord {
                    frame_index: i as u64,
                    pts: frame.pts,
                    timestamp_ns: frame.timestamp_ns,
                    timestamp_s: (frame.timestamp_ns - origin) as f64 / 1e9,
                    gaze_x: sample.map(|g| g.x),
                    gaze_y: sample.map(|g| g.y),
                }
            })
            .collect();

        debug!(frames = rows.len(), gaze = gaze.len(), "Fused frame and gaze tables");
        rows
    }
}

/// Closest sample to `t` in a time-sorted slice, earlier sample on ties
fn nearest(sorted: &[GazeSample], t: u64) -> Option<&GazeSample> {
    let idx = sorted.partition_point(|g| g.timestamp_ns < t);
    let before = idx.checked_sub(1).and_then(|i| sorted.get(i));
    let after = sorted.get(idx);

    match (before, after) {
        (Some(b), Some(a)) => {
            if t - b.timestamp_ns <= a.timestamp_ns - t {
                Some(b)
            } else {
                Some(a)
            }
        }
        (Some(b), None) => Some(b),
        (None, a) => a,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gaze(ts: u64, x: f64, y: f64) -> GazeSample {
        GazeSample {
            timestamp_ns: ts,
            x,
            y,
        }
    }

    fn frames(ts: &[u64]) -> Vec<FrameTime> {
        ts.iter()
            .enumerate()
            .map(|(i, &t)| FrameTime {
                pts: i as u64 * 100,
                timestamp_ns: t,
            })
            .collect()
    }

    fn coords(rows: &[FrameRecord]) -> Vec<(f64, f64)> {
        rows.iter().filter_map(FrameRecord::gaze).collect()
    }

    #[test]
    fn test_nearest_join() {
        let gaze = vec![gaze(0, 1.0, 1.0), gaze(10, 2.0, 2.0)];
        let rows = TimestampSynchronizer::fuse(&frames(&[0, 4, 6, 10]), &gaze);
        assert_eq!(coords(&rows), vec![(1.0, 1.0), (1.0, 1.0), (2.0, 2.0), (2.0, 2.0)]);
    }

    #[test]
    fn test_tie_goes_to_earlier_sample() {
        let gaze = vec![gaze(0, 1.0, 1.0), gaze(10, 2.0, 2.0)];
        let rows = TimestampSynchronizer::fuse(&frames(&[5]), &gaze);
        assert_eq!(coords(&rows), vec![(1.0, 1.0)]);
    }

    #[test]
    fn test_frames_outside_gaze_span_use_edge_samples() {
        let gaze = vec![gaze(100, 1.0, 1.0), gaze(200, 2.0, 2.0)];
        let rows = TimestampSynchronizer::fuse(&frames(&[0, 150, 151, 900]), &gaze);
        assert_eq!(
            coords(&rows),
            vec![(1.0, 1.0), (1.0, 1.0), (2.0, 2.0), (2.0, 2.0)]
        );
    }

    #[test]
    fn test_unsorted_inputs_are_sorted() {
        let gaze = vec![gaze(10, 2.0, 2.0), gaze(0, 1.0, 1.0)];
        let input = vec![
            FrameTime {
                pts: 200,
                timestamp_ns: 10,
            },
            FrameTime {
                pts: 0,
                timestamp_ns: 0,
            },
        ];
        let rows = TimestampSynchronizer::fuse(&input, &gaze);
        assert_eq!(rows[0].pts, 0);
        assert_eq!(rows[1].pts, 200);
        assert_eq!(rows[1].frame_index, 1);
        assert_eq!(coords(&rows), vec![(1.0, 1.0), (2.0, 2.0)]);
    }

    #[test]
    fn test_empty_gaze_yields_null_columns() {
        let rows = TimestampSynchronizer::fuse(&frames(&[0, 1, 2]), &[]);
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.gaze_x.is_none() && r.gaze_y.is_none()));
    }

    #[test]
    fn test_timestamp_seconds_relative_to_first_frame() {
        let rows = TimestampSynchronizer::fuse(&frames(&[2_000_000_000, 2_500_000_000]), &[]);
        assert!((rows[0].timestamp_s - 0.0).abs() < f64::EPSILON);
        assert!((rows[1].timestamp_s - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_align_prefers_world_timestamps() {
        let decoded = vec![(0, 0), (3000, 33_333_333)];
        let aligned = align_world_timestamps(&decoded, &[1_000, 2_000, 3_000]);
        assert_eq!(aligned.len(), 2);
        assert_eq!(aligned[1].timestamp_ns, 2_000);
    }

    #[test]
    fn test_align_extrapolates_missing_world_timestamps() {
        let decoded = vec![(0, 0), (3000, 33_333_333), (6000, 66_666_666)];
        let aligned = align_world_timestamps(&decoded, &[1_000]);
        assert_eq!(aligned.len(), 3);
        assert_eq!(aligned[0].timestamp_ns, 1_000);
        assert_eq!(aligned[2].timestamp_ns, 1_000 + 66_666_666);
        assert_eq!(aligned[2].pts, 6000);
    }
}

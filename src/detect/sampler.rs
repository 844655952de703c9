//! Midpoint bisection over the frame table
//!
//! Each batch of frames is searched by annotating only the midpoint of the
//! current `[lo, hi)` range:
//!
//! - **miss**: the left half is abandoned and the search continues in
//!   `[mid + 1, hi)`
//! - **hit**: new codes are recorded and the search continues in `[lo, mid)`
//!   looking for earlier occurrences
//!
//! This is a cost heuristic, not an exhaustive search. For a batch `[0, 8)`
//! with activity visible only at frame 3 the oracle sees frames 4, 6 and 7.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{ActivityStateMachine, AnnotationClient, DetectionEvent};
use crate::recording::FrameRecord;
use crate::render::FrameStore;

/// Produces the detections for one frame; empty means "no detection"
#[async_trait]
pub trait FrameAnnotator: Send + Sync {
    async fn annotate(&self, frame: &FrameRecord) -> Vec<DetectionEvent>;
}

/// Annotates frames from an extracted JPEG store through the oracle
pub struct OracleAnnotator {
    store: FrameStore,
    client: AnnotationClient,
}

impl OracleAnnotator {
    #[must_use]
    pub fn new(store: FrameStore, client: AnnotationClient) -> Self {
        Self { store, client }
    }
}

#[async_trait]
impl FrameAnnotator for OracleAnnotator {
    async fn annotate(&self, frame: &FrameRecord) -> Vec<DetectionEvent> {
        match self.store.load(frame.frame_index).await {
            Ok(jpeg) => self.client.annotate(&jpeg, frame).await,
            Err(e) => {
                warn!(frame = frame.frame_index, error = %e, "Frame image unavailable, skipping");
                Vec::new()
            }
        }
    }
}

/// Lifetime of the set of already-reported codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeenCodesPolicy {
    /// Each batch starts with an empty set
    #[default]
    PerBatch,
    /// One set for the whole session
    Session,
}

/// Inclusive time bounds in seconds from the first frame; open when unset
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TimeWindow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_s: Option<f64>,
}

impl TimeWindow {
    #[must_use]
    pub fn new(start_s: Option<f64>, end_s: Option<f64>) -> Self {
        Self { start_s, end_s }
    }

    #[must_use]
    pub fn contains(&self, timestamp_s: f64) -> bool {
        self.start_s.map_or(true, |s| timestamp_s >= s) && self.end_s.map_or(true, |e| timestamp_s <= e)
    }

    #[must_use]
    pub fn is_inverted(&self) -> bool {
        matches!((self.start_s, self.end_s), (Some(s), Some(e)) if s > e)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Frames per independently searched batch
    pub batch_size: usize,
    #[serde(flatten)]
    pub window: TimeWindow,
    pub seen_codes: SeenCodesPolicy,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            batch_size: 300,
            window: TimeWindow::default(),
            seen_codes: SeenCodesPolicy::default(),
        }
    }
}

/// What one sampling pass did
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplerReport {
    /// Detections of codes not yet seen, in search order
    pub first_occurrences: Vec<DetectionEvent>,
    /// Every midpoint frame index, in visitation order
    pub visited: Vec<u64>,
    pub oracle_calls: usize,
    pub skipped_out_of_window: usize,
    pub batches: usize,
    pub cancelled: bool,
}

/// Bisection sampler feeding an [`ActivityStateMachine`]
pub struct SparseEventSampler {
    config: SamplerConfig,
    cancel: Arc<AtomicBool>,
}

impl SparseEventSampler {
    #[must_use]
    pub fn new(config: SamplerConfig) -> Self {
        Self::with_cancel_flag(config, Arc::new(AtomicBool::new(false)))
    }

    #[must_use]
    pub fn with_cancel_flag(config: SamplerConfig, cancel: Arc<AtomicBool>) -> Self {
        Self { config, cancel }
    }

    /// Raise to stop before the next oracle call
    #[must_use]
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Search every batch of `frames` in order.
    ///
    /// All detections at a hit frame go to `machine`; only codes not seen
    /// before (per the configured policy) are added to the report's first
    /// occurrences.
    pub async fn run<A>(
        &self,
        frames: &[FrameRecord],
        annotator: &A,
        machine: &mut ActivityStateMachine,
    ) -> SamplerReport
    where
        A: FrameAnnotator + ?Sized,
    {
        let mut report = SamplerReport::default();
        let mut seen: HashSet<String> = HashSet::new();
        let batch_size = self.config.batch_size.max(1);

        for lo in (0..frames.len()).step_by(batch_size) {
            let hi = (lo + batch_size).min(frames.len());

            if self.config.seen_codes == SeenCodesPolicy::PerBatch {
                seen.clear();
            }

            info!(batch = report.batches, lo, hi, "Sampling batch");
            report.batches += 1;

            self.search(frames, lo, hi, annotator, machine, &mut seen, &mut report)
                .await;
            if report.cancelled {
                warn!(batches = report.batches, "Sampling cancelled");
                break;
            }
        }

        info!(
            oracle_calls = report.oracle_calls,
            frames = frames.len(),
            first_occurrences = report.first_occurrences.len(),
            "Sampling complete"
        );
        report
    }

    #[allow(clippy::too_many_arguments)]
    async fn search<A>(
        &self,
        frames: &[FrameRecord],
        mut lo: usize,
        mut hi: usize,
        annotator: &A,
        machine: &mut ActivityStateMachine,
        seen: &mut HashSet<String>,
        report: &mut SamplerReport,
    ) where
        A: FrameAnnotator + ?Sized,
    {
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let frame = &frames[mid];
            report.visited.push(frame.frame_index);

            if !self.config.window.contains(frame.timestamp_s) {
                debug!(frame = frame.frame_index, "Outside time window");
                report.skipped_out_of_window += 1;
                lo = mid + 1;
                continue;
            }

            if self.cancel.load(Ordering::SeqCst) {
                report.cancelled = true;
                return;
            }

            report.oracle_calls += 1;
            let detections = annotator.annotate(frame).await;

            if detections.is_empty() {
                lo = mid + 1;
                continue;
            }

            for detection in &detections {
                machine.observe(detection).await;
            }
            for detection in detections {
                if seen.insert(detection.code.clone()) {
                    report.first_occurrences.push(detection);
                }
            }
            hi = mid;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::sink::tests::RecordingSink;
    use crate::detect::EventMode;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted detections per frame index; records every call
    #[derive(Default)]
    struct ScriptedAnnotator {
        hits: HashMap<u64, Vec<String>>,
        calls: Mutex<Vec<u64>>,
        cancel_after: Option<(usize, Arc<AtomicBool>)>,
    }

    impl ScriptedAnnotator {
        fn with_hits(hits: &[(u64, &[&str])]) -> Self {
            Self {
                hits: hits
                    .iter()
                    .map(|(i, codes)| (*i, codes.iter().map(|c| (*c).to_string()).collect()))
                    .collect(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl FrameAnnotator for ScriptedAnnotator {
        async fn annotate(&self, frame: &FrameRecord) -> Vec<DetectionEvent> {
            let mut calls = self.calls.lock().unwrap();
            calls.push(frame.frame_index);
            if let Some((n, flag)) = &self.cancel_after {
                if calls.len() >= *n {
                    flag.store(true, Ordering::SeqCst);
                }
            }
            self.hits
                .get(&frame.frame_index)
                .map(|codes| {
                    codes
                        .iter()
                        .map(|code| DetectionEvent {
                            frame_id: frame.frame_index,
                            timestamp_s: frame.timestamp_s,
                            code: code.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default()
        }
    }

    fn frames(n: u64) -> Vec<FrameRecord> {
        (0..n)
            .map(|i| FrameRecord {
                frame_index: i,
                pts: i,
                timestamp_ns: i * 1_000_000_000,
                timestamp_s: i as f64,
                gaze_x: None,
                gaze_y: None,
            })
            .collect()
    }

    fn machine(codes: &[&str]) -> ActivityStateMachine {
        ActivityStateMachine::new(
            EventMode::Paired,
            codes.iter().copied(),
            Arc::new(RecordingSink::default()),
        )
    }

    fn config(batch_size: usize) -> SamplerConfig {
        SamplerConfig {
            batch_size,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_miss_scans_right() {
        // Hit only at 3: the miss at 4 abandons [0, 4)
        let annotator = ScriptedAnnotator::with_hits(&[(3, &["start_a"])]);
        let mut m = machine(&["a"]);

        let report = SparseEventSampler::new(config(8))
            .run(&frames(8), &annotator, &mut m)
            .await;

        assert_eq!(*annotator.calls.lock().unwrap(), vec![4, 6, 7]);
        assert_eq!(report.visited, vec![4, 6, 7]);
        assert!(report.first_occurrences.is_empty());
        assert!(m.emitted().is_empty());
    }

    #[tokio::test]
    async fn test_hit_searches_left() {
        let annotator = ScriptedAnnotator::with_hits(&[(4, &["start_a"]), (2, &["start_a"])]);
        let mut m = machine(&["a"]);

        let report = SparseEventSampler::new(config(8))
            .run(&frames(8), &annotator, &mut m)
            .await;

        // 4 hit -> [0,4): 2 hit -> [0,2): 1 miss -> [2,2)
        assert_eq!(*annotator.calls.lock().unwrap(), vec![4, 2, 1]);
        assert_eq!(report.first_occurrences.len(), 1);
        assert_eq!(report.first_occurrences[0].frame_id, 4);
        // Second start_a is redundant for the state machine
        assert_eq!(m.emitted().len(), 1);
    }

    #[tokio::test]
    async fn test_all_detections_reach_state_machine() {
        let annotator =
            ScriptedAnnotator::with_hits(&[(4, &["end_a"]), (2, &["start_a", "start_b"])]);
        let mut m = machine(&["a", "b"]);

        let report = SparseEventSampler::new(config(8))
            .run(&frames(8), &annotator, &mut m)
            .await;

        let codes: Vec<_> = report.first_occurrences.iter().map(|d| d.code.as_str()).collect();
        assert_eq!(codes, vec!["end_a", "start_a", "start_b"]);
        // end_a arrived while inactive
        let emitted: Vec<_> = m.emitted().iter().map(|e| e.code.as_str()).collect();
        assert_eq!(emitted, vec!["start_a", "start_b"]);
    }

    #[tokio::test]
    async fn test_batches_searched_independently() {
        let annotator = ScriptedAnnotator::default();
        let mut m = machine(&["a"]);

        let report = SparseEventSampler::new(config(4))
            .run(&frames(10), &annotator, &mut m)
            .await;

        // [0,4): 2,3  [4,8): 6,7  [8,10): 9
        assert_eq!(*annotator.calls.lock().unwrap(), vec![2, 3, 6, 7, 9]);
        assert_eq!(report.batches, 3);
    }

    #[tokio::test]
    async fn test_seen_codes_policy() {
        let hits: &[(u64, &[&str])] = &[(2, &["start_a"]), (6, &["start_a"])];

        let per_batch = ScriptedAnnotator::with_hits(hits);
        let report = SparseEventSampler::new(config(4))
            .run(&frames(8), &per_batch, &mut machine(&["a"]))
            .await;
        assert_eq!(report.first_occurrences.len(), 2);

        let session = ScriptedAnnotator::with_hits(hits);
        let report = SparseEventSampler::new(SamplerConfig {
            seen_codes: SeenCodesPolicy::Session,
            ..config(4)
        })
        .run(&frames(8), &session, &mut machine(&["a"]))
        .await;
        assert_eq!(report.first_occurrences.len(), 1);
    }

    #[tokio::test]
    async fn test_out_of_window_never_annotated() {
        let annotator = ScriptedAnnotator::default();
        let mut m = machine(&["a"]);
        let config = SamplerConfig {
            batch_size: 8,
            window: TimeWindow::new(Some(5.0), None),
            ..Default::default()
        };

        let report = SparseEventSampler::new(config)
            .run(&frames(8), &annotator, &mut m)
            .await;

        // 4 is skipped as a miss, 6 and 7 are annotated
        assert_eq!(report.visited, vec![4, 6, 7]);
        assert_eq!(*annotator.calls.lock().unwrap(), vec![6, 7]);
        assert_eq!(report.skipped_out_of_window, 1);
    }

    #[test]
    fn test_window_bounds_inclusive() {
        let window = TimeWindow::new(Some(1.0), Some(2.0));
        assert!(window.contains(1.0));
        assert!(window.contains(2.0));
        assert!(!window.contains(2.01));
        assert!(TimeWindow::default().contains(-3.0));
        assert!(TimeWindow::new(Some(3.0), Some(1.0)).is_inverted());
    }

    #[tokio::test]
    async fn test_cancel_stops_before_next_call() {
        let mut m = machine(&["a"]);
        let sampler = SparseEventSampler::new(config(4));
        let annotator = ScriptedAnnotator {
            cancel_after: Some((2, sampler.cancel_flag())),
            ..ScriptedAnnotator::with_hits(&[(2, &["start_a"])])
        };

        let report = sampler.run(&frames(12), &annotator, &mut m).await;

        assert!(report.cancelled);
        assert_eq!(annotator.calls.lock().unwrap().len(), 2);
        // Events already emitted are kept
        assert_eq!(m.emitted().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_table() {
        let annotator = ScriptedAnnotator::default();
        let report = SparseEventSampler::new(config(4))
            .run(&[], &annotator, &mut machine(&["a"]))
            .await;
        assert_eq!(report.batches, 0);
        assert_eq!(report.oracle_calls, 0);
    }
}

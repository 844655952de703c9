//! One detection session over a recording
//!
//! ```text
//! gaze.csv + world_timestamps.csv + scene video
//!     -> merged_gaze.csv -> gaze_overlay.mp4 (cached)
//!     -> frames.csv + frames/*.jpg
//!     -> bisection sampling -> oracle -> state machine -> cloud sink
//!     -> custom_events.csv
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{ConfigError, SessionConfig};
use crate::detect::{
    write_events, ActivityStateMachine, AnnotationClient, AnnotationError, CloudEventSink,
    EmittedEvent, EventSink, FrameAnnotator, HttpOracle, NullSink, OracleAnnotator,
    OracleTransport, SamplerReport, SinkError, Sleeper, SparseEventSampler, TokioSleeper,
};
use crate::recording::{
    align_world_timestamps, read_table, write_table, FrameRecord, Recording, RecordingError,
    TimestampSynchronizer, EVENTS_TABLE, FRAMES_DIR, FRAME_TABLE, MERGED_TABLE,
};
use crate::render::{
    FfmpegDecoder, FfmpegEncoder, FrameExtractor, FrameStore, GazeOverlayRenderer, RenderConfig,
    RenderError, RenderReport, VideoProbe,
};

/// Overlay written under a hidden name and renamed once complete
const PARTIAL_OVERLAY: &str = ".gaze_overlay.partial.mp4";

/// Fatal pipeline failures. Everything recoverable is logged instead.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Recording(#[from] RecordingError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("Annotation client setup failed: {0}")]
    Annotation(#[from] AnnotationError),

    #[error("Event sink setup failed: {0}")]
    Sink(#[from] SinkError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Result of preparing the gaze overlay video
#[derive(Debug, Clone, Serialize)]
pub struct OverlayOutcome {
    pub path: PathBuf,
    /// An existing overlay was reused; nothing was rendered
    pub cached: bool,
    pub report: Option<RenderReport>,
}

/// What a full session produced
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub overlay: OverlayOutcome,
    pub frames: usize,
    pub sampler: SamplerReport,
    pub emitted: Vec<EmittedEvent>,
    pub events_csv: PathBuf,
}

/// Fuse gaze with the scene video and render the overlay video.
///
/// Skipped entirely when the recording already has an overlay video. A fresh
/// render invalidates any frames extracted from a previous overlay.
pub async fn prepare_overlay(
    recording: &Recording,
    config: &RenderConfig,
    cancel: &Arc<AtomicBool>,
) -> Result<OverlayOutcome> {
    let path = recording.overlay_path();
    if path.is_file() {
        info!(path = %path.display(), "Gaze overlay video already exists, skipping rendering");
        return Ok(OverlayOutcome {
            path,
            cached: true,
            report: None,
        });
    }

    let probe = VideoProbe::run(&config.ffprobe_path, &recording.video).await?;
    let world = recording.read_world_timestamps()?;
    let gaze = recording.read_gaze()?;

    let frames = align_world_timestamps(&probe.timings(), &world);
    let rows = TimestampSynchronizer::fuse(&frames, &gaze);
    write_table(&recording.output_path(MERGED_TABLE), &rows)?;
    info!(rows = rows.len(), "Merged gaze and video timestamps");

    let partial = recording.output_path(PARTIAL_OVERLAY);
    let mut source = FfmpegDecoder::spawn(config, &recording.video, &probe)?;
    let mut sink = FfmpegEncoder::spawn(config, &partial, probe.width, probe.height)?;

    let report = GazeOverlayRenderer::new(config.marker())
        .with_cancel_flag(Arc::clone(cancel))
        .render(&rows, &mut source, &mut sink)
        .await?;
    if report.cancelled {
        tokio::fs::remove_file(&partial).await.map_err(RenderError::from)?;
        return Err(RenderError::Cancelled.into());
    }
    tokio::fs::rename(&partial, &path)
        .await
        .map_err(RenderError::from)?;

    FrameStore::new(recording.output_path(FRAMES_DIR))
        .clear()
        .await
        .map_err(RenderError::from)?;

    Ok(OverlayOutcome {
        path,
        cached: false,
        report: Some(report),
    })
}

/// Decode any video into `out_dir/frames.csv` plus `out_dir/frames/*.jpg`
pub async fn extract_video_frames(
    video: &Path,
    out_dir: &Path,
    config: &RenderConfig,
    cancel: &Arc<AtomicBool>,
) -> Result<(Vec<FrameRecord>, FrameStore)> {
    let store = FrameStore::new(out_dir.join(FRAMES_DIR));
    let table = FrameExtractor::new(config.clone())
        .with_cancel_flag(Arc::clone(cancel))
        .extract(video, &store)
        .await?;
    write_table(&out_dir.join(FRAME_TABLE), &table)?;
    Ok((table, store))
}

/// Decode the overlay video of `recording` into its frame table and store.
///
/// Overlay frame `i` was rendered from merged row `i`, so when the merged
/// table is available its recording timestamps and gaze are carried over.
pub async fn extract_frames(
    recording: &Recording,
    config: &RenderConfig,
    cancel: &Arc<AtomicBool>,
) -> Result<(Vec<FrameRecord>, FrameStore)> {
    let store = FrameStore::new(recording.output_path(FRAMES_DIR));
    let mut table = FrameExtractor::new(config.clone())
        .with_cancel_flag(Arc::clone(cancel))
        .extract(&recording.overlay_path(), &store)
        .await?;

    let merged_path = recording.output_path(MERGED_TABLE);
    if merged_path.is_file() {
        let merged: Vec<FrameRecord> = read_table(&merged_path)?;
        attach_merged(&mut table, &merged);
    } else {
        warn!("No merged gaze table, frame timestamps follow the overlay video");
    }

    write_table(&recording.output_path(FRAME_TABLE), &table)?;
    Ok((table, store))
}

/// Frames past the end of `merged` have no recording time and are dropped
fn attach_merged(table: &mut Vec<FrameRecord>, merged: &[FrameRecord]) {
    if table.len() != merged.len() {
        warn!(
            frames = table.len(),
            merged = merged.len(),
            "Overlay frame count differs from merged table"
        );
    }
    table.truncate(merged.len());
    for (row, source) in table.iter_mut().zip(merged) {
        row.timestamp_ns = source.timestamp_ns;
        row.timestamp_s = source.timestamp_s;
        row.gaze_x = source.gaze_x;
        row.gaze_y = source.gaze_y;
    }
}

/// A configured detection session with its external backends
pub struct Session {
    config: SessionConfig,
    transport: Arc<dyn OracleTransport>,
    sink: Arc<dyn EventSink>,
    sleeper: Arc<dyn Sleeper>,
    cancel: Arc<AtomicBool>,
}

impl Session {
    /// Session against the configured oracle endpoint and cloud workspace
    pub fn new(config: SessionConfig) -> Result<Self> {
        config.validate_for_detection()?;

        let transport = Arc::new(HttpOracle::new(&config.oracle)?);
        let sink: Arc<dyn EventSink> = if config.dry_run {
            info!("Dry run, events will not be sent to the cloud");
            Arc::new(NullSink)
        } else {
            Arc::new(CloudEventSink::new(&config.cloud)?)
        };

        Self::with_backends(config, transport, sink, Arc::new(TokioSleeper))
    }

    /// Session with explicit backends
    pub fn with_backends(
        config: SessionConfig,
        transport: Arc<dyn OracleTransport>,
        sink: Arc<dyn EventSink>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config,
            transport,
            sink,
            sleeper,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Raise to stop rendering or extraction between frames, and sampling
    /// before the next oracle request
    #[must_use]
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn annotation_client(&self) -> AnnotationClient {
        AnnotationClient::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.sleeper),
            self.config.retry.clone(),
            &self.config.oracle,
            &self.config.activities.prompt(),
        )
    }

    /// Sample `frames` with any annotator; returns the emitted events in order
    pub async fn detect_with<A>(
        &self,
        frames: &[FrameRecord],
        annotator: &A,
    ) -> (SamplerReport, Vec<EmittedEvent>)
    where
        A: FrameAnnotator + ?Sized,
    {
        let activities = &self.config.activities;
        let mut machine = ActivityStateMachine::new(
            activities.mode,
            activities.codes.iter().cloned(),
            Arc::clone(&self.sink),
        );

        let sampler =
            SparseEventSampler::with_cancel_flag(self.config.sampling.clone(), Arc::clone(&self.cancel));
        let report = sampler.run(frames, annotator, &mut machine).await;

        (report, machine.into_emitted())
    }

    /// Sample `frames` through the oracle, loading images from `store`
    pub async fn detect_frames(
        &self,
        frames: &[FrameRecord],
        store: FrameStore,
    ) -> (SamplerReport, Vec<EmittedEvent>) {
        let annotator = OracleAnnotator::new(store, self.annotation_client());
        self.detect_with(frames, &annotator).await
    }

    /// Run the whole pipeline and write `custom_events.csv`
    pub async fn run(&self) -> Result<SessionSummary> {
        let recording = Recording::open(&self.config.recording_dir)?;
        info!(
            dir = %recording.dir.display(),
            video = %recording.video.display(),
            "Starting session"
        );

        let overlay = prepare_overlay(&recording, &self.config.render, &self.cancel).await?;
        let (frames, store) = extract_frames(&recording, &self.config.render, &self.cancel).await?;

        let (sampler, emitted) = if self.cancel.load(Ordering::SeqCst) {
            warn!("Session cancelled before sampling");
            let report = SamplerReport {
                cancelled: true,
                ..Default::default()
            };
            (report, Vec::new())
        } else {
            self.detect_frames(&frames, store).await
        };

        let events_csv = recording.output_path(EVENTS_TABLE);
        write_events(&events_csv, &emitted)?;
        info!(
            events = emitted.len(),
            oracle_calls = sampler.oracle_calls,
            path = %events_csv.display(),
            "Session complete"
        );

        Ok(SessionSummary {
            overlay,
            frames: frames.len(),
            sampler,
            emitted,
            events_csv,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{DetectionEvent, EventMode};
    use async_trait::async_trait;

    struct Silent;

    #[async_trait]
    impl OracleTransport for Silent {
        async fn complete(&self, _body: &serde_json::Value) -> crate::detect::OracleReply {
            crate::detect::OracleReply::TransportError("offline".into())
        }
    }

    struct FixedAnnotator(&'static str);

    #[async_trait]
    impl FrameAnnotator for FixedAnnotator {
        async fn annotate(&self, frame: &FrameRecord) -> Vec<DetectionEvent> {
            vec![DetectionEvent {
                frame_id: frame.frame_index,
                timestamp_s: frame.timestamp_s,
                code: self.0.to_string(),
            }]
        }
    }

    fn config() -> SessionConfig {
        let mut config = SessionConfig::default();
        config.activities.descriptions = vec!["Typing".into()];
        config.activities.codes = vec!["typing".into()];
        config.activities.mode = EventMode::Paired;
        config.sampling.batch_size = 4;
        config
    }

    fn row(i: u64) -> FrameRecord {
        FrameRecord {
            frame_index: i,
            pts: i,
            timestamp_ns: 1_000 + i,
            timestamp_s: i as f64 / 30.0,
            gaze_x: None,
            gaze_y: None,
        }
    }

    fn session(config: SessionConfig) -> Session {
        Session::with_backends(config, Arc::new(Silent), Arc::new(NullSink), Arc::new(TokioSleeper))
            .unwrap()
    }

    #[tokio::test]
    async fn test_detect_with_emits_once() {
        let frames: Vec<_> = (0..8).map(row).collect();
        let (report, emitted) = session(config())
            .detect_with(&frames, &FixedAnnotator("start_typing"))
            .await;

        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].frame_id, 2);
        // Two batches, each walking to its first frame
        assert_eq!(report.visited, vec![2, 1, 0, 6, 5, 4]);
    }

    #[tokio::test]
    async fn test_cancelled_session_makes_no_calls() {
        let session = session(config());
        session.cancel_flag().store(true, Ordering::SeqCst);

        let frames: Vec<_> = (0..8).map(row).collect();
        let (report, emitted) = session.detect_with(&frames, &FixedAnnotator("start_typing")).await;

        assert!(report.cancelled);
        assert_eq!(report.oracle_calls, 0);
        assert!(emitted.is_empty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = config();
        config.sampling.batch_size = 0;
        let result =
            Session::with_backends(config, Arc::new(Silent), Arc::new(NullSink), Arc::new(TokioSleeper));
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_new_requires_cloud_ids() {
        assert!(matches!(Session::new(config()), Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_attach_merged_carries_time_and_gaze() {
        let mut table: Vec<_> = (0..3).map(row).collect();
        let merged: Vec<_> = (0..2)
            .map(|i| FrameRecord {
                timestamp_ns: 5_000 + i,
                timestamp_s: 10.0 + i as f64,
                gaze_x: Some(1.0),
                gaze_y: Some(2.0),
                ..row(i)
            })
            .collect();

        attach_merged(&mut table, &merged);

        assert!((table[1].timestamp_s - 11.0).abs() < f64::EPSILON);
        assert_eq!(table[1].gaze(), Some((1.0, 2.0)));
    }

    #[test]
    fn test_attach_merged_drops_frames_without_recording_time() {
        // Overlay clock: 0.0, 0.033, ...; recording clock starts at 10 s
        let mut table: Vec<_> = (0..5).map(row).collect();
        let merged: Vec<_> = (0..3)
            .map(|i| FrameRecord {
                timestamp_s: 10.0 + i as f64,
                ..row(i)
            })
            .collect();

        attach_merged(&mut table, &merged);

        assert_eq!(table.len(), 3);
        assert!(table.iter().all(|r| r.timestamp_s >= 10.0));
    }

    #[tokio::test]
    async fn test_prepare_overlay_reuses_existing_video() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("scene.mp4"), b"").unwrap();
        std::fs::write(dir.path().join(crate::recording::OVERLAY_VIDEO), b"").unwrap();

        let recording = Recording::open(dir.path()).unwrap();
        let cancel = Arc::new(AtomicBool::new(false));
        let outcome = prepare_overlay(&recording, &RenderConfig::default(), &cancel)
            .await
            .unwrap();

        assert!(outcome.cached);
        assert!(outcome.report.is_none());
        assert!(!dir.path().join(MERGED_TABLE).exists());
    }
}

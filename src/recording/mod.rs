//! Recording tables: gaze samples, world timestamps and fused frame rows
//!
//! A recording directory (as exported from the cloud) contains:
//! - one scene video (`*.mp4`)
//! - `gaze.csv` with `timestamp [ns]`, `gaze x [px]`, `gaze y [px]`
//! - `world_timestamps.csv` with one `timestamp [ns]` per scene frame
//!
//! Everything here is plain tabular I/O; the nearest-time join lives in
//! [`sync`].

pub mod sync;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

pub use sync::{align_world_timestamps, FrameTime, TimestampSynchronizer};

/// File name of the rendered gaze overlay video inside a recording dir
pub const OVERLAY_VIDEO: &str = "gaze_overlay.mp4";
/// File name of the fused frame + gaze table
pub const MERGED_TABLE: &str = "merged_gaze.csv";
/// File name of the frame table decoded from the overlay video
pub const FRAME_TABLE: &str = "frames.csv";
/// File name of the emitted events table
pub const EVENTS_TABLE: &str = "custom_events.csv";
/// Directory of per-frame JPEGs extracted from the overlay video
pub const FRAMES_DIR: &str = "frames";

const GAZE_CSV: &str = "gaze.csv";
const WORLD_TIMESTAMPS_CSV: &str = "world_timestamps.csv";

/// Recording I/O errors
#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("Missing recording file: {0}")]
    MissingFile(PathBuf),

    #[error("No scene video found in {0}")]
    NoVideo(PathBuf),
}

pub type Result<T> = std::result::Result<T, RecordingError>;

/// One row of the per-frame table.
///
/// Rows are ordered by `pts`; `frame_index` is dense after synchronization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub frame_index: u64,
    pub pts: u64,
    pub timestamp_ns: u64,
    pub timestamp_s: f64,
    pub gaze_x: Option<f64>,
    pub gaze_y: Option<f64>,
}

impl FrameRecord {
    /// Gaze coordinate, if both components are present and finite
    #[must_use]
    pub fn gaze(&self) -> Option<(f64, f64)> {
        match (self.gaze_x, self.gaze_y) {
            (Some(x), Some(y)) if x.is_finite() && y.is_finite() => Some((x, y)),
            _ => None,
        }
    }
}

/// A single gaze position sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GazeSample {
    pub timestamp_ns: u64,
    pub x: f64,
    pub y: f64,
}

/// Raw `gaze.csv` row. Extra export columns (worn, fixation id, ...) are ignored.
#[derive(Debug, Deserialize)]
struct GazeRow {
    #[serde(rename = "timestamp [ns]", alias = "timestamp_ns")]
    timestamp_ns: u64,
    #[serde(rename = "gaze x [px]", alias = "gaze_x_px")]
    x: Option<f64>,
    #[serde(rename = "gaze y [px]", alias = "gaze_y_px")]
    y: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WorldTimestampRow {
    #[serde(rename = "timestamp [ns]", alias = "timestamp_ns")]
    timestamp_ns: u64,
}

/// Paths of one unpacked recording
#[derive(Debug, Clone)]
pub struct Recording {
    pub dir: PathBuf,
    pub video: PathBuf,
    pub gaze_csv: PathBuf,
    pub world_timestamps_csv: PathBuf,
}

impl Recording {
    /// Locate the scene video and tables inside `dir`.
    ///
    /// The rendered overlay video is never picked as the scene video.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();

        let mut videos: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(std::result::Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("mp4")))
            .filter(|p| {
                p.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name != OVERLAY_VIDEO && !name.starts_with('.'))
            })
            .collect();
        videos.sort();

        let video = videos
            .into_iter()
            .next()
            .ok_or_else(|| RecordingError::NoVideo(dir.clone()))?;

        let gaze_csv = dir.join(GAZE_CSV);
        let world_timestamps_csv = dir.join(WORLD_TIMESTAMPS_CSV);

        Ok(Self {
            dir,
            video,
            gaze_csv,
            world_timestamps_csv,
        })
    }

    #[must_use]
    pub fn overlay_path(&self) -> PathBuf {
        self.dir.join(OVERLAY_VIDEO)
    }

    #[must_use]
    pub fn output_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Read gaze samples, dropping rows without a coordinate
    pub fn read_gaze(&self) -> Result<Vec<GazeSample>> {
        let rows: Vec<GazeRow> = read_table(&self.gaze_csv)?;
        let total = rows.len();

        let samples: Vec<GazeSample> = rows
            .into_iter()
            .filter_map(|row| match (row.x, row.y) {
                (Some(x), Some(y)) => Some(GazeSample {
                    timestamp_ns: row.timestamp_ns,
                    x,
                    y,
                }),
                _ => None,
            })
            .collect();

        if samples.len() < total {
            debug!(
                dropped = total - samples.len(),
                "Gaze rows without coordinates skipped"
            );
        }
        if samples.is_empty() {
            warn!(path = %self.gaze_csv.display(), "Gaze stream is empty");
        }

        Ok(samples)
    }

    /// Read the per-frame world timestamps in file order
    pub fn read_world_timestamps(&self) -> Result<Vec<u64>> {
        let rows: Vec<WorldTimestampRow> = read_table(&self.world_timestamps_csv)?;
        Ok(rows.into_iter().map(|r| r.timestamp_ns).collect())
    }
}

/// Read a headed CSV file into typed rows
pub fn read_table<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Err(RecordingError::MissingFile(path.to_path_buf()));
    }

    let csv_err = |source| RecordingError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(csv_err)?;

    reader
        .deserialize()
        .collect::<std::result::Result<Vec<T>, _>>()
        .map_err(csv_err)
}

/// Write typed rows as a headed CSV file, replacing any existing file
pub fn write_table<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let csv_err = |source| RecordingError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut writer = csv::Writer::from_path(path).map_err(csv_err)?;
    for row in rows {
        writer.serialize(row).map_err(csv_err)?;
    }
    writer.flush()?;
    Ok(())
}

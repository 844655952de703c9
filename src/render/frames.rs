//! Decoding the overlay video into a frame table and JPEG frame store
//!
//! The sampler only ever looks at a handful of frames, but it needs random
//! access by frame index, so every frame is decoded once and kept on disk as
//! a small JPEG.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};

use super::{FfmpegDecoder, FrameSource, RenderConfig, RenderError, Result, VideoProbe};
use crate::recording::FrameRecord;

/// Directory of per-frame JPEGs, addressed by frame index
#[derive(Debug, Clone)]
pub struct FrameStore {
    dir: PathBuf,
}

impl FrameStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn path_for(&self, index: u64) -> PathBuf {
        self.dir.join(format!("frame_{index:06}.jpg"))
    }

    /// JPEG bytes of frame `index`
    pub async fn load(&self, index: u64) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(self.path_for(index)).await
    }

    /// True when every frame `0..count` is present
    #[must_use]
    pub fn is_complete(&self, count: usize) -> bool {
        count > 0 && (0..count as u64).all(|i| self.path_for(i).is_file())
    }

    #[must_use]
    pub fn stamp_path(&self) -> PathBuf {
        self.dir.join(STAMP_FILE)
    }

    /// Stamp of the video the stored frames were decoded from
    pub async fn read_stamp(&self) -> Option<SourceStamp> {
        let bytes = tokio::fs::read(self.stamp_path()).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub async fn write_stamp(&self, stamp: &SourceStamp) -> Result<()> {
        tokio::fs::write(self.stamp_path(), serde_json::to_vec_pretty(stamp)?).await?;
        Ok(())
    }

    /// True when the store holds every frame of exactly this source
    pub async fn is_current(&self, stamp: &SourceStamp) -> bool {
        self.read_stamp().await.as_ref() == Some(stamp) && self.is_complete(stamp.frames)
    }

    /// Remove every stored frame and the stamp
    pub async fn clear(&self) -> std::io::Result<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

const STAMP_FILE: &str = "source.json";

/// Identity of the video a [`FrameStore`] was filled from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStamp {
    pub source: PathBuf,
    pub len: u64,
    pub modified_ns: Option<u64>,
    pub frames: usize,
}

impl SourceStamp {
    pub async fn of(video: &Path, frames: usize) -> Result<Self> {
        let metadata = tokio::fs::metadata(video).await?;
        let modified_ns = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .and_then(|d| u64::try_from(d.as_nanos()).ok());
        let source = tokio::fs::canonicalize(video)
            .await
            .unwrap_or_else(|_| video.to_path_buf());

        Ok(Self {
            source,
            len: metadata.len(),
            modified_ns,
            frames,
        })
    }
}

/// Decodes a video into its frame table plus a [`FrameStore`]
pub struct FrameExtractor {
    config: RenderConfig,
    cancel: Option<Arc<AtomicBool>>,
}

impl FrameExtractor {
    #[must_use]
    pub fn new(config: RenderConfig) -> Self {
        Self {
            config,
            cancel: None,
        }
    }

    /// Stop between frames once `cancel` is raised
    #[must_use]
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.load(Ordering::SeqCst))
    }

    /// Extract all frames of `video` into `store`.
    ///
    /// Returns the frame table (sorted by pts, timestamps relative to stream
    /// start). A store stamped with this exact video is reused as is; any
    /// other content is cleared and decoded again.
    pub async fn extract(&self, video: &Path, store: &FrameStore) -> Result<Vec<FrameRecord>> {
        let probe = VideoProbe::run(&self.config.ffprobe_path, video).await?;
        let mut table = probe.frame_table();

        let stamp = SourceStamp::of(video, table.len()).await?;
        if store.is_current(&stamp).await {
            info!(frames = table.len(), dir = %store.dir().display(), "Reusing extracted frames");
            return Ok(table);
        }

        if store.dir().exists() {
            warn!(dir = %store.dir().display(), "Stored frames belong to another video, extracting again");
        }
        store.clear().await?;
        tokio::fs::create_dir_all(store.dir()).await?;

        // Decoder order may differ from pts order; file names follow the sorted table.
        let mut index_of_pts: Vec<(u64, u64)> =
            table.iter().map(|r| (r.pts, r.frame_index)).collect();
        index_of_pts.sort_unstable();

        let mut decoder = FfmpegDecoder::spawn(&self.config, video, &probe)?;
        let mut written = 0usize;

        while let Some(frame) = decoder.next_frame().await? {
            if self.cancelled() {
                warn!(frames = written, "Frame extraction cancelled");
                return Err(RenderError::Cancelled);
            }
            let Ok(slot) = index_of_pts.binary_search_by_key(&frame.pts, |&(pts, _)| pts) else {
                warn!(pts = frame.pts, "Decoded frame has no table row, skipping");
                continue;
            };
            let index = index_of_pts[slot].1;

            let jpeg = encode_jpeg(&frame.image, self.config.image_max_dim, self.config.jpeg_quality)?;
            tokio::fs::write(store.path_for(index), jpeg).await?;
            written += 1;

            if written % 500 == 0 {
                debug!(frames = written, "Extracting frames...");
            }
        }

        if written < table.len() {
            warn!(
                expected = table.len(),
                decoded = written,
                "Fewer frames decoded than probed, truncating table"
            );
            table.truncate(written);
        }

        store
            .write_stamp(&SourceStamp {
                frames: table.len(),
                ..stamp
            })
            .await?;

        info!(frames = written, dir = %store.dir().display(), "Extracted frames");
        Ok(table)
    }
}

/// Downscale so the longest side is at most `max_dim`, then JPEG-encode
pub fn encode_jpeg(image: &RgbImage, max_dim: u32, quality: u8) -> Result<Vec<u8>> {
    let (w, h) = image.dimensions();
    let longest = w.max(h);

    let resized;
    let source = if max_dim > 0 && longest > max_dim {
        let scale = f64::from(max_dim) / f64::from(longest);
        let nw = ((f64::from(w) * scale).round() as u32).max(1);
        let nh = ((f64::from(h) * scale).round() as u32).max(1);
        resized = imageops::resize(image, nw, nh, FilterType::Triangle);
        &resized
    } else {
        image
    };

    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100)).encode_image(source)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_jpeg_bounds_longest_side() {
        let image = RgbImage::new(1600, 1200);
        let jpeg = encode_jpeg(&image, 768, 85).unwrap();

        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.width(), 768);
        assert_eq!(decoded.height(), 576);
    }

    #[test]
    fn test_encode_jpeg_small_image_untouched() {
        let image = RgbImage::new(320, 240);
        let jpeg = encode_jpeg(&image, 768, 85).unwrap();

        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (320, 240));
    }

    #[tokio::test]
    async fn test_frame_store_paths_and_completeness() {
        let dir = tempfile::tempdir().unwrap();
        let store = FrameStore::new(dir.path());

        assert!(!store.is_complete(0));
        assert!(!store.is_complete(2));

        std::fs::write(store.path_for(0), b"a").unwrap();
        std::fs::write(store.path_for(1), b"b").unwrap();
        assert!(store.is_complete(2));
        assert_eq!(store.load(1).await.unwrap(), b"b");
        assert!(store.path_for(12).ends_with("frame_000012.jpg"));
    }

    fn filled_store(dir: &Path, frames: usize) -> FrameStore {
        let store = FrameStore::new(dir.join("frames"));
        std::fs::create_dir_all(store.dir()).unwrap();
        for i in 0..frames as u64 {
            std::fs::write(store.path_for(i), b"jpeg").unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_store_is_current_only_for_its_own_video() {
        let dir = tempfile::tempdir().unwrap();
        let scene = dir.path().join("scene.mp4");
        let overlay = dir.path().join("gaze_overlay.mp4");
        std::fs::write(&scene, b"scene video").unwrap();
        std::fs::write(&overlay, b"overlay video").unwrap();

        let store = filled_store(dir.path(), 2);
        let scene_stamp = SourceStamp::of(&scene, 2).await.unwrap();
        let overlay_stamp = SourceStamp::of(&overlay, 2).await.unwrap();

        // Complete but unstamped
        assert!(!store.is_current(&overlay_stamp).await);

        store.write_stamp(&scene_stamp).await.unwrap();
        assert!(store.is_current(&scene_stamp).await);
        assert!(!store.is_current(&overlay_stamp).await);
        assert!(!store.is_current(&SourceStamp { frames: 3, ..scene_stamp.clone() }).await);

        // Same path, rewritten content
        std::fs::write(&scene, b"a re-exported scene video").unwrap();
        assert!(!store.is_current(&SourceStamp::of(&scene, 2).await.unwrap()).await);
    }

    #[tokio::test]
    async fn test_clear_removes_frames_and_stamp() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("scene.mp4");
        std::fs::write(&video, b"video").unwrap();

        let store = filled_store(dir.path(), 2);
        store.write_stamp(&SourceStamp::of(&video, 2).await.unwrap()).await.unwrap();

        store.clear().await.unwrap();
        assert!(!store.dir().exists());
        assert!(store.read_stamp().await.is_none());
        // Clearing twice is fine
        store.clear().await.unwrap();
    }

    /// Fake ffprobe reporting two 64x48 frames
    #[cfg(unix)]
    fn fake_ffprobe(dir: &Path) -> String {
        use std::os::unix::fs::PermissionsExt;

        let json = r#"{"streams":[{"width":64,"height":48,"time_base":"1/90000","start_pts":0}],"frames":[{"pts":0},{"pts":3000}]}"#;
        let path = dir.join("ffprobe");
        std::fs::write(&path, format!("#!/bin/sh\necho '{json}'\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_extract_does_not_reuse_frames_of_another_video() {
        let dir = tempfile::tempdir().unwrap();
        let scene = dir.path().join("scene.mp4");
        let overlay = dir.path().join("gaze_overlay.mp4");
        std::fs::write(&scene, b"scene video").unwrap();
        std::fs::write(&overlay, b"overlay video").unwrap();

        let store = filled_store(dir.path(), 2);
        store.write_stamp(&SourceStamp::of(&scene, 2).await.unwrap()).await.unwrap();

        let config = RenderConfig {
            ffprobe_path: fake_ffprobe(dir.path()),
            ffmpeg_path: dir.path().join("missing-ffmpeg").to_string_lossy().to_string(),
            ..RenderConfig::default()
        };
        let extractor = FrameExtractor::new(config);

        // Stale scene frames are dropped and the decoder is required
        let err = extractor.extract(&overlay, &store).await.unwrap_err();
        assert!(matches!(err, RenderError::Open { .. }), "{err}");
        assert!(!store.path_for(0).exists());

        // The matching video still hits the cache without ffmpeg
        let store = filled_store(dir.path(), 2);
        store.write_stamp(&SourceStamp::of(&overlay, 2).await.unwrap()).await.unwrap();
        let table = extractor.extract(&overlay, &store).await.unwrap();
        assert_eq!(table.len(), 2);
    }
}

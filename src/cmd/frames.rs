use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};

use gazecode::recording::{FRAMES_DIR, FRAME_TABLE};
use gazecode::session::extract_video_frames;
use gazecode::SessionConfig;

pub async fn cmd_frames(config: SessionConfig, video: &Path, out: Option<&Path>) -> Result<()> {
    let out_dir = out.map_or_else(|| default_out_dir(video), Path::to_path_buf);
    tokio::fs::create_dir_all(&out_dir)
        .await
        .with_context(|| format!("cannot create {}", out_dir.display()))?;

    eprintln!("🎬 Extracting frames: {}", video.display());

    let cancel = Arc::new(AtomicBool::new(false));
    super::cancel_on_ctrl_c(Arc::clone(&cancel));

    let (table, _store) = extract_video_frames(video, &out_dir, &config.render, &cancel).await?;

    println!("🖼  {} frames → {}", table.len(), out_dir.join(FRAMES_DIR).display());
    println!("📊 Frame table: {}", out_dir.join(FRAME_TABLE).display());
    if let Some(last) = table.last() {
        println!("   Duration: {:.2}s", last.timestamp_s);
    }

    Ok(())
}

/// `<video stem>_frames/` next to the video, so a recording's own frames are never touched
fn default_out_dir(video: &Path) -> PathBuf {
    let stem = video
        .file_stem()
        .map_or_else(|| "video".into(), |s| s.to_string_lossy());
    video
        .parent()
        .unwrap_or_else(|| Path::new(""))
        .join(format!("{stem}_frames"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_out_dir_is_per_video() {
        assert_eq!(
            default_out_dir(Path::new("rec/scene camera.mp4")),
            Path::new("rec/scene camera_frames")
        );
        assert_eq!(default_out_dir(Path::new("clip.mp4")), Path::new("clip_frames"));
    }
}

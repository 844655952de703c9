use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};

use gazecode::recording::MERGED_TABLE;
use gazecode::session::prepare_overlay;
use gazecode::{Recording, SessionConfig};

pub async fn cmd_render(config: SessionConfig, recording: &Path) -> Result<()> {
    config.validate()?;

    let recording = Recording::open(recording)
        .with_context(|| format!("cannot open recording {}", recording.display()))?;

    eprintln!("🎬 Rendering gaze overlay: {}", recording.video.display());

    let cancel = Arc::new(AtomicBool::new(false));
    super::cancel_on_ctrl_c(Arc::clone(&cancel));

    let outcome = prepare_overlay(&recording, &config.render, &cancel).await?;

    match outcome.report {
        None => println!("🎞  {} already exists, nothing to do", outcome.path.display()),
        Some(report) => {
            println!("📊 Merged table: {}", recording.output_path(MERGED_TABLE).display());
            println!(
                "🎞  {}: {} frames ({} reused, {} substituted)",
                outcome.path.display(),
                report.frames_written,
                report.reused_frames,
                report.substituted_frames
            );
            if report.truncated {
                println!(
                    "⚠️  Scene video ended after {} of {} rows",
                    report.frames_written, report.rows
                );
            }
        }
    }

    Ok(())
}

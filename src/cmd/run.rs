use anyhow::{Context, Result};

use gazecode::config::split_list;
use gazecode::{Session, SessionConfig, SessionSummary};

use crate::{OutputFormat, RunArgs};

pub async fn cmd_run(mut config: SessionConfig, args: RunArgs) -> Result<()> {
    let format = args.format;
    apply_args(&mut config, args);

    eprintln!("👁  Recording: {}", config.recording_dir.display());
    eprintln!(
        "   Activities: {} ({:?})",
        config.activities.codes.join(", "),
        config.activities.mode
    );
    if config.dry_run {
        eprintln!("   Dry run: events are written to CSV only");
    }

    let session = Session::new(config).context("invalid session configuration")?;

    // Emitted events are kept when sampling is cancelled
    super::cancel_on_ctrl_c(session.cancel_flag());

    let start = std::time::Instant::now();
    let summary = session.run().await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        OutputFormat::Text => print_summary(&summary, start.elapsed()),
    }

    Ok(())
}

fn apply_args(config: &mut SessionConfig, args: RunArgs) {
    config.recording_dir = args.recording;

    if let Some(descriptions) = args.descriptions {
        config.activities.descriptions = split_list(&descriptions);
    }
    if let Some(codes) = args.codes {
        config.activities.codes = split_list(&codes);
    }
    if let Some(mode) = args.mode {
        config.activities.mode = mode.into();
    }
    if let Some(workspace) = args.workspace {
        config.cloud.workspace_id = workspace;
    }
    if let Some(recording_id) = args.recording_id {
        config.cloud.recording_id = recording_id;
    }
    if let Some(batch_size) = args.batch_size {
        config.sampling.batch_size = batch_size;
    }
    if args.start.is_some() {
        config.sampling.window.start_s = args.start;
    }
    if args.end.is_some() {
        config.sampling.window.end_s = args.end;
    }
    if let Some(policy) = args.seen_codes {
        config.sampling.seen_codes = policy.into();
    }
    if let Some(model) = args.model {
        config.oracle.model = model;
    }
    config.dry_run |= args.dry_run;
}

fn print_summary(summary: &SessionSummary, elapsed: std::time::Duration) {
    if summary.overlay.cached {
        println!("🎞  Overlay: {} (cached)", summary.overlay.path.display());
    } else if let Some(report) = &summary.overlay.report {
        println!(
            "🎞  Overlay: {} ({} frames{})",
            summary.overlay.path.display(),
            report.frames_written,
            if report.truncated { ", truncated" } else { "" }
        );
    }

    let sampler = &summary.sampler;
    println!(
        "🔎 Sampled {} of {} frames in {} batches ({} outside window)",
        sampler.oracle_calls, summary.frames, sampler.batches, sampler.skipped_out_of_window
    );

    if summary.emitted.is_empty() {
        println!("   No events detected");
    }
    for event in &summary.emitted {
        println!(
            "   {:>8.2}s  frame {:<6} {}",
            event.timestamp_s, event.frame_id, event.code
        );
    }

    if sampler.cancelled {
        println!("⚠️  Cancelled before all batches were sampled");
    }
    println!(
        "💾 {} events → {} ({:.1}s)",
        summary.emitted.len(),
        summary.events_csv.display(),
        elapsed.as_secs_f64()
    );
}

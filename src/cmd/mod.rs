mod frames;
mod render;
mod run;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use frames::cmd_frames;
pub use render::cmd_render;
pub use run::cmd_run;

/// First Ctrl-C raises `cancel`, a second one exits immediately
pub(crate) fn cancel_on_ctrl_c(cancel: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        eprintln!("\n⏹  Cancelling... (Ctrl-C again to quit now)");
        cancel.store(true, Ordering::SeqCst);

        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
}

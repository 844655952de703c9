//! `gazecode` - Sparse event coding for eye-tracking recordings
//!
//! # Features
//!
//! - **Timestamp fusion**: nearest-time join of gaze samples onto scene video frames
//! - **Gaze overlay**: frame-accurate re-encoding of the scene video with a gaze marker
//! - **Sparse sampling**: midpoint bisection picks the few frames worth annotating
//! - **Vision annotation**: chat-completion oracle with rate-limit backoff
//! - **Event coding**: start/end deduplication, events posted to the cloud recording
//!
//! # Example
//!
//! ```rust,no_run
//! use gazecode::{Session, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = SessionConfig::load_default()?;
//!     config.apply_env();
//!     config.recording_dir = "recordings/2024-05-01_kitchen".into();
//!     config.dry_run = true;
//!
//!     let summary = Session::new(config)?.run().await?;
//!     println!("{} events after {} oracle calls", summary.emitted.len(), summary.sampler.oracle_calls);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod detect;
pub mod recording;
pub mod render;
pub mod session;

pub use config::{ActivityConfig, ConfigError, SessionConfig};
pub use detect::{
    ActivityStateMachine, AnnotationClient, DetectionEvent, EmittedEvent, EventMode,
    SparseEventSampler,
};
pub use recording::{FrameRecord, GazeSample, Recording, TimestampSynchronizer};
pub use render::{GazeOverlayRenderer, RenderConfig};
pub use session::{PipelineError, Session, SessionSummary};

/// Version of gazecode
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Sparse event detection
//!
//! - [`oracle`]: one annotation request per frame, with rate-limit backoff
//! - [`sampler`]: midpoint bisection choosing which frames to annotate
//! - [`state`]: start/end (or single-shot) deduplication of detections
//! - [`sink`]: forwarding accepted events to the cloud

pub mod oracle;
pub mod retry;
pub mod sampler;
pub mod sink;
pub mod state;

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::recording::{read_table, write_table};

pub use oracle::{
    ActivityPrompt, AnnotationClient, HttpOracle, OracleReply, OracleSettings, OracleTransport,
};
pub use retry::{RetryPolicy, Sleeper, TokioSleeper};
pub use sampler::{
    FrameAnnotator, OracleAnnotator, SamplerConfig, SamplerReport, SeenCodesPolicy,
    SparseEventSampler, TimeWindow,
};
pub use sink::{CloudEventSink, CloudSettings, EventSink, NullSink};
pub use state::{ActivityState, ActivityStateMachine, EventMode};

/// Annotation failures. All of them degrade to "no detection" at the sampler.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnnotationError {
    #[error("Rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Response did not match the detection grammar: {0}")]
    Parse(String),
}

/// Event sink failures. Logged, never fatal.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Event rejected with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(String),
}

/// One frame/code/timestamp triple reported by the oracle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub frame_id: u64,
    pub timestamp_s: f64,
    pub code: String,
}

/// A detection accepted by the state machine and forwarded to the sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmittedEvent {
    pub frame_id: u64,
    pub timestamp_s: f64,
    pub code: String,
}

impl From<&DetectionEvent> for EmittedEvent {
    fn from(d: &DetectionEvent) -> Self {
        Self {
            frame_id: d.frame_id,
            timestamp_s: d.timestamp_s,
            code: d.code.clone(),
        }
    }
}

const EVENTS_HEADER: &str = "frame_id,timestamp_s,code\n";

/// Write the emitted events table (`frame_id,timestamp_s,code`)
pub fn write_events(path: &Path, events: &[EmittedEvent]) -> crate::recording::Result<()> {
    if events.is_empty() {
        // No rows means serde never emits the header
        std::fs::write(path, EVENTS_HEADER)?;
        return Ok(());
    }
    write_table(path, events)
}

/// Read an emitted events table
pub fn read_events(path: &Path) -> crate::recording::Result<Vec<EmittedEvent>> {
    read_table(path)
}

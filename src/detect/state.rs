//! Per-activity deduplication of detections

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{DetectionEvent, EmittedEvent, EventSink};

const START_PREFIX: &str = "start_";
const END_PREFIX: &str = "end_";

/// How detections of an activity are turned into events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventMode {
    /// `start_<code>` / `end_<code>` pairs
    #[default]
    Paired,
    /// Bare `<code>`, emitted once per session
    SingleShot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityState {
    Inactive,
    Active,
    Unseen,
    Seen,
}

/// Outcome of feeding one code to the machine
#[derive(Debug, Clone, PartialEq, Eq)]
enum Decision {
    Accept { activity: String, next: ActivityState },
    Ignore,
    Unknown,
}

/// Tracks every configured activity and emits only valid transitions
pub struct ActivityStateMachine {
    mode: EventMode,
    states: HashMap<String, ActivityState>,
    sink: Arc<dyn EventSink>,
    emitted: Vec<EmittedEvent>,
}

impl ActivityStateMachine {
    pub fn new<I, S>(mode: EventMode, codes: I, sink: Arc<dyn EventSink>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let initial = match mode {
            EventMode::Paired => ActivityState::Inactive,
            EventMode::SingleShot => ActivityState::Unseen,
        };
        let states = codes.into_iter().map(|c| (c.into(), initial)).collect();

        Self {
            mode,
            states,
            sink,
            emitted: Vec::new(),
        }
    }

    #[must_use]
    pub fn mode(&self) -> EventMode {
        self.mode
    }

    #[must_use]
    pub fn state(&self, activity: &str) -> Option<ActivityState> {
        self.states.get(activity).copied()
    }

    /// Events accepted so far, in acceptance order
    #[must_use]
    pub fn emitted(&self) -> &[EmittedEvent] {
        &self.emitted
    }

    #[must_use]
    pub fn into_emitted(self) -> Vec<EmittedEvent> {
        self.emitted
    }

    fn decide(&self, code: &str) -> Decision {
        let (activity, allowed_from, next) = match self.mode {
            EventMode::Paired => {
                if let Some(activity) = code.strip_prefix(START_PREFIX) {
                    (activity, ActivityState::Inactive, ActivityState::Active)
                } else if let Some(activity) = code.strip_prefix(END_PREFIX) {
                    (activity, ActivityState::Active, ActivityState::Inactive)
                } else {
                    return Decision::Unknown;
                }
            }
            EventMode::SingleShot => (code, ActivityState::Unseen, ActivityState::Seen),
        };

        match self.states.get(activity) {
            None => Decision::Unknown,
            Some(&current) if current == allowed_from => Decision::Accept {
                activity: activity.to_string(),
                next,
            },
            Some(_) => Decision::Ignore,
        }
    }

    /// Feed one detection; returns true when it was emitted.
    ///
    /// An accepted transition is sent to the sink before this returns. Sink
    /// failures are logged and the transition stands.
    pub async fn observe(&mut self, detection: &DetectionEvent) -> bool {
        match self.decide(&detection.code) {
            Decision::Accept { activity, next } => {
                self.states.insert(activity, next);
                self.emitted.push(EmittedEvent::from(detection));
                info!(
                    code = %detection.code,
                    frame = detection.frame_id,
                    timestamp_s = detection.timestamp_s,
                    "Event accepted"
                );

                if let Err(e) = self.sink.send(&detection.code, detection.timestamp_s).await {
                    warn!(code = %detection.code, error = %e, "Failed to send event");
                }
                true
            }
            Decision::Ignore => {
                debug!(code = %detection.code, "Redundant transition ignored");
                false
            }
            Decision::Unknown => {
                warn!(code = %detection.code, "Unknown activity code ignored");
                false
            }
        }
    }
}

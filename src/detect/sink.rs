//! Forwarding accepted events to the cloud recording

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::SinkError;

const DEFAULT_BASE_URL: &str = "https://api.cloud.pupil-labs.com/v2";

/// Receives every event accepted by the state machine
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, code: &str, offset_s: f64) -> Result<(), SinkError>;
}

/// Cloud workspace/recording coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudSettings {
    pub base_url: String,
    pub workspace_id: String,
    pub recording_id: String,
    /// Usually taken from `PUPIL_CLOUD_TOKEN`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for CloudSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            workspace_id: String::new(),
            recording_id: String::new(),
            api_key: None,
        }
    }
}

impl CloudSettings {
    /// `{base}/workspaces/{workspace}/recordings/{recording}/events`
    #[must_use]
    pub fn events_url(&self) -> String {
        format!(
            "{}/workspaces/{}/recordings/{}/events",
            self.base_url.trim_end_matches('/'),
            self.workspace_id,
            self.recording_id
        )
    }
}

/// Posts each event to the recording's event list
pub struct CloudEventSink {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl CloudEventSink {
    pub fn new(settings: &CloudSettings) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SinkError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            url: settings.events_url(),
            api_key: settings.api_key.clone().unwrap_or_default(),
        })
    }
}

#[async_trait]
impl EventSink for CloudEventSink {
    async fn send(&self, code: &str, offset_s: f64) -> Result<(), SinkError> {
        let response = self
            .client
            .post(&self.url)
            .header("accept", "application/json")
            .header("api-key", &self.api_key)
            .json(&serde_json::json!({ "name": code, "offset_s": offset_s }))
            .send()
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Status {
                status: status.as_u16(),
                body,
            });
        }

        info!(code, offset_s, "Event sent to cloud");
        Ok(())
    }
}

/// Discards events (dry runs)
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn send(&self, code: &str, offset_s: f64) -> Result<(), SinkError> {
        debug!(code, offset_s, "Dry run, event not sent");
        Ok(())
    }
}

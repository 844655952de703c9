//! Vision-model annotation of single frames
//!
//! One chat-completion request per frame. The model is told which activities
//! to look for and answers in a line grammar:
//!
//! ```text
//! Frame 412: Timestamp - 13.73, Code - start_cutting_pepper
//! ```
//!
//! Rate limiting (HTTP 429) is retried with exponential backoff; every other
//! failure degrades to "no detection".

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::retry::{Attempt, RetryPolicy, Sleeper};
use super::state::EventMode;
use super::{AnnotationError, DetectionEvent};
use crate::recording::FrameRecord;

const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

/// The oracle's explicit "nothing here" code
const NO_DETECTION: &str = "None";

static DETECTION_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Frame\s+(\d+):\s*Timestamp\s*-\s*(\d+(?:\.\d+)?),\s*Code\s*-\s*(\w+)").unwrap()
});

/// Raw transport outcome of one request
#[derive(Debug, Clone, PartialEq)]
pub enum OracleReply {
    /// 200 with the assistant message content
    Content(String),
    /// 429
    RateLimited,
    /// Anything else: network failure, other status, malformed body
    TransportError(String),
}

/// Sends one chat-completion request body and classifies the reply
#[async_trait]
pub trait OracleTransport: Send + Sync {
    async fn complete(&self, body: &serde_json::Value) -> OracleReply;
}

/// Oracle connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleSettings {
    pub endpoint: String,
    pub model: String,
    /// Bearer credential; usually taken from `OPENAI_API_KEY`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: "gpt-4o".to_string(),
            api_key: None,
            max_tokens: 300,
            timeout_secs: 60,
        }
    }
}

/// HTTP transport for an OpenAI-compatible chat-completion endpoint
pub struct HttpOracle {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpOracle {
    pub fn new(settings: &OracleSettings) -> Result<Self, AnnotationError> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .gzip(true)
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| AnnotationError::Transport(e.to_string()))?;

        if settings.api_key.is_none() {
            warn!("No oracle API key configured, requests will be unauthenticated");
        }

        Ok(Self {
            client,
            endpoint: settings.endpoint.clone(),
            api_key: settings.api_key.clone(),
        })
    }
}

#[async_trait]
impl OracleTransport for HttpOracle {
    async fn complete(&self, body: &serde_json::Value) -> OracleReply {
        let mut request = self.client.post(&self.endpoint).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => return OracleReply::TransportError(e.to_string()),
        };

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return OracleReply::RateLimited;
        }
        if !status.is_success() {
            let error = response.text().await.unwrap_or_default();
            return OracleReply::TransportError(format!("Oracle returned {status}: {error}"));
        }

        let payload: serde_json::Value = match response.json().await {
            Ok(v) => v,
            Err(e) => return OracleReply::TransportError(e.to_string()),
        };

        match payload["choices"][0]["message"]["content"].as_str() {
            Some(content) => OracleReply::Content(content.to_string()),
            None => OracleReply::TransportError("Response has no message content".to_string()),
        }
    }
}

/// The activities a session asks the oracle about
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ActivityPrompt {
    pub descriptions: Vec<String>,
    pub codes: Vec<String>,
    pub mode: EventMode,
}

impl ActivityPrompt {
    #[must_use]
    pub fn new(descriptions: Vec<String>, codes: Vec<String>, mode: EventMode) -> Self {
        Self {
            descriptions,
            codes,
            mode,
        }
    }

    /// System instruction listing every activity and the codes to answer with
    #[must_use]
    pub fn system_instruction(&self) -> String {
        let mut text = String::from(
            "You are an expert annotator of egocentric eye-tracking video. \
             Each frame shows the wearer's view; the red circle marks where they are looking.\n\n\
             Activities to detect:\n",
        );

        for (description, code) in self.descriptions.iter().zip(&self.codes) {
            match self.mode {
                EventMode::Paired => text.push_str(&format!(
                    "- {description}: report start_{code} when it begins, end_{code} when it ends\n"
                )),
                EventMode::SingleShot => {
                    text.push_str(&format!("- {description}: report {code} when it occurs\n"));
                }
            }
        }

        text.push_str(
            "\nAnswer with one line per detected activity, exactly in this form:\n\
             Frame <frame_id>: Timestamp - <timestamp_s>, Code - <code>\n\
             Use the frame_id and timestamp_s from the frame metadata. \
             If none of the activities is visible, answer with Code - None.",
        );
        text
    }
}

/// One annotation request per frame, with rate-limit backoff
pub struct AnnotationClient {
    transport: Arc<dyn OracleTransport>,
    sleeper: Arc<dyn Sleeper>,
    retry: RetryPolicy,
    model: String,
    max_tokens: u32,
    instruction: String,
}

impl AnnotationClient {
    #[must_use]
    pub fn new(
        transport: Arc<dyn OracleTransport>,
        sleeper: Arc<dyn Sleeper>,
        retry: RetryPolicy,
        settings: &OracleSettings,
        prompt: &ActivityPrompt,
    ) -> Self {
        Self {
            transport,
            sleeper,
            retry,
            model: settings.model.clone(),
            max_tokens: settings.max_tokens,
            instruction: prompt.system_instruction(),
        }
    }

    /// Chat-completion request for one JPEG frame
    #[must_use]
    pub fn build_request(&self, jpeg: &[u8], frame: &FrameRecord) -> serde_json::Value {
        let metadata = serde_json::json!({
            "frame_id": frame.frame_index,
            "timestamp_s": frame.timestamp_s,
            "gaze_x": frame.gaze_x,
            "gaze_y": frame.gaze_y,
        });

        serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [
                {
                    "role": "system",
                    "content": self.instruction
                },
                {
                    "role": "user",
                    "content": format!("Frame metadata: {metadata}")
                },
                {
                    "role": "user",
                    "content": [{
                        "type": "image_url",
                        "image_url": {
                            "url": format!("data:image/jpeg;base64,{}", base64_encode(jpeg))
                        }
                    }]
                }
            ]
        })
    }

    /// Annotate one frame, surfacing why nothing was detected
    pub async fn try_annotate(
        &self,
        jpeg: &[u8],
        frame: &FrameRecord,
    ) -> Result<Vec<DetectionEvent>, AnnotationError> {
        let body = self.build_request(jpeg, frame);
        let transport = &self.transport;
        let body = &body;

        let content = self
            .retry
            .run(self.sleeper.as_ref(), |attempt| async move {
                debug!(frame = frame.frame_index, attempt, "Requesting annotation");
                match transport.complete(body).await {
                    OracleReply::Content(content) => Attempt::Ready(content),
                    OracleReply::RateLimited => Attempt::RateLimited,
                    OracleReply::TransportError(reason) => Attempt::Failed(reason),
                }
            })
            .await?;

        debug!(frame = frame.frame_index, content = %content, "Oracle response");
        parse_response(&content)
    }

    /// Annotate one frame; any failure is logged and reported as no detection
    pub async fn annotate(&self, jpeg: &[u8], frame: &FrameRecord) -> Vec<DetectionEvent> {
        match self.try_annotate(jpeg, frame).await {
            Ok(detections) => {
                if !detections.is_empty() {
                    info!(
                        frame = frame.frame_index,
                        codes = ?detections.iter().map(|d| d.code.as_str()).collect::<Vec<_>>(),
                        "Activity detected"
                    );
                }
                detections
            }
            Err(e) => {
                warn!(frame = frame.frame_index, error = %e, "Annotation failed, treating as no detection");
                Vec::new()
            }
        }
    }
}

/// Extract every detection line from an oracle response.
///
/// `Code - None` lines are valid but carry no detection. A response without a
/// single matching line is a parse error.
pub fn parse_response(content: &str) -> Result<Vec<DetectionEvent>, AnnotationError> {
    let mut matched = false;
    let mut detections = Vec::new();

    for caps in DETECTION_LINE.captures_iter(content) {
        matched = true;

        let code = &caps[3];
        if code == NO_DETECTION {
            continue;
        }

        let (Ok(frame_id), Ok(timestamp_s)) = (caps[1].parse::<u64>(), caps[2].parse::<f64>()) else {
            warn!(line = &caps[0], "Unparseable detection line");
            continue;
        };

        detections.push(DetectionEvent {
            frame_id,
            timestamp_s,
            code: code.to_string(),
        });
    }

    if !matched {
        let snippet: String = content.chars().take(120).collect();
        return Err(AnnotationError::Parse(snippet));
    }
    Ok(detections)
}

/// Base64 encode bytes
fn base64_encode(data: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

    let mut result = String::with_capacity(data.len().div_ceil(3) * 4);

    for chunk in data.chunks(3) {
        let b0 = usize::from(chunk[0]);
        let b1 = usize::from(chunk.get(1).copied().unwrap_or(0));
        let b2 = usize::from(chunk.get(2).copied().unwrap_or(0));
        let combined = (b0 << 16) | (b1 << 8) | b2;

        result.push(char::from(ALPHABET[(combined >> 18) & 0x3F]));
        result.push(char::from(ALPHABET[(combined >> 12) & 0x3F]));
        result.push(if chunk.len() > 1 {
            char::from(ALPHABET[(combined >> 6) & 0x3F])
        } else {
            '='
        });
        result.push(if chunk.len() > 2 {
            char::from(ALPHABET[combined & 0x3F])
        } else {
            '='
        });
    }

    result
}

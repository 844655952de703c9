//! Session configuration loaded from `~/.config/gazecode/config.toml`.
//!
//! Every field has a default, so a config file only needs the values that
//! differ. Credentials are normally left out of the file and taken from the
//! environment (`OPENAI_API_KEY`, `PUPIL_CLOUD_TOKEN`).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::detect::{ActivityPrompt, CloudSettings, EventMode, OracleSettings, RetryPolicy, SamplerConfig};
use crate::render::RenderConfig;

pub const ORACLE_KEY_ENV: &str = "OPENAI_API_KEY";
pub const CLOUD_TOKEN_ENV: &str = "PUPIL_CLOUD_TOKEN";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// The activities to detect, one description per code
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityConfig {
    pub descriptions: Vec<String>,
    pub codes: Vec<String>,
    pub mode: EventMode,
}

impl ActivityConfig {
    #[must_use]
    pub fn prompt(&self) -> ActivityPrompt {
        ActivityPrompt::new(self.descriptions.clone(), self.codes.clone(), self.mode)
    }
}

/// Everything one detection session needs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Recording directory (video, `gaze.csv`, `world_timestamps.csv`)
    pub recording_dir: PathBuf,
    /// Skip the cloud sink; events are only written to CSV
    pub dry_run: bool,
    pub oracle: OracleSettings,
    pub cloud: CloudSettings,
    pub activities: ActivityConfig,
    pub sampling: SamplerConfig,
    pub retry: RetryPolicy,
    pub render: RenderConfig,
}

impl SessionConfig {
    /// Load a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Load the default config file, or defaults when it doesn't exist
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    /// Fill credentials missing from the file from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.oracle.api_key.is_none() {
            self.oracle.api_key = lookup(ORACLE_KEY_ENV).filter(|k| !k.is_empty());
        }
        if self.cloud.api_key.is_none() {
            self.cloud.api_key = lookup(CLOUD_TOKEN_ENV).filter(|k| !k.is_empty());
        }
    }

    /// Check settings shared by every subcommand
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sampling.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".into()));
        }
        if self.sampling.window.is_inverted() {
            return Err(ConfigError::Invalid(format!(
                "time window start ({:?}) is after its end ({:?})",
                self.sampling.window.start_s, self.sampling.window.end_s
            )));
        }
        if self.activities.descriptions.len() != self.activities.codes.len() {
            return Err(ConfigError::Invalid(format!(
                "{} activity descriptions for {} codes",
                self.activities.descriptions.len(),
                self.activities.codes.len()
            )));
        }
        if let Some(code) = self.activities.codes.iter().find(|c| !is_code_token(c)) {
            return Err(ConfigError::Invalid(format!(
                "activity code {code:?} must be a single word of letters, digits or underscores"
            )));
        }
        Ok(())
    }

    /// Additional checks before a detection run
    pub fn validate_for_detection(&self) -> Result<(), ConfigError> {
        self.validate()?;

        if self.activities.codes.is_empty() {
            return Err(ConfigError::Invalid("no activity codes configured".into()));
        }
        Url::parse(&self.oracle.endpoint)
            .map_err(|e| ConfigError::Invalid(format!("oracle endpoint: {e}")))?;

        if !self.dry_run {
            Url::parse(&self.cloud.base_url)
                .map_err(|e| ConfigError::Invalid(format!("cloud base URL: {e}")))?;
            if self.cloud.workspace_id.is_empty() || self.cloud.recording_id.is_empty() {
                return Err(ConfigError::Invalid(
                    "workspace and recording ids are required unless dry_run is set".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Return the path to the default config file.
#[must_use]
pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gazecode")
        .join("config.toml")
}

/// Split a `;`-separated list, trimming entries and dropping empty ones
#[must_use]
pub fn split_list(list: &str) -> Vec<String> {
    list.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Codes must survive the oracle's `Code - <token>` grammar
fn is_code_token(code: &str) -> bool {
    !code.is_empty() && code.chars().all(|c| c.is_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{SeenCodesPolicy, TimeWindow};

    fn with_activities(descriptions: &[&str], codes: &[&str]) -> SessionConfig {
        let mut config = SessionConfig::default();
        config.activities.descriptions = descriptions.iter().map(|s| (*s).to_string()).collect();
        config.activities.codes = codes.iter().map(|s| (*s).to_string()).collect();
        config
    }

    #[test]
    fn parse_empty_config() {
        let config: SessionConfig = toml::from_str("").unwrap();
        assert_eq!(config.oracle.model, "gpt-4o");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.sampling.seen_codes, SeenCodesPolicy::PerBatch);
        assert!(!config.dry_run);
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
recording_dir = "/data/rec1"
dry_run = true

[oracle]
model = "gpt-4o-mini"

[cloud]
workspace_id = "ws"
recording_id = "rec"

[activities]
descriptions = ["Cutting a pepper", "Washing hands"]
codes = ["cutting_pepper", "washing_hands"]
mode = "single_shot"

[sampling]
batch_size = 120
start_s = 2.5
end_s = 60.0
seen_codes = "session"

[retry]
max_attempts = 3

[render]
marker_radius = 15
"#;
        let config: SessionConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.recording_dir, PathBuf::from("/data/rec1"));
        assert_eq!(config.oracle.model, "gpt-4o-mini");
        assert_eq!(config.oracle.max_tokens, 300);
        assert_eq!(config.activities.mode, EventMode::SingleShot);
        assert_eq!(config.sampling.batch_size, 120);
        assert_eq!(config.sampling.window, TimeWindow::new(Some(2.5), Some(60.0)));
        assert_eq!(config.sampling.seen_codes, SeenCodesPolicy::Session);
        assert_eq!(config.retry.max_attempts, 3);
        assert!((config.retry.backoff_base_secs - 2.0).abs() < f64::EPSILON);
        assert_eq!(config.render.marker_radius, 15);
        assert!(config.validate_for_detection().is_ok());
    }

    #[test]
    fn load_reports_path_on_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "batch_size = [").unwrap();

        let err = SessionConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn env_fills_missing_keys_only() {
        let mut config = SessionConfig::default();
        config.cloud.api_key = Some("from-file".into());

        config.apply_env_from(|key| match key {
            ORACLE_KEY_ENV => Some("sk-test".into()),
            CLOUD_TOKEN_ENV => Some("from-env".into()),
            _ => None,
        });

        assert_eq!(config.oracle.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.cloud.api_key.as_deref(), Some("from-file"));
    }

    #[test]
    fn split_list_trims() {
        assert_eq!(
            split_list(" Cutting a pepper ;Washing hands; ;"),
            vec!["Cutting a pepper", "Washing hands"]
        );
        assert!(split_list("").is_empty());
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = with_activities(&["a"], &["a"]);
        config.sampling.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = with_activities(&["a"], &["a"]);
        config.sampling.window = TimeWindow::new(Some(10.0), Some(5.0));
        assert!(config.validate().is_err());

        assert!(with_activities(&["a", "b"], &["a"]).validate().is_err());
        assert!(with_activities(&["a"], &["two words"]).validate().is_err());
        assert!(with_activities(&["a"], &["ok_code"]).validate().is_ok());
    }

    #[test]
    fn detection_requires_cloud_ids_unless_dry_run() {
        let mut config = with_activities(&["a"], &["a"]);
        assert!(config.validate_for_detection().is_err());

        config.dry_run = true;
        assert!(config.validate_for_detection().is_ok());

        assert!(with_activities(&[], &[]).validate_for_detection().is_err());
    }
}

use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub const DEFAULT_TEMPERATURE: f64 = 0.8;
pub const DEFAULT_MAX_TOKENS: u64 = 4000;
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;
pub const DEFAULT_MIN_REQUEST_INTERVAL_MS: u64 = 500;

pub const ENV_API_BASE: &str = "KINDRED_API_BASE";
pub const ENV_API_KEY: &str = "KINDRED_API_KEY";
pub const ENV_MODEL: &str = "KINDRED_MODEL";

/// Connection settings for the chat-completion endpoint. Read-only from the
/// generation side; only the settings surface mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u64,
    pub timeout_seconds: u64,
    pub min_request_interval_ms: u64,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            model: String::new(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            min_request_interval_ms: DEFAULT_MIN_REQUEST_INTERVAL_MS,
        }
    }
}

impl ApiSettings {
    /// Name of the first required field that is empty, if any. Callers must
    /// refuse to touch the network while this returns `Some`.
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.endpoint.trim().is_empty() {
            return Some("endpoint");
        }
        if self.api_key.trim().is_empty() {
            return Some("api_key");
        }
        if self.model.trim().is_empty() {
            return Some("model");
        }
        None
    }

    /// Loads settings from an optional JSON file, then lets environment
    /// variables override the connection fields.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut settings = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|err| {
                    anyhow::anyhow!("failed to read settings file {}: {err}", path.display())
                })?;
                serde_json::from_str(&raw).map_err(|err| {
                    anyhow::anyhow!("invalid settings file {}: {err}", path.display())
                })?
            }
            None => Self::default(),
        };
        settings.overlay_env();
        Ok(settings)
    }

    pub fn overlay_env(&mut self) {
        if let Some(endpoint) = non_empty_env(ENV_API_BASE) {
            self.endpoint = endpoint;
        }
        if let Some(api_key) = non_empty_env(ENV_API_KEY) {
            self.api_key = api_key;
        }
        if let Some(model) = non_empty_env(ENV_MODEL) {
            self.model = model;
        }
    }
}

pub fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

//! Client configuration and channel URL derivation.

use crate::ApiError;

/// Default API base URL when nothing is configured.
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000/api";

/// Fixed route suffix for the push channel endpoint.
pub const CHANNEL_ROUTE: &str = "/ws/evaluations";

/// Environment variable for the API base URL.
const ENV_API_URL: &str = "APPRAISE_API_URL";

/// Environment variable overriding the derived channel URL.
const ENV_CHANNEL_URL: &str = "APPRAISE_CHANNEL_URL";

/// Configuration for the record API and push channel endpoints.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base URL of the records API, e.g. `https://appraise.example.com/api`.
    pub base_url: String,
    /// Explicit push channel URL. When `None`, derived from `base_url`.
    pub channel_url: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.to_string(),
            channel_url: None,
        }
    }
}

impl ApiConfig {
    /// Create a config for the given base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            channel_url: None,
        }
    }

    /// Override the derived channel URL.
    pub fn with_channel_url(mut self, url: impl Into<String>) -> Self {
        self.channel_url = Some(url.into());
        self
    }

    /// Load configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var(ENV_API_URL).unwrap_or_else(|_| DEFAULT_API_BASE_URL.to_string()),
            channel_url: std::env::var(ENV_CHANNEL_URL).ok(),
        }
    }

    /// The push channel URL: the explicit override if set, otherwise derived
    /// from the base URL.
    pub fn channel_url(&self) -> Result<String, ApiError> {
        match &self.channel_url {
            Some(url) => Ok(url.clone()),
            None => derive_channel_url(&self.base_url),
        }
    }
}

/// Derive the push channel URL from an HTTP base URL.
///
/// `http` becomes `ws`, `https` becomes `wss`, any trailing `/api` path and
/// trailing slashes are stripped, and the fixed channel route is appended.
pub fn derive_channel_url(base_url: &str) -> Result<String, ApiError> {
    let ws_base = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        return Err(ApiError::InvalidUrl(format!(
            "expected http:// or https:// scheme: {}",
            base_url
        )));
    };

    let trimmed = ws_base.trim_end_matches('/');
    let trimmed = trimmed.strip_suffix("/api").unwrap_or(trimmed);
    Ok(format!("{}{}", trimmed, CHANNEL_ROUTE))
}

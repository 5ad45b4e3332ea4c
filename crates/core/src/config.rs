use reqwest::Url;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
///
/// Both endpoints are optional here: a missing endpoint only becomes an error
/// when a session is actually requested.
#[derive(Clone, Debug)]
pub struct Config {
    /// Base URL of the token-issuing service.
    pub token_server_url: Option<Url>,
    /// WebSocket URL of the real-time media service.
    pub transport_url: Option<String>,
    /// Room base name used when the caller has no preference.
    pub room_name: String,
    pub participant_prefix: String,
    pub token_request_timeout: Duration,
    pub log_level: Level,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            token_server_url: None,
            transport_url: None,
            room_name: "farm-support-room".to_string(),
            participant_prefix: "farmer".to_string(),
            token_request_timeout: Duration::from_secs(10),
            log_level: Level::INFO,
        }
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let defaults = Self::default();

        let token_server_url = match non_empty_var("TOKEN_SERVER_URL") {
            Some(raw) => Some(parse_token_url(&raw)?),
            None => None,
        };

        let transport_url = match non_empty_var("LIVEKIT_WS_URL") {
            Some(raw) => Some(parse_transport_url(&raw)?),
            None => None,
        };

        let room_name = non_empty_var("ROOM_NAME").unwrap_or(defaults.room_name);
        let participant_prefix =
            non_empty_var("PARTICIPANT_PREFIX").unwrap_or(defaults.participant_prefix);

        let token_request_timeout = match non_empty_var("TOKEN_REQUEST_TIMEOUT_SECS") {
            Some(raw) => raw.parse::<u64>().map(Duration::from_secs).map_err(|e| {
                ConfigError::InvalidValue("TOKEN_REQUEST_TIMEOUT_SECS".to_string(), e.to_string())
            })?,
            None => defaults.token_request_timeout,
        };

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            token_server_url,
            transport_url,
            room_name,
            participant_prefix,
            token_request_timeout,
            log_level,
        })
    }

    /// Returns the token service URL or the variable that must be set.
    pub fn require_token_server_url(&self) -> Result<&Url, ConfigError> {
        self.token_server_url
            .as_ref()
            .ok_or_else(|| ConfigError::MissingVar("TOKEN_SERVER_URL".to_string()))
    }

    /// Returns the transport URL or the variable that must be set.
    pub fn require_transport_url(&self) -> Result<&str, ConfigError> {
        self.transport_url
            .as_deref()
            .ok_or_else(|| ConfigError::MissingVar("LIVEKIT_WS_URL".to_string()))
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_token_url(raw: &str) -> Result<Url, ConfigError> {
    // A dangling `?` is a common way of writing the base; the query is rebuilt per request.
    let trimmed = raw.strip_suffix('?').unwrap_or(raw);
    Url::parse(trimmed)
        .map_err(|e| ConfigError::InvalidValue("TOKEN_SERVER_URL".to_string(), e.to_string()))
}

fn parse_transport_url(raw: &str) -> Result<String, ConfigError> {
    let url = Url::parse(raw)
        .map_err(|e| ConfigError::InvalidValue("LIVEKIT_WS_URL".to_string(), e.to_string()))?;
    match url.scheme() {
        "ws" | "wss" => Ok(raw.to_string()),
        other => Err(ConfigError::InvalidValue(
            "LIVEKIT_WS_URL".to_string(),
            format!("expected a ws:// or wss:// URL, got scheme '{}'", other),
        )),
    }
}

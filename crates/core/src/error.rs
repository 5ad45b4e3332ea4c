//! Error kinds surfaced by the session core.
//!
//! Every failure on the connect path is converted into a [`SessionError`] by the
//! session manager after rollback, so callers only ever see one of these kinds.

use crate::{config::ConfigError, session::SessionState};
use reqwest::StatusCode;

/// Failure to obtain a session credential from the token-issuing service.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("token service responded with {status}{}", detail_suffix(.message))]
    Status {
        status: StatusCode,
        message: Option<String>,
    },
    #[error("token service returned a malformed body: {0}")]
    MalformedBody(String),
    #[error("token service response did not contain a token")]
    MissingToken,
}

fn detail_suffix(message: &Option<String>) -> String {
    message
        .as_deref()
        .map(|m| format!(": {m}"))
        .unwrap_or_default()
}

/// Failure while acquiring or publishing the local microphone track.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("microphone unavailable: {0}")]
    Capture(String),
    #[error("failed to publish local audio: {0}")]
    Publish(String),
}

/// The classified error returned by `connect()`.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("could not join the voice session: {0}")]
    TransportJoin(String),
    #[error("could not use the microphone: {0}")]
    Capture(String),
    #[error("a session is already {0}")]
    StateConflict(SessionState),
}

impl From<MediaError> for SessionError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::Capture(msg) => SessionError::Capture(msg),
            // The device worked; the transport refused the track.
            MediaError::Publish(msg) => SessionError::TransportJoin(msg),
        }
    }
}

/// A data-channel payload that could not be turned into transcript text.
///
/// Never leaves the relay; it exists so the drop can be logged with a reason.
#[derive(Debug, thiserror::Error)]
#[error("payload is not valid UTF-8: {0}")]
pub struct DecodeError(#[from] pub std::str::Utf8Error);

//! Session credential retrieval from the token-issuing service.

use crate::error::TokenError;
use async_trait::async_trait;
use reqwest::{Client, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// A short-lived access token scoped to one room and one participant.
///
/// Deliberately not `Clone`: it is moved into the transport join and gone afterwards.
pub struct Credential {
    token: SecretString,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: SecretString::from(token.into()),
        }
    }

    /// The raw token, for the transport adapter that presents it.
    pub fn expose(&self) -> &str {
        self.token.expose_secret()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

/// Anything that can mint a credential for a `(room, participant)` pair.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn fetch_credential(
        &self,
        room_identifier: &str,
        participant_identifier: &str,
    ) -> Result<Credential, TokenError>;
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
}

#[derive(Deserialize)]
struct TokenErrorBody {
    #[serde(alias = "detail", alias = "error")]
    message: Option<String>,
}

/// HTTP client for the token service: `GET <base>?room=<room>&user=<participant>`.
pub struct TokenClient {
    http: Client,
    base_url: Url,
}

impl TokenClient {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, TokenError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http, base_url })
    }

    /// Builds the request URL, replacing any query the base carried.
    pub fn request_url(&self, room_identifier: &str, participant_identifier: &str) -> Url {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .clear()
            .append_pair("room", room_identifier)
            .append_pair("user", participant_identifier);
        url
    }
}

#[async_trait]
impl CredentialProvider for TokenClient {
    #[instrument(skip(self))]
    async fn fetch_credential(
        &self,
        room_identifier: &str,
        participant_identifier: &str,
    ) -> Result<Credential, TokenError> {
        let url = self.request_url(room_identifier, participant_identifier);
        debug!(%url, "Requesting session credential");

        let response = self.http.get(url).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<TokenErrorBody>(&body)
                .ok()
                .and_then(|b| b.message);
            warn!(%status, ?message, "Token service rejected the request");
            return Err(TokenError::Status { status, message });
        }

        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| TokenError::MalformedBody(e.to_string()))?;
        match parsed.token {
            Some(token) if !token.is_empty() => Ok(Credential::new(token)),
            _ => Err(TokenError::MissingToken),
        }
    }
}

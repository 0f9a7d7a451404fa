// Authentication types

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::{AuthError, Result};

/// Persisted session credentials
///
/// A record always carries a non-empty access token and an absolute expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(with = "timestamp")]
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl TokenRecord {
    /// Build a record from a token endpoint response received at `now`
    pub fn from_response(response: TokenResponse, now: DateTime<Utc>) -> Result<Self> {
        if response.access_token.is_empty() {
            return Err(AuthError::InvalidResponse(
                "response contains an empty access_token".to_string(),
            ));
        }

        let expires_at = i64::try_from(response.expires_in)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .ok_or_else(|| {
                AuthError::InvalidResponse(format!(
                    "expires_in out of range: {}",
                    response.expires_in
                ))
            })?;

        Ok(Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token.filter(|t| !t.is_empty()),
            expires_at,
            scope: response.scope,
        })
    }

    /// Carry over fields a refresh response is allowed to omit
    pub fn inherit_from(mut self, previous: &TokenRecord) -> Self {
        if self.refresh_token.is_none() {
            self.refresh_token = previous.refresh_token.clone();
        }
        if self.scope.is_none() {
            self.scope = previous.scope.clone();
        }
        self
    }

    /// True once `now` is within `margin` of the expiry instant
    pub fn needs_refresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now >= self.expires_at - margin
    }

    /// Value for the `Authorization` header
    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.access_token)
    }

    /// Short token prefix that is safe to put in logs
    pub fn redacted(&self) -> String {
        redact(&self.access_token)
    }
}

/// First few characters of a secret, for log output
pub fn redact(secret: &str) -> String {
    let prefix: String = secret.chars().take(8).collect();
    format!("{}...", prefix)
}

/// `expires_at` is written as RFC 3339 and read from either RFC 3339 or epoch seconds
mod timestamp {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTimestamp {
        Epoch(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(
        value: &DateTime<Utc>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<DateTime<Utc>, D::Error> {
        use serde::de::Error;

        match RawTimestamp::deserialize(deserializer)? {
            RawTimestamp::Epoch(secs) => {
                if !secs.is_finite() {
                    return Err(D::Error::custom("expires_at is not a finite number"));
                }
                let whole = secs.floor();
                let nanos = ((secs - whole) * 1e9) as u32;
                let whole = whole as i64;
                Utc.timestamp_opt(whole, nanos)
                    .single()
                    .ok_or_else(|| D::Error::custom(format!("expires_at out of range: {}", secs)))
            }
            RawTimestamp::Text(text) => DateTime::parse_from_rfc3339(&text)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| D::Error::custom(format!("invalid expires_at '{}': {}", text, e))),
        }
    }
}

/// Token endpoint response for both the code and refresh grants
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: u64,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    pub token_type: Option<String>,
}

/// PKCE verifier and its S256 challenge
#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl PkcePair {
    pub fn generate() -> Self {
        let verifier = random_urlsafe(32);
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        Self {
            verifier,
            challenge,
        }
    }
}

/// Transient data bound to one login attempt
///
/// Consumed by value when the attempt ends so the verifier does not outlive it.
#[derive(Debug)]
pub struct AuthorizationState {
    pub state: String,
    pub pkce: PkcePair,
    pub redirect_uri: String,
    pub listener_port: u16,
}

impl AuthorizationState {
    pub fn new(listener_port: u16, redirect_uri: String) -> Self {
        Self {
            state: random_urlsafe(32),
            pkce: PkcePair::generate(),
            redirect_uri,
            listener_port,
        }
    }
}

/// Base64url (no padding) encoding of `len` random bytes
fn random_urlsafe(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill(bytes.as_mut_slice());
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Observable session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    LoggedOut,
    HasValidToken,
    HasExpiredToken,
    LoggingIn,
}

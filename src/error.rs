// Error handling module
// Defines the authentication error taxonomy shared by the whole client

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the token store, login flow and authorized requests
#[derive(Error, Debug)]
pub enum AuthError {
    /// Stored token file exists but cannot be parsed
    #[error("Token store is corrupt ({path}): {reason}. Run `restream login` to start a new session")]
    CorruptStore { path: String, reason: String },

    /// I/O failure while reading or writing the token store
    #[error("Token store I/O error: {0}")]
    Storage(#[from] std::io::Error),

    /// Callback state did not match the nonce issued for this login attempt
    #[error("OAuth state mismatch: callback does not belong to this login attempt")]
    StateMismatch,

    /// Provider redirected back with an `error` parameter
    #[error("Authorization denied by provider: {0}")]
    ProviderDenied(String),

    /// No callback arrived before the login deadline
    #[error("Timed out after {}s waiting for the browser callback", .0.as_secs())]
    LoginTimeout(Duration),

    /// Loopback listener could not be started or failed while serving
    #[error("Callback listener error: {0}")]
    Listener(String),

    /// Token endpoint answered with a non-success status
    #[error("Token exchange failed: {status} - {body}")]
    TokenExchange { status: u16, body: String },

    /// Server answered 2xx with a body that could not be decoded
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Refresh token was rejected, the stored session is dead
    #[error("Refresh token rejected by provider. Run `restream login` again")]
    RefreshRejected,

    /// Transport-level failure after exhausting retries
    #[error("Network error: {0}")]
    Network(String),

    /// Access token expired and no refresh token is stored
    #[error("Session expired and cannot be refreshed. Run `restream login` again")]
    SessionExpired,

    /// No stored session exists
    #[error("Not logged in. Run `restream login` first")]
    NotAuthenticated,

    /// Resource API kept answering 401 after a forced refresh
    #[error("Request unauthorized even after refreshing the access token")]
    Unauthorized,

    /// Resource API answered with a non-401 error status
    #[error("API error: {status} - {body}")]
    Http { status: u16, body: String },

    /// Missing or invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AuthError {
    /// Errors that can only be resolved by an interactive `login`
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            AuthError::CorruptStore { .. }
                | AuthError::RefreshRejected
                | AuthError::SessionExpired
                | AuthError::NotAuthenticated
                | AuthError::Unauthorized
        )
    }

    /// Login attempt aborted; the user may simply try again
    pub fn is_retryable_login(&self) -> bool {
        matches!(
            self,
            AuthError::StateMismatch | AuthError::ProviderDenied(_) | AuthError::LoginTimeout(_)
        )
    }
}

/// Result type alias for authentication operations
pub type Result<T> = std::result::Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = AuthError::ProviderDenied("access_denied".to_string());
        assert_eq!(
            err.to_string(),
            "Authorization denied by provider: access_denied"
        );

        let err = AuthError::TokenExchange {
            status: 400,
            body: "invalid_grant".to_string(),
        };
        assert_eq!(err.to_string(), "Token exchange failed: 400 - invalid_grant");

        let err = AuthError::LoginTimeout(Duration::from_secs(120));
        assert_eq!(
            err.to_string(),
            "Timed out after 120s waiting for the browser callback"
        );
    }

    #[test]
    fn test_requires_login_classification() {
        assert!(AuthError::NotAuthenticated.requires_login());
        assert!(AuthError::RefreshRejected.requires_login());
        assert!(AuthError::SessionExpired.requires_login());
        assert!(AuthError::Unauthorized.requires_login());
        assert!(AuthError::CorruptStore {
            path: "/tmp/tokens.json".to_string(),
            reason: "EOF".to_string(),
        }
        .requires_login());

        assert!(!AuthError::Network("connection refused".to_string()).requires_login());
        assert!(!AuthError::StateMismatch.requires_login());
    }

    #[test]
    fn test_retryable_login_classification() {
        assert!(AuthError::StateMismatch.is_retryable_login());
        assert!(AuthError::ProviderDenied("denied".to_string()).is_retryable_login());
        assert!(AuthError::LoginTimeout(Duration::from_secs(2)).is_retryable_login());
        assert!(!AuthError::RefreshRejected.is_retryable_login());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: AuthError = io.into();
        assert!(matches!(err, AuthError::Storage(_)));
    }
}

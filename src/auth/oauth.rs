// OAuth2 Authorization Code client
// Authorization URL construction, code exchange and refresh grants

use chrono::Utc;
use rand::Rng;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;

use super::types::{TokenRecord, TokenResponse};
use crate::error::{AuthError, Result};

/// Provider endpoints, client credentials and retry policy
#[derive(Debug, Clone)]
pub struct OAuthSettings {
    pub authorize_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    /// Space-separated scopes; `None` requests the provider default
    pub scope: Option<String>,
    /// Extra attempts after a transport failure on the token endpoint
    pub max_retries: u32,
    /// Base delay for exponential backoff between attempts
    pub retry_base_delay: Duration,
    pub request_timeout: Duration,
}

/// Error body of the token endpoint (RFC 6749 section 5.2)
#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

pub struct OAuthClient {
    client: Client,
    settings: OAuthSettings,
}

impl OAuthClient {
    pub fn new(settings: OAuthSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| AuthError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { client, settings })
    }

    pub fn settings(&self) -> &OAuthSettings {
        &self.settings
    }

    /// Client ID, required by every call that talks to the provider
    fn client_id(&self) -> Result<&str> {
        if self.settings.client_id.is_empty() {
            return Err(AuthError::Config(
                "RESTREAM_CLIENT_ID is required for login and token refresh".to_string(),
            ));
        }
        Ok(&self.settings.client_id)
    }

    /// Authorization endpoint URL the user's browser is sent to
    pub fn authorization_url(
        &self,
        redirect_uri: &str,
        state: &str,
        code_challenge: Option<&str>,
    ) -> Result<Url> {
        let mut params: Vec<(&str, &str)> = vec![
            ("response_type", "code"),
            ("client_id", self.client_id()?),
            ("redirect_uri", redirect_uri),
            ("state", state),
        ];
        if let Some(scope) = self.settings.scope.as_deref().filter(|s| !s.is_empty()) {
            params.push(("scope", scope));
        }
        if let Some(challenge) = code_challenge {
            params.push(("code_challenge", challenge));
            params.push(("code_challenge_method", "S256"));
        }

        Url::parse_with_params(&self.settings.authorize_url, &params).map_err(|e| {
            AuthError::Config(format!(
                "invalid authorization URL '{}': {}",
                self.settings.authorize_url, e
            ))
        })
    }

    /// Exchange an authorization code for a token record
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenRecord> {
        tracing::info!("Exchanging authorization code for tokens...");

        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
        ];
        if let Some(verifier) = code_verifier {
            form.push(("code_verifier", verifier));
        }

        let (status, body) = self.post_token_form(&form).await?;
        if !status.is_success() {
            log_error_body("Code exchange", status, &body);
            return Err(AuthError::TokenExchange {
                status: status.as_u16(),
                body,
            });
        }

        let record = parse_token_body(&body)?;
        tracing::info!(
            token = %record.redacted(),
            expires_at = %record.expires_at.to_rfc3339(),
            "Authorization code exchanged"
        );
        Ok(record)
    }

    /// Mint a new access token from a refresh token
    ///
    /// A rejection by the provider is terminal: the same refresh token must not
    /// be tried again.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenRecord> {
        tracing::info!("Refreshing access token...");

        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];

        let (status, body) = self.post_token_form(&form).await?;
        if !status.is_success() {
            log_error_body("Token refresh", status, &body);
            if is_refresh_rejection(status, &body) {
                return Err(AuthError::RefreshRejected);
            }
            return Err(AuthError::TokenExchange {
                status: status.as_u16(),
                body,
            });
        }

        let record = parse_token_body(&body)?;
        tracing::info!(
            token = %record.redacted(),
            expires_at = %record.expires_at.to_rfc3339(),
            rotated = record.refresh_token.is_some(),
            "Token refreshed"
        );
        Ok(record)
    }

    /// POST a grant to the token endpoint, retrying transport failures only
    async fn post_token_form(&self, grant: &[(&str, &str)]) -> Result<(StatusCode, String)> {
        let mut form: Vec<(&str, &str)> = grant.iter().copied().collect();
        form.push(("client_id", self.client_id()?));
        if let Some(secret) = self.settings.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }

        let max_retries = self.settings.max_retries;
        let mut attempt = 0;

        loop {
            let result = self
                .client
                .post(&self.settings.token_url)
                .header("Accept", "application/json")
                .form(&form)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.map_err(|e| {
                        AuthError::Network(format!("failed to read token response: {}", e))
                    })?;
                    tracing::debug!(status = %status, attempt = attempt + 1, "Token endpoint responded");
                    return Ok((status, body));
                }
                Err(e) => {
                    let error_kind = if e.is_timeout() {
                        "timeout"
                    } else if e.is_connect() {
                        "connection_failed"
                    } else if e.is_request() {
                        "request_error"
                    } else {
                        "unknown"
                    };

                    if attempt < max_retries {
                        let delay = self.backoff_delay(attempt);
                        tracing::warn!(
                            error_kind = error_kind,
                            error = %e,
                            "Token request failed, retrying after {}ms (attempt {}/{})",
                            delay.as_millis(),
                            attempt + 1,
                            max_retries
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    tracing::error!(
                        error_kind = error_kind,
                        error = %e,
                        url = %self.settings.token_url,
                        total_attempts = attempt + 1,
                        "Token request failed after all retries"
                    );
                    return Err(AuthError::Network(format!(
                        "{} (kind: {}, attempts: {})",
                        e,
                        error_kind,
                        attempt + 1
                    )));
                }
            }
        }
    }

    /// base_delay * 2^attempt, plus up to 10% jitter
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay = self
            .settings
            .retry_base_delay
            .saturating_mul(2_u32.saturating_pow(attempt));
        let jitter = delay.mul_f64(rand::thread_rng().gen_range(0.0..0.1));
        delay + jitter
    }
}

fn parse_token_body(body: &str) -> Result<TokenRecord> {
    let response: TokenResponse = serde_json::from_str(body)
        .map_err(|e| AuthError::InvalidResponse(format!("failed to parse token response: {}", e)))?;
    TokenRecord::from_response(response, Utc::now())
}

/// 400/401 from the refresh grant means the session is dead, unless the
/// client itself was rejected
fn is_refresh_rejection(status: StatusCode, body: &str) -> bool {
    if status != StatusCode::BAD_REQUEST && status != StatusCode::UNAUTHORIZED {
        return false;
    }
    match serde_json::from_str::<OAuthErrorBody>(body) {
        Ok(err) => err.error != "invalid_client",
        Err(_) => true,
    }
}

fn log_error_body(operation: &str, status: StatusCode, body: &str) {
    if let Ok(err) = serde_json::from_str::<OAuthErrorBody>(body) {
        tracing::error!(
            status = %status,
            error = %err.error,
            description = err.error_description.as_deref().unwrap_or(""),
            "{} failed",
            operation
        );
    } else {
        tracing::error!(status = %status, body = %body, "{} failed", operation);
    }
}

/// Open `url` in the default browser
pub fn open_browser(url: &str) -> std::io::Result<()> {
    tracing::debug!("Opening browser for OAuth authorization");
    open::that(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn settings(token_url: String) -> OAuthSettings {
        OAuthSettings {
            authorize_url: "https://api.restream.io/login".to_string(),
            token_url,
            client_id: "client-abc".to_string(),
            client_secret: Some("secret-xyz".to_string()),
            scope: Some("profile.read channel.read".to_string()),
            max_retries: 2,
            retry_base_delay: Duration::from_millis(10),
            request_timeout: Duration::from_secs(5),
        }
    }

    /// Port that was just free; nothing listens on it
    fn closed_port() -> u16 {
        let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_requires_client_id() {
        let mut s = settings("http://127.0.0.1/token".to_string());
        s.client_id = String::new();
        let client = OAuthClient::new(s).unwrap();

        assert!(matches!(
            client.authorization_url("http://127.0.0.1:1/callback", "s", None),
            Err(AuthError::Config(_))
        ));
        assert!(matches!(
            client.refresh("rt").await,
            Err(AuthError::Config(_))
        ));
    }

    #[test]
    fn test_authorization_url_contains_required_params() {
        let client = OAuthClient::new(settings("http://127.0.0.1/token".to_string())).unwrap();
        let url = client
            .authorization_url("http://127.0.0.1:5555/callback", "nonce-1", Some("chal"))
            .unwrap();

        assert_eq!(url.host_str(), Some("api.restream.io"));
        assert_eq!(url.path(), "/login");

        let pairs: std::collections::HashMap<String, String> =
            url.query_pairs().into_owned().collect();
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["client_id"], "client-abc");
        assert_eq!(pairs["redirect_uri"], "http://127.0.0.1:5555/callback");
        assert_eq!(pairs["state"], "nonce-1");
        assert_eq!(pairs["scope"], "profile.read channel.read");
        assert_eq!(pairs["code_challenge"], "chal");
        assert_eq!(pairs["code_challenge_method"], "S256");
    }

    #[test]
    fn test_authorization_url_is_deterministic() {
        let client = OAuthClient::new(settings("http://127.0.0.1/token".to_string())).unwrap();
        let a = client
            .authorization_url("http://127.0.0.1:1/callback", "s", None)
            .unwrap();
        let b = client
            .authorization_url("http://127.0.0.1:1/callback", "s", None)
            .unwrap();
        assert_eq!(a, b);
        assert!(!a.as_str().contains("code_challenge"));
    }

    #[test]
    fn test_authorization_url_omits_empty_scope() {
        let mut s = settings("http://127.0.0.1/token".to_string());
        s.scope = Some(String::new());
        let client = OAuthClient::new(s).unwrap();
        let url = client
            .authorization_url("http://127.0.0.1:1/callback", "s", None)
            .unwrap();
        assert!(!url.query_pairs().any(|(k, _)| k == "scope"));
    }

    #[tokio::test]
    async fn test_exchange_code_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth/token")
            .match_header("accept", "application/json")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                Matcher::UrlEncoded("code".into(), "code-1".into()),
                Matcher::UrlEncoded(
                    "redirect_uri".into(),
                    "http://127.0.0.1:5555/callback".into(),
                ),
                Matcher::UrlEncoded("client_id".into(), "client-abc".into()),
                Matcher::UrlEncoded("client_secret".into(), "secret-xyz".into()),
                Matcher::UrlEncoded("code_verifier".into(), "verifier-1".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"access_token":"at-1","refresh_token":"rt-1","expires_in":3600,"token_type":"Bearer","scope":"profile.read"}"#,
            )
            .expect(1)
            .create_async()
            .await;

        let client = OAuthClient::new(settings(format!("{}/oauth/token", server.url()))).unwrap();
        let before = Utc::now();
        let record = client
            .exchange_code("code-1", "http://127.0.0.1:5555/callback", Some("verifier-1"))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(record.access_token, "at-1");
        assert_eq!(record.refresh_token.as_deref(), Some("rt-1"));
        assert_eq!(record.scope.as_deref(), Some("profile.read"));
        assert!(record.expires_at >= before + chrono::Duration::seconds(3600));
    }

    #[tokio::test]
    async fn test_exchange_code_error_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/oauth/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant","error_description":"code expired"}"#)
            .expect(1)
            .create_async()
            .await;

        let client = OAuthClient::new(settings(format!("{}/oauth/token", server.url()))).unwrap();
        let err = client
            .exchange_code("code-1", "http://127.0.0.1:1/callback", None)
            .await
            .unwrap_err();

        match err {
            AuthError::TokenExchange { status, body } => {
                assert_eq!(status, 400);
                assert!(body.contains("invalid_grant"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exchange_code_missing_expires_in() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/oauth/token")
            .with_status(200)
            .with_body(r#"{"access_token":"at-1"}"#)
            .create_async()
            .await;

        let client = OAuthClient::new(settings(format!("{}/oauth/token", server.url()))).unwrap();
        let err = client
            .exchange_code("code-1", "http://127.0.0.1:1/callback", None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_refresh_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "rt-1".into()),
                Matcher::UrlEncoded("client_id".into(), "client-abc".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"access_token":"at-2","expires_in":7200}"#)
            .expect(1)
            .create_async()
            .await;

        let client = OAuthClient::new(settings(format!("{}/oauth/token", server.url()))).unwrap();
        let record = client.refresh("rt-1").await.unwrap();

        mock.assert_async().await;
        assert_eq!(record.access_token, "at-2");
        assert!(record.refresh_token.is_none());
    }

    #[tokio::test]
    async fn test_refresh_rejected() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .expect(1)
            .create_async()
            .await;

        let client = OAuthClient::new(settings(format!("{}/oauth/token", server.url()))).unwrap();
        let err = client.refresh("revoked").await.unwrap_err();

        assert!(matches!(err, AuthError::RefreshRejected));
        // Rejections are never retried
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_invalid_client_is_not_a_dead_session() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/oauth/token")
            .with_status(401)
            .with_body(r#"{"error":"invalid_client"}"#)
            .create_async()
            .await;

        let client = OAuthClient::new(settings(format!("{}/oauth/token", server.url()))).unwrap();
        let err = client.refresh("rt-1").await.unwrap_err();
        assert!(matches!(err, AuthError::TokenExchange { status: 401, .. }));
    }

    #[tokio::test]
    async fn test_server_error_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth/token")
            .with_status(503)
            .with_body("unavailable")
            .expect(1)
            .create_async()
            .await;

        let client = OAuthClient::new(settings(format!("{}/oauth/token", server.url()))).unwrap();
        let err = client.refresh("rt-1").await.unwrap_err();

        mock.assert_async().await;
        assert!(matches!(err, AuthError::TokenExchange { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_connection_failure_retries_then_network_error() {
        let port = closed_port();
        let client =
            OAuthClient::new(settings(format!("http://127.0.0.1:{}/oauth/token", port))).unwrap();

        let started = std::time::Instant::now();
        let err = client.refresh("rt-1").await.unwrap_err();

        match err {
            AuthError::Network(msg) => assert!(msg.contains("attempts: 3"), "{}", msg),
            other => panic!("unexpected error: {:?}", other),
        }
        // Two backoff sleeps: 10ms + 20ms
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_backoff_calculation() {
        let mut s = settings("http://127.0.0.1/token".to_string());
        s.retry_base_delay = Duration::from_millis(1000);
        let client = OAuthClient::new(s).unwrap();

        let delay0 = client.backoff_delay(0).as_millis();
        let delay1 = client.backoff_delay(1).as_millis();
        let delay2 = client.backoff_delay(2).as_millis();

        assert!((1000..=1100).contains(&delay0));
        assert!((2000..=2200).contains(&delay1));
        assert!((4000..=4400).contains(&delay2));
    }

    #[test]
    fn test_is_refresh_rejection() {
        assert!(is_refresh_rejection(
            StatusCode::BAD_REQUEST,
            r#"{"error":"invalid_grant"}"#
        ));
        assert!(is_refresh_rejection(StatusCode::UNAUTHORIZED, "not json"));
        assert!(!is_refresh_rejection(
            StatusCode::UNAUTHORIZED,
            r#"{"error":"invalid_client"}"#
        ));
        assert!(!is_refresh_rejection(StatusCode::INTERNAL_SERVER_ERROR, ""));
    }

    #[test]
    fn test_browser_launcher_receives_whole_authorization_url() {
        let client = OAuthClient::new(settings("http://127.0.0.1/token".to_string())).unwrap();
        let url = client
            .authorization_url("http://127.0.0.1:4242/callback", "nonce", Some("challenge"))
            .unwrap();
        let url = url.as_str();
        assert!(url.matches('&').count() >= 4);

        let launchers = open::commands(url);
        assert!(!launchers.is_empty());
        for launcher in launchers {
            let args: Vec<String> = launcher
                .get_args()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect();
            assert!(
                args.iter().any(|arg| arg.contains("code_challenge=challenge")),
                "{:?} {:?}",
                launcher.get_program(),
                args
            );
        }
    }
}

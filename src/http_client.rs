use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Client, Request, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{SessionManager, TokenRecord};
use crate::error::{AuthError, Result};

/// HTTP client for the Restream API that attaches the session's bearer token
pub struct AuthorizedHttpClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// Source of valid access tokens
    session: Arc<SessionManager>,

    /// API root, e.g. `https://api.restream.io/v1`
    base_url: String,
}

impl AuthorizedHttpClient {
    pub fn new(
        session: Arc<SessionManager>,
        base_url: &str,
        connect_timeout: u64,
        request_timeout: u64,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .map_err(|e| AuthError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            session,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Get the underlying HTTP client, for building requests
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Absolute URL for an API path such as `user/profile`
    pub fn url(&self, path: &str) -> Result<Url> {
        let raw = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        Url::parse(&raw).map_err(|e| AuthError::Config(format!("invalid API URL '{}': {}", raw, e)))
    }

    /// GET an API path
    pub async fn get(&self, path: &str) -> Result<Response> {
        let request = self
            .client
            .get(self.url(path)?)
            .header("Accept", "application/json")
            .build()
            .map_err(|e| AuthError::Config(format!("failed to build request: {}", e)))?;
        self.execute(request).await
    }

    /// GET an API path and decode the JSON body
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.get(path).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| {
                AuthError::InvalidResponse(format!("failed to decode API response: {}", e))
            })
    }

    /// Execute a request with the session's bearer token
    ///
    /// A 401 triggers exactly one forced refresh and retry; a second 401 is
    /// surfaced as [`AuthError::Unauthorized`]. Other error statuses are
    /// returned as [`AuthError::Http`] without retrying.
    pub async fn execute(&self, request: Request) -> Result<Response> {
        let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let method = request.method().clone();
        let url = request.url().clone();

        tracing::debug!(
            request_id = %request_id,
            method = %method,
            url = %url,
            "Sending API request"
        );

        let token = self.session.get_valid_token().await?;
        let response = self.send(&request, &token).await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(response, &request_id).await;
        }

        tracing::warn!(
            request_id = %request_id,
            url = %url,
            "Received 401 for a token considered valid, refreshing and retrying once"
        );

        let token = self.session.force_refresh(&token.access_token).await?;
        let response = self.send(&request, &token).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            tracing::error!(
                request_id = %request_id,
                url = %url,
                "Request still unauthorized after refresh"
            );
            return Err(AuthError::Unauthorized);
        }

        check_status(response, &request_id).await
    }

    /// Send one attempt of `request` with `token` attached
    async fn send(&self, request: &Request, token: &TokenRecord) -> Result<Response> {
        let mut attempt = request.try_clone().ok_or_else(|| {
            AuthError::Config("request body is not cloneable and cannot be replayed".to_string())
        })?;

        let header = HeaderValue::from_str(&token.authorization_header()).map_err(|_| {
            AuthError::InvalidResponse("access token is not a valid header value".to_string())
        })?;
        attempt.headers_mut().insert(AUTHORIZATION, header);

        self.client.execute(attempt).await.map_err(|e| {
            let error_kind = if e.is_timeout() {
                "timeout"
            } else if e.is_connect() {
                "connection_failed"
            } else {
                "request_error"
            };
            tracing::warn!(error_kind = error_kind, error = %e, "API request error");
            AuthError::Network(format!("{} (kind: {})", e, error_kind))
        })
    }
}

async fn check_status(response: Response, request_id: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        tracing::debug!(request_id = %request_id, status = %status, "Request successful");
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    tracing::error!(
        request_id = %request_id,
        status = status.as_u16(),
        response_body = %body,
        "API request failed with error response"
    );
    Err(AuthError::Http {
        status: status.as_u16(),
        body,
    })
}

// Loopback redirect listener
// Captures exactly one OAuth callback on 127.0.0.1, then releases the socket

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Html,
    routing::get,
    Router,
};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::error::{AuthError, Result};

/// Path the provider redirects the browser to
pub const CALLBACK_PATH: &str = "/callback";

/// Upper bound for letting the browser receive the confirmation page
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Parameters captured from a valid callback
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackParams {
    pub code: String,
    pub state: String,
}

type CallbackSender = oneshot::Sender<Result<CallbackParams>>;

/// Shared between the callback handler invocations; the sender is taken once
#[derive(Clone)]
struct CallbackState {
    expected_state: Arc<str>,
    sender: Arc<Mutex<Option<CallbackSender>>>,
}

/// Ephemeral HTTP endpoint bound to an OS-assigned loopback port
#[derive(Debug)]
pub struct LoopbackListener {
    listener: TcpListener,
    port: u16,
}

impl LoopbackListener {
    /// Bind `127.0.0.1:0`; the port is known before the browser is opened
    pub async fn bind() -> Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| AuthError::Listener(format!("failed to bind {}: {}", addr, e)))?;
        let port = listener
            .local_addr()
            .map_err(|e| AuthError::Listener(e.to_string()))?
            .port();

        tracing::debug!(port, "Callback listener bound");
        Ok(Self { listener, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `http://127.0.0.1:<port>/callback`
    pub fn redirect_uri(&self) -> String {
        format!("http://127.0.0.1:{}{}", self.port, CALLBACK_PATH)
    }

    /// Serve until the first callback arrives or `timeout` elapses
    ///
    /// The socket is closed before this returns on every path, and also when
    /// the returned future is dropped mid-wait.
    pub async fn wait_for_callback(
        self,
        expected_state: &str,
        timeout: Duration,
    ) -> Result<CallbackParams> {
        let (tx, rx) = oneshot::channel();
        let app = callback_router(CallbackState {
            expected_state: Arc::from(expected_state),
            sender: Arc::new(Mutex::new(Some(tx))),
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let port = self.port;
        let listener = self.listener;

        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                tracing::warn!(port, error = %e, "Callback listener stopped with error");
            }
        });

        let mut guard = ServerGuard {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
            port,
        };

        tracing::info!(port, timeout_secs = timeout.as_secs(), "Waiting for browser callback");

        let outcome = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(AuthError::Listener(
                "callback listener stopped before a callback arrived".to_string(),
            )),
            Err(_) => {
                tracing::warn!(port, "No callback received before the deadline");
                Err(AuthError::LoginTimeout(timeout))
            }
        };

        guard.close().await;
        outcome
    }
}

/// Owns the serving task; stops it on explicit close or on drop
struct ServerGuard {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    port: u16,
}

impl ServerGuard {
    async fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(mut handle) = self.handle.take() {
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut handle).await.is_err() {
                tracing::debug!(port = self.port, "Forcing callback listener shutdown");
                handle.abort();
                let _ = handle.await;
            }
        }
        tracing::debug!(port = self.port, "Callback listener closed");
    }
}

impl Drop for ServerGuard {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

fn callback_router(state: CallbackState) -> Router {
    Router::new()
        .route(CALLBACK_PATH, get(handle_callback))
        .fallback(handle_not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_callback(
    State(state): State<CallbackState>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, Html<String>) {
    let sender = state
        .sender
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take();

    let Some(sender) = sender else {
        return (
            StatusCode::CONFLICT,
            page(
                "Login already handled",
                "This login attempt has already completed. You can close this tab.",
            ),
        );
    };

    let outcome = evaluate_callback(&params, &state.expected_state);
    let response = match &outcome {
        Ok(_) => (
            StatusCode::OK,
            page(
                "Login successful",
                "You are now signed in to restream. You can close this tab and return to the terminal.",
            ),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Rejected OAuth callback");
            (StatusCode::BAD_REQUEST, page("Login failed", &e.to_string()))
        }
    };

    let _ = sender.send(outcome);
    response
}

async fn handle_not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "Not found")
}

/// Decide the outcome of a callback from its query parameters
fn evaluate_callback(
    params: &HashMap<String, String>,
    expected_state: &str,
) -> Result<CallbackParams> {
    if let Some(error) = params.get("error") {
        let reason = match params.get("error_description") {
            Some(description) if !description.is_empty() => {
                format!("{}: {}", error, description)
            }
            _ => error.clone(),
        };
        return Err(AuthError::ProviderDenied(reason));
    }

    let state = params.get("state").map(String::as_str).unwrap_or_default();
    if state != expected_state {
        return Err(AuthError::StateMismatch);
    }

    match params.get("code") {
        Some(code) if !code.is_empty() => Ok(CallbackParams {
            code: code.clone(),
            state: state.to_string(),
        }),
        _ => Err(AuthError::ProviderDenied(
            "callback did not include an authorization code".to_string(),
        )),
    }
}

fn page(title: &str, message: &str) -> Html<String> {
    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head><title>restream - {title}</title></head>
<body style="font-family: system-ui; text-align: center; padding-top: 80px;">
<h2>{title}</h2>
<p>{message}</p>
</body>
</html>"#,
        title = escape_html(title),
        message = escape_html(message),
    ))
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

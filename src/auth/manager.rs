use chrono::{Duration, Utc};
use reqwest::Url;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

use super::listener::LoopbackListener;
use super::oauth::OAuthClient;
use super::store::TokenStore;
use super::types::{AuthorizationState, SessionState, TokenRecord};
use crate::error::{AuthError, Result};

/// What this process currently knows about the stored session
#[derive(Debug, Clone)]
enum Cached {
    /// Store not read yet
    Unknown,
    Absent,
    Present(TokenRecord),
}

/// Session manager
/// Owns the token lifecycle: login, expiry detection, coalesced refresh, logout
pub struct SessionManager {
    store: TokenStore,
    oauth: OAuthClient,

    /// Cached session; the lock is held for the whole of a refresh or login so
    /// concurrent callers wait for its result instead of starting their own
    session: Mutex<Cached>,

    /// Set while an interactive login is in progress
    logging_in: AtomicBool,

    /// Tokens are treated as expired this long before `expires_at`
    refresh_margin: Duration,

    /// How long to wait for the browser callback
    login_timeout: std::time::Duration,
}

impl SessionManager {
    pub fn new(
        store: TokenStore,
        oauth: OAuthClient,
        refresh_margin_secs: u64,
        login_timeout: std::time::Duration,
    ) -> Self {
        Self {
            store,
            oauth,
            session: Mutex::new(Cached::Unknown),
            logging_in: AtomicBool::new(false),
            refresh_margin: Duration::seconds(refresh_margin_secs.min(u32::MAX as u64) as i64),
            login_timeout,
        }
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    /// Run the interactive Authorization Code flow
    ///
    /// `present` receives the authorization URL once the loopback listener is
    /// ready; it is expected to show it to the user and/or open a browser.
    /// On any failure nothing is persisted and the previous session, if any,
    /// is left untouched.
    pub async fn login<F>(&self, present: F) -> Result<TokenRecord>
    where
        F: FnOnce(&Url) + Send,
    {
        let mut session = self.session.lock().await;
        let _flag = LoginFlag::raise(&self.logging_in);

        let listener = LoopbackListener::bind().await?;
        let attempt = AuthorizationState::new(listener.port(), listener.redirect_uri());
        let url = self.oauth.authorization_url(
            &attempt.redirect_uri,
            &attempt.state,
            Some(&attempt.pkce.challenge),
        )?;

        tracing::info!(port = attempt.listener_port, "Starting OAuth login");
        present(&url);

        let callback = listener
            .wait_for_callback(&attempt.state, self.login_timeout)
            .await?;

        let exchanged = self
            .oauth
            .exchange_code(
                &callback.code,
                &attempt.redirect_uri,
                Some(&attempt.pkce.verifier),
            )
            .await;
        drop(attempt);
        let record = exchanged?;

        self.store.save(&record)?;
        *session = Cached::Present(record.clone());

        tracing::info!(
            token = %record.redacted(),
            expires_at = %record.expires_at.to_rfc3339(),
            "Login successful"
        );
        Ok(record)
    }

    /// Forget the session, on disk and in memory
    pub async fn logout(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        self.store.clear()?;
        *session = Cached::Absent;
        tracing::info!("Logged out");
        Ok(())
    }

    /// Get a token valid for at least the refresh margin, refreshing if necessary
    ///
    /// Concurrent callers share a single refresh.
    pub async fn get_valid_token(&self) -> Result<TokenRecord> {
        let mut session = self.session.lock().await;

        let record = self
            .cached_or_load(&mut session)?
            .ok_or(AuthError::NotAuthenticated)?;

        if !record.needs_refresh(Utc::now(), self.refresh_margin) {
            return Ok(record);
        }

        tracing::debug!(
            expires_at = %record.expires_at.to_rfc3339(),
            "Access token expired or expiring soon"
        );
        self.refresh_locked(&mut session, record).await
    }

    /// Refresh after the server rejected `rejected_access_token`
    ///
    /// If another caller already replaced that token, the replacement is
    /// returned without contacting the provider again.
    pub async fn force_refresh(&self, rejected_access_token: &str) -> Result<TokenRecord> {
        let mut session = self.session.lock().await;

        let record = self
            .cached_or_load(&mut session)?
            .ok_or(AuthError::NotAuthenticated)?;

        if record.access_token != rejected_access_token {
            tracing::debug!("Rejected token was already replaced");
            return Ok(record);
        }

        tracing::warn!(token = %record.redacted(), "Access token rejected by server, forcing refresh");
        self.refresh_locked(&mut session, record).await
    }

    /// Current lifecycle state, without network calls
    pub async fn state(&self) -> Result<SessionState> {
        if self.logging_in.load(Ordering::SeqCst) {
            return Ok(SessionState::LoggingIn);
        }

        let mut session = self.session.lock().await;
        Ok(match self.cached_or_load(&mut session)? {
            None => SessionState::LoggedOut,
            Some(record) if record.needs_refresh(Utc::now(), self.refresh_margin) => {
                SessionState::HasExpiredToken
            }
            Some(_) => SessionState::HasValidToken,
        })
    }

    /// Stored record as-is, without refreshing
    pub async fn current_record(&self) -> Result<Option<TokenRecord>> {
        let mut session = self.session.lock().await;
        self.cached_or_load(&mut session)
    }

    fn cached_or_load(&self, session: &mut Cached) -> Result<Option<TokenRecord>> {
        match session {
            Cached::Present(record) => Ok(Some(record.clone())),
            Cached::Absent => Ok(None),
            Cached::Unknown => {
                let loaded = self.store.load()?;
                *session = match &loaded {
                    Some(record) => Cached::Present(record.clone()),
                    None => Cached::Absent,
                };
                Ok(loaded)
            }
        }
    }

    /// Replace `stale` with a fresh token; caller holds the session lock
    async fn refresh_locked(&self, session: &mut Cached, stale: TokenRecord) -> Result<TokenRecord> {
        // Another process may have refreshed (and rotated the refresh token) meanwhile
        let stale = match self.store.load()? {
            None => {
                tracing::warn!("Stored session disappeared before refresh");
                *session = Cached::Absent;
                return Err(AuthError::NotAuthenticated);
            }
            Some(on_disk)
                if on_disk.access_token != stale.access_token
                    && !on_disk.needs_refresh(Utc::now(), self.refresh_margin) =>
            {
                tracing::debug!(token = %on_disk.redacted(), "Adopting token refreshed by another process");
                *session = Cached::Present(on_disk.clone());
                return Ok(on_disk);
            }
            Some(on_disk) => on_disk,
        };

        let Some(refresh_token) = stale.refresh_token.clone() else {
            tracing::warn!("Access token expired and no refresh token is stored");
            *session = Cached::Present(stale);
            return Err(AuthError::SessionExpired);
        };

        match self.oauth.refresh(&refresh_token).await {
            Ok(fresh) => {
                let fresh = fresh.inherit_from(&stale);
                // Memory follows disk: a failed save leaves both on the stale record
                if let Err(e) = self.store.save(&fresh) {
                    tracing::error!(error = %e, "Refreshed token could not be persisted");
                    *session = Cached::Present(stale);
                    return Err(e);
                }
                *session = Cached::Present(fresh.clone());
                Ok(fresh)
            }
            Err(AuthError::RefreshRejected) => {
                tracing::warn!("Refresh token rejected, clearing stored session");
                *session = Cached::Absent;
                self.store.clear()?;
                Err(AuthError::RefreshRejected)
            }
            Err(e) => {
                tracing::error!(error = %e, "Token refresh failed");
                *session = Cached::Present(stale);
                Err(e)
            }
        }
    }
}

/// Keeps `logging_in` raised for the lifetime of a login attempt, including cancellation
struct LoginFlag<'a>(&'a AtomicBool);

impl<'a> LoginFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for LoginFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

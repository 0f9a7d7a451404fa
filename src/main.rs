use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use restream_cli::auth::{open_browser, OAuthClient, SessionManager, SessionState, TokenStore};
use restream_cli::config::{Command, Config};
use restream_cli::error::AuthError;
use restream_cli::http_client::AuthorizedHttpClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let config = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level; stdout is reserved for command output
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::debug!(
        config_dir = %config.config_dir.display(),
        token_url = %config.token_url,
        api_url = %config.api_base_url,
        "Configuration loaded"
    );

    let store = TokenStore::new(config.config_dir.clone());
    let oauth = OAuthClient::new(config.oauth_settings())?;
    let session = Arc::new(SessionManager::new(
        store,
        oauth,
        config.refresh_margin,
        Duration::from_secs(config.login_timeout),
    ));

    match run(&config, session).await {
        Ok(()) => Ok(()),
        Err(e) => {
            if let Some(auth_err) = e.downcast_ref::<AuthError>() {
                if auth_err.requires_login() {
                    eprintln!("{}", auth_err);
                    eprintln!("Hint: run `restream login` to start a new session.");
                    std::process::exit(2);
                }
                if auth_err.is_retryable_login() {
                    eprintln!("{}", auth_err);
                    eprintln!("Login was not completed; run `restream login` to try again.");
                    std::process::exit(1);
                }
            }
            Err(e)
        }
    }
}

async fn run(config: &Config, session: Arc<SessionManager>) -> Result<()> {
    match &config.command {
        Command::Login { no_browser } => login(&session, *no_browser).await,
        Command::Logout => {
            session.logout().await?;
            println!("Logged out.");
            Ok(())
        }
        Command::Status => status(&session).await,
        Command::Get { path } => {
            let client = AuthorizedHttpClient::new(
                session,
                &config.api_base_url,
                config.http_connect_timeout,
                config.http_request_timeout,
            )?;
            let body: serde_json::Value = client.get_json(path).await?;
            let pretty = serde_json::to_string_pretty(&body)
                .context("Failed to format API response")?;
            println!("{}", pretty);
            Ok(())
        }
    }
}

async fn login(session: &SessionManager, no_browser: bool) -> Result<()> {
    let record = session
        .login(|url| {
            println!("Open the following URL in your browser to log in:");
            println!();
            println!("    {}", url);
            println!();

            if !no_browser {
                if let Err(e) = open_browser(url.as_str()) {
                    tracing::warn!(error = %e, "Failed to open browser, open the URL manually");
                }
            }
            println!("Waiting for the browser callback...");
        })
        .await?;

    println!(
        "Logged in. Access token valid until {}.",
        record.expires_at.to_rfc3339()
    );
    Ok(())
}

async fn status(session: &SessionManager) -> Result<()> {
    let state = session.state().await?;
    let record = session.current_record().await?;

    match (state, record) {
        (SessionState::LoggedOut, _) | (_, None) => {
            println!("Not logged in.");
        }
        (state, Some(record)) => {
            let remaining = record.expires_at - Utc::now();
            match state {
                SessionState::HasValidToken => println!(
                    "Logged in. Access token expires in {}s ({}).",
                    remaining.num_seconds(),
                    record.expires_at.to_rfc3339()
                ),
                SessionState::HasExpiredToken => println!(
                    "Logged in. Access token expired at {} and will be refreshed on next use.",
                    record.expires_at.to_rfc3339()
                ),
                SessionState::LoggingIn => println!("A login is in progress."),
                SessionState::LoggedOut => println!("Not logged in."),
            }
            println!("Token:         {}", record.redacted());
            println!(
                "Refresh token: {}",
                if record.refresh_token.is_some() {
                    "present"
                } else {
                    "absent"
                }
            );
            if let Some(scope) = &record.scope {
                println!("Scope:         {}", scope);
            }
            println!("Store:         {}", session.store().path().display());
        }
    }
    Ok(())
}

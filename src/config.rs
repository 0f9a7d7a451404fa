use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Url;
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::{resolve_dir, OAuthSettings};

/// Restream.io command-line client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// OAuth client ID of the registered Restream application
    #[arg(long, env = "RESTREAM_CLIENT_ID", global = true)]
    pub client_id: Option<String>,

    /// OAuth client secret (omitted from token requests when unset)
    #[arg(long, env = "RESTREAM_CLIENT_SECRET", global = true, hide_env_values = true)]
    pub client_secret: Option<String>,

    /// Directory holding the stored session
    #[arg(long, env = "RESTREAM_CONFIG_PATH", global = true)]
    pub config_path: Option<PathBuf>,

    /// Authorization endpoint
    #[arg(
        long,
        env = "RESTREAM_AUTHORIZE_URL",
        default_value = "https://api.restream.io/login",
        global = true
    )]
    pub authorize_url: String,

    /// Token endpoint
    #[arg(
        long,
        env = "RESTREAM_TOKEN_URL",
        default_value = "https://api.restream.io/oauth/token",
        global = true
    )]
    pub token_url: String,

    /// Resource API root
    #[arg(
        long,
        env = "RESTREAM_API_URL",
        default_value = "https://api.restream.io/v1",
        global = true
    )]
    pub api_url: String,

    /// Space-separated scopes to request (provider default when unset)
    #[arg(long, env = "RESTREAM_SCOPE", global = true)]
    pub scope: Option<String>,

    /// Seconds to wait for the browser callback
    #[arg(long, env = "LOGIN_TIMEOUT", default_value = "120", global = true)]
    pub login_timeout: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30", global = true)]
    pub http_timeout: u64,

    /// Extra attempts after a network failure on the token endpoint
    #[arg(long, env = "HTTP_MAX_RETRIES", default_value = "3", global = true)]
    pub http_retries: u32,

    /// Refresh access tokens this many seconds before they expire
    #[arg(long, env = "TOKEN_REFRESH_MARGIN", default_value = "60", global = true)]
    pub refresh_margin: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Log in through the browser and store the session
    Login {
        /// Print the authorization URL without opening a browser
        #[arg(long)]
        no_browser: bool,
    },
    /// Remove the stored session
    Logout,
    /// Show the stored session without contacting the provider
    Status,
    /// GET an API path (e.g. `user/profile`) and print the JSON response
    Get {
        path: String,
    },
}

#[derive(Clone, Debug)]
pub struct Config {
    pub command: Command,

    // OAuth client
    pub client_id: String,
    pub client_secret: Option<String>,
    pub scope: Option<String>,

    // Endpoints
    pub authorize_url: String,
    pub token_url: String,
    pub api_base_url: String,

    // Storage
    pub config_dir: PathBuf,

    // Timeouts
    pub login_timeout: u64,
    pub refresh_margin: u64,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,
    pub http_max_retries: u32,
    pub retry_base_delay_ms: u64,

    pub log_level: String,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        Self::from_args(args)
    }

    /// Build configuration from already parsed arguments
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let config = Config {
            command: args.command,

            client_id: args.client_id.unwrap_or_default().trim().to_string(),
            client_secret: args.client_secret.filter(|s| !s.trim().is_empty()),
            scope: args.scope.filter(|s| !s.trim().is_empty()),

            authorize_url: args.authorize_url,
            token_url: args.token_url,
            api_base_url: args.api_url,

            config_dir: resolve_dir(args.config_path),

            login_timeout: args.login_timeout,
            refresh_margin: args.refresh_margin,

            http_connect_timeout: std::env::var("HTTP_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            http_request_timeout: args.http_timeout,
            http_max_retries: args.http_retries,
            retry_base_delay_ms: std::env::var("HTTP_RETRY_BASE_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(500),

            log_level: args.log_level,
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for (name, url) in [
            ("RESTREAM_AUTHORIZE_URL", &self.authorize_url),
            ("RESTREAM_TOKEN_URL", &self.token_url),
            ("RESTREAM_API_URL", &self.api_base_url),
        ] {
            Url::parse(url).with_context(|| format!("{} is not a valid URL: {}", name, url))?;
        }

        if matches!(self.command, Command::Login { .. }) && self.client_id.is_empty() {
            anyhow::bail!(
                "RESTREAM_CLIENT_ID is required to log in (use --client-id or set RESTREAM_CLIENT_ID env var)"
            );
        }

        if self.login_timeout == 0 {
            anyhow::bail!("--login-timeout must be greater than zero");
        }

        Ok(())
    }

    /// Subset of the configuration handed to the OAuth client
    pub fn oauth_settings(&self) -> OAuthSettings {
        OAuthSettings {
            authorize_url: self.authorize_url.clone(),
            token_url: self.token_url.clone(),
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            scope: self.scope.clone(),
            max_retries: self.http_max_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            request_timeout: Duration::from_secs(self.http_request_timeout),
        }
    }
}

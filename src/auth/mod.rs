// Authentication module
// OAuth2 loopback login, token persistence and session lifecycle

mod listener;
mod manager;
mod oauth;
mod store;
mod types;

pub use listener::{CallbackParams, LoopbackListener, CALLBACK_PATH};
pub use manager::SessionManager;
pub use oauth::{open_browser, OAuthClient, OAuthSettings};
pub use store::{resolve_dir, TokenStore};
pub use types::{AuthorizationState, PkcePair, SessionState, TokenRecord, TokenResponse};

// Token persistence on disk
// Owner-only directory and file, atomic replace on every write

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::types::TokenRecord;
use crate::error::{AuthError, Result};

const TOKEN_FILE: &str = "tokens.json";
const APP_DIR: &str = "restream.io";

/// Durable storage for the session's [`TokenRecord`]
#[derive(Debug, Clone)]
pub struct TokenStore {
    dir: PathBuf,
    path: PathBuf,
}

impl TokenStore {
    /// Store rooted at `dir`, holding `dir/tokens.json`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let path = dir.join(TOKEN_FILE);
        Self { dir, path }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored record; a missing file is not an error
    pub fn load(&self) -> Result<Option<TokenRecord>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "No stored session");
                return Ok(None);
            }
            Err(e) => return Err(AuthError::Storage(e)),
        };

        let record: TokenRecord =
            serde_json::from_str(&content).map_err(|e| self.corrupt(e.to_string()))?;

        if record.access_token.is_empty() {
            return Err(self.corrupt("access_token is empty".to_string()));
        }

        Ok(Some(record))
    }

    /// Replace the stored record atomically
    pub fn save(&self, record: &TokenRecord) -> Result<()> {
        self.ensure_dir()?;

        let content = serde_json::to_string_pretty(record)
            .map_err(|e| AuthError::InvalidResponse(format!("failed to serialize token: {}", e)))?;

        let temp_path = self.dir.join(format!(
            ".{}.tmp-{}-{}",
            TOKEN_FILE,
            std::process::id(),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        ));

        if let Err(e) = write_private(&temp_path, content.as_bytes()) {
            let _ = fs::remove_file(&temp_path);
            return Err(AuthError::Storage(e));
        }

        if let Err(e) = fs::rename(&temp_path, &self.path) {
            let _ = fs::remove_file(&temp_path);
            return Err(AuthError::Storage(e));
        }

        sync_dir(&self.dir);

        tracing::debug!(
            path = %self.path.display(),
            token = %record.redacted(),
            expires_at = %record.expires_at.to_rfc3339(),
            "Saved session"
        );
        Ok(())
    }

    /// Remove the stored record; clearing an empty store succeeds
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "Cleared stored session");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AuthError::Storage(e)),
        }
    }

    fn corrupt(&self, reason: String) -> AuthError {
        tracing::error!(path = %self.path.display(), reason = %reason, "Token store is corrupt");
        AuthError::CorruptStore {
            path: self.path.display().to_string(),
            reason,
        }
    }

    fn ensure_dir(&self) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(&self.dir)?;
            fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700))?;
        }

        #[cfg(not(unix))]
        fs::create_dir_all(&self.dir)?;

        Ok(())
    }
}

/// Config directory: explicit override, else `<user config dir>/restream.io`
pub fn resolve_dir(override_dir: Option<PathBuf>) -> PathBuf {
    match override_dir {
        Some(dir) if !dir.as_os_str().is_empty() => expand_tilde(dir),
        _ => dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR),
    }
}

/// Expand a leading `~/` to the user's home directory
pub fn expand_tilde(path: PathBuf) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path
}

/// Create a new file readable and writable by the owner only, flushed to disk
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(data)?;
    file.write_all(b"\n")?;
    file.sync_all()
}

/// Persist the rename itself; failure only weakens durability, not atomicity
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Err(e) = fs::File::open(dir).and_then(|d| d.sync_all()) {
            tracing::debug!(dir = %dir.display(), error = %e, "Failed to sync config directory");
        }
    }

    #[cfg(not(unix))]
    let _ = dir;
}

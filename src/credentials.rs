// Credentials module: persisted OAuth state. The session lives in a small
// JSON file next to the user's config. It is loaded once at startup and
// written back after every change made by the device login or a refresh.

use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::CredentialStoreError;

/// Client id registered for this application with the auth provider.
pub const DEFAULT_CLIENT_ID: &str = "V8EkfbxtBi93cAySTVWAecEum4d6pt4J";
/// Organization used for executions when the config file does not name one.
pub const DEFAULT_ORGANIZATION_ID: &str = "ad2b217b-d9d0-4cba-9123-2730860082bc";

/// Seconds before the real expiry at which a token is treated as expired.
pub const EXPIRY_MARGIN_SECS: i64 = 120;

/// An access token together with the epoch second it expires at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: i64,
}

/// Where a session stands with respect to its access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Expiring,
    Valid,
}

/// OAuth state for this device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub device_label: String,
    pub client_id: String,
    pub organization_id: String,
    access: Option<AccessToken>,
    pub refresh_token: Option<String>,
}

impl Session {
    /// A session with default ids and no tokens.
    pub fn new(device_label: impl Into<String>) -> Self {
        Self {
            device_label: device_label.into(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            organization_id: DEFAULT_ORGANIZATION_ID.to_string(),
            access: None,
            refresh_token: None,
        }
    }

    pub fn access(&self) -> Option<&AccessToken> {
        self.access.as_ref()
    }

    pub fn set_access(&mut self, token: impl Into<String>, expires_at: i64) {
        self.access = Some(AccessToken {
            token: token.into(),
            expires_at,
        });
    }

    /// Drops both tokens so the next run starts the device login.
    pub fn clear_tokens(&mut self) {
        self.access = None;
        self.refresh_token = None;
    }

    pub fn state(&self, now: i64) -> SessionState {
        match &self.access {
            None => SessionState::Unauthenticated,
            Some(access) if now >= access.expires_at - EXPIRY_MARGIN_SECS => {
                SessionState::Expiring
            }
            Some(_) => SessionState::Valid,
        }
    }
}

/// On-disk layout of the config file.
#[derive(Debug, Serialize, Deserialize)]
struct SessionFile {
    user_name: Option<String>,
    client_id: String,
    organization_id: String,
    access_token: Option<String>,
    access_expiry: Option<i64>,
    refresh_token: Option<String>,
}

impl SessionFile {
    fn into_session(self) -> Session {
        let access = match (self.access_token, self.access_expiry) {
            (Some(token), Some(expires_at)) => Some(AccessToken { token, expires_at }),
            (None, None) => None,
            _ => {
                warn!("Stored access token has no matching expiry, ignoring it");
                None
            }
        };
        Session {
            device_label: self.user_name.unwrap_or_else(default_device_label),
            client_id: self.client_id,
            organization_id: self.organization_id,
            access,
            refresh_token: self.refresh_token,
        }
    }
}

impl From<&Session> for SessionFile {
    fn from(session: &Session) -> Self {
        Self {
            user_name: Some(session.device_label.clone()),
            client_id: session.client_id.clone(),
            organization_id: session.organization_id.clone(),
            access_token: session.access.as_ref().map(|a| a.token.clone()),
            access_expiry: session.access.as_ref().map(|a| a.expires_at),
            refresh_token: session.refresh_token.clone(),
        }
    }
}

/// Label identifying this machine to the auth provider.
pub fn default_device_label() -> String {
    ["COMPUTERNAME", "HOSTNAME"]
        .iter()
        .find_map(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| "autoretouch-batch".to_string())
}

/// Reads and writes the session file at a fixed path.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the session from disk.
    ///
    /// Returns a fresh session if the file doesn't exist or can't be parsed.
    pub fn load(&self) -> Session {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Could not read {}: {}", self.path.display(), e);
                }
                return Session::new(default_device_label());
            }
        };
        match serde_json::from_str::<SessionFile>(&contents) {
            Ok(file) => file.into_session(),
            Err(e) => {
                warn!("Ignoring malformed config {}: {}", self.path.display(), e);
                Session::new(default_device_label())
            }
        }
    }

    /// Save the session to disk.
    ///
    /// Creates the parent directory if it doesn't exist.
    /// Sets file permissions to 0600 (owner read/write only) on Unix.
    pub fn save(&self, session: &Session) -> Result<(), CredentialStoreError> {
        let io_err = |source: std::io::Error| CredentialStoreError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let contents = serde_json::to_string_pretty(&SessionFile::from(session))?;
        std::fs::write(&self.path, contents).map_err(io_err)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.path, permissions).map_err(io_err)?;
        }

        Ok(())
    }
}

//! Persisted session token and last-used username.
//!
//! Both values are always cleared together, on logout or when a saved
//! session fails to restore.

use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("failed to access credential file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("credential file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// Simple key/value store for the two persisted credentials.
pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Credentials;
    fn set_session_token(&self, token: &str) -> Result<(), CredentialError>;
    fn set_username(&self, username: &str) -> Result<(), CredentialError>;
    /// Drop only the token (failed login keeps nothing half-valid).
    fn clear_session_token(&self) -> Result<(), CredentialError>;
    fn clear(&self) -> Result<(), CredentialError>;

    fn session_token(&self) -> Option<String> {
        self.load().session_token
    }
}

/// Credentials kept in memory only; lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    inner: Mutex<Credentials>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(credentials: Credentials) -> Self {
        Self {
            inner: Mutex::new(credentials),
        }
    }

    fn update(&self, f: impl FnOnce(&mut Credentials)) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Credentials {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_session_token(&self, token: &str) -> Result<(), CredentialError> {
        self.update(|c| c.session_token = Some(token.to_string()));
        Ok(())
    }

    fn set_username(&self, username: &str) -> Result<(), CredentialError> {
        self.update(|c| c.username = Some(username.to_string()));
        Ok(())
    }

    fn clear_session_token(&self) -> Result<(), CredentialError> {
        self.update(|c| c.session_token = None);
        Ok(())
    }

    fn clear(&self) -> Result<(), CredentialError> {
        self.update(|c| *c = Credentials::default());
        Ok(())
    }
}

/// Credentials persisted as JSON (`credentials.json` in the data dir).
///
/// The file is re-read on every `load` so a token written by another
/// process (e.g. `huayi logout`) is picked up.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn read(&self) -> Result<Credentials, CredentialError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Credentials::default());
            }
            Err(source) => {
                return Err(CredentialError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        serde_json::from_str(&contents).map_err(|source| CredentialError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    fn write(&self, credentials: &Credentials) -> Result<(), CredentialError> {
        let io_err = |source| CredentialError::Io {
            path: self.path.clone(),
            source,
        };
        if credentials == &Credentials::default() {
            return match std::fs::remove_file(&self.path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(io_err(e)),
                _ => Ok(()),
            };
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(credentials).map_err(|source| {
            CredentialError::Corrupt {
                path: self.path.clone(),
                source,
            }
        })?;
        std::fs::write(&self.path, json).map_err(io_err)
    }

    fn update(&self, f: impl FnOnce(&mut Credentials)) -> Result<(), CredentialError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        // A corrupt file is replaced rather than blocking every future login.
        let mut credentials = self.read().unwrap_or_default();
        f(&mut credentials);
        self.write(&credentials)
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Credentials {
        match self.read() {
            Ok(credentials) => credentials,
            Err(e) => {
                debug!(error = %e, "ignoring unreadable credentials");
                Credentials::default()
            }
        }
    }

    fn set_session_token(&self, token: &str) -> Result<(), CredentialError> {
        self.update(|c| c.session_token = Some(token.to_string()))
    }

    fn set_username(&self, username: &str) -> Result<(), CredentialError> {
        self.update(|c| c.username = Some(username.to_string()))
    }

    fn clear_session_token(&self) -> Result<(), CredentialError> {
        self.update(|c| c.session_token = None)
    }

    fn clear(&self) -> Result<(), CredentialError> {
        self.update(|c| *c = Credentials::default())
    }
}

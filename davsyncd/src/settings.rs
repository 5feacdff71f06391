use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use davsync_core::DavCredentials;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_URL: &str = "DAVSYNC_URL";
pub const ENV_USERNAME: &str = "DAVSYNC_USERNAME";
pub const ENV_PASSWORD: &str = "DAVSYNC_PASSWORD";
pub const ENV_DELETE_LOCAL: &str = "DAVSYNC_DELETE_LOCAL";
pub const ENV_TARGET_DIR: &str = "DAVSYNC_TARGET_DIR";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings from {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid settings in {path:?}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// User settings as stored in `settings.json`. Keys are camelCase on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub dav_url: String,
    pub username: String,
    pub password: String,
    pub delete_local: bool,
    pub target_uri: Option<String>,
}

impl Settings {
    /// Reads the settings file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no settings file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(SettingsError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_json::from_str(&raw).map_err(|source| SettingsError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlays values found through `lookup` (normally the process
    /// environment) on top of the file values.
    pub fn apply_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_URL) {
            self.dav_url = url;
        }
        if let Some(username) = lookup(ENV_USERNAME) {
            self.username = username;
        }
        if let Some(password) = lookup(ENV_PASSWORD) {
            self.password = password;
        }
        if let Some(flag) = lookup(ENV_DELETE_LOCAL) {
            self.delete_local = parse_flag(&flag);
        }
        if let Some(target) = lookup(ENV_TARGET_DIR).filter(|value| !value.trim().is_empty()) {
            self.target_uri = Some(target);
        }
        self
    }

    pub fn with_env_overrides(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn credentials(&self) -> DavCredentials {
        DavCredentials::new(self.username.trim(), self.password.clone())
    }
}

pub(crate) fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

use std::path::{Path, PathBuf};

use anyhow::Context;
use davsync_core::{DEFAULT_EXTENSION, DavClient};
use url::Url;

use crate::settings::Settings;
use crate::storage::{BackendKind, open_backend};
use crate::sync::controller::{DownloadOutcome, SyncController};
use crate::sync::registry::Book;
use crate::sync::transfer::TransferSummary;

const APP_DIR_NAME: &str = "davsync";
const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// One reconciliation cycle, then print the records.
    Check,
    /// Reconcile, transfer, then print the records.
    Download,
}

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub home: PathBuf,
    pub settings_path: PathBuf,
    pub backend: BackendKind,
    pub media_root: PathBuf,
    pub extension: String,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let settings_path = std::env::var("DAVSYNC_SETTINGS")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(default_settings_path);
        let backend = parse_backend(std::env::var("DAVSYNC_BACKEND").ok().as_deref())?;
        let media_root = std::env::var("DAVSYNC_MEDIA_ROOT")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(default_media_root);
        let extension =
            std::env::var("DAVSYNC_EXTENSION").unwrap_or_else(|_| DEFAULT_EXTENSION.to_string());

        Ok(Self {
            home,
            settings_path,
            backend,
            media_root,
            extension,
        })
    }
}

pub struct DaemonRuntime {
    controller: SyncController,
}

impl DaemonRuntime {
    /// Builds the transport client and the storage backend once. Setup
    /// failures are handed to the controller so they surface as scan errors
    /// instead of aborting the process.
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let settings = Settings::load(&config.settings_path)
            .with_context(|| format!("failed to load settings from {:?}", config.settings_path))?
            .with_env_overrides();

        let client = DavClient::new(&settings.dav_url, settings.credentials())
            .map(|client| client.with_extension(config.extension.clone()));
        if let Err(err) = &client {
            tracing::warn!(error = %err, "remote collection is not configured");
        }

        let target_dir = settings
            .target_uri
            .as_deref()
            .and_then(|uri| resolve_target_dir(uri, &config.home));
        let storage = open_backend(config.backend, config.media_root.clone(), target_dir).await;
        if let Err(err) = &storage {
            tracing::warn!(backend = config.backend.as_str(), error = %err, "local storage unavailable");
        }

        tracing::info!(
            backend = config.backend.as_str(),
            extension = %config.extension,
            delete_local = settings.delete_local,
            "davsyncd configured"
        );
        let controller = SyncController::new(client, storage)
            .with_extension(config.extension)
            .with_orphan_deletion(settings.delete_local);
        Ok(Self { controller })
    }

    pub async fn run(self, mode: RunMode) -> anyhow::Result<()> {
        let mut status = self.controller.status();
        let status_handle = tokio::spawn(async move {
            while status.changed().await.is_ok() {
                let current = status.borrow_and_update().clone();
                if !current.is_empty() {
                    tracing::info!(status = %current, "status changed");
                }
            }
        });

        let result = self.run_mode(mode).await;
        status_handle.abort();
        let lines = result?;
        for line in lines {
            println!("{line}");
        }

        let error = self.controller.error().borrow().clone();
        if !error.is_empty() {
            eprintln!("error: {error}");
        }
        Ok(())
    }

    async fn run_mode(&self, mode: RunMode) -> anyhow::Result<Vec<String>> {
        self.controller
            .check()
            .await
            .context("reconciliation failed")?;

        let mut lines = Vec::new();
        if mode == RunMode::Download {
            let outcome = self
                .controller
                .download()
                .await
                .context("download failed")?;
            lines.push(describe_outcome(&outcome));
        }
        lines.extend(self.controller.snapshot().await.iter().map(format_book));
        Ok(lines)
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;

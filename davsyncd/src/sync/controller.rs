use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use davsync_core::{DEFAULT_EXTENSION, DavClient, DavError};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, watch};

use super::registry::{Book, BookRegistry, RegistryEvent};
use super::transfer::{TransferEngine, TransferSummary};
use crate::storage::{LocalStorage, StorageError};

pub const STATUS_CHECKING_REMOTE: &str = "checking remote";
pub const STATUS_CHECKING_LOCAL: &str = "checking local";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControllerError {
    #[error("another check or download is already running")]
    Busy,
    #[error("{0}")]
    RemoteUnavailable(String),
    #[error("{0}")]
    LocalUnavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// No record needed a transfer or a deletion; the engine did not run.
    NothingToSync,
    Completed(TransferSummary),
}

/// Owns the registry and drives reconciliation cycles and transfer runs.
///
/// At most one operation runs at a time; a second `check` or `download`
/// while one is in flight fails with [`ControllerError::Busy`]. Progress is
/// published through the `books`, `status` and `error` watch channels.
pub struct SyncController {
    remote: Result<DavClient, DavError>,
    local: Result<Arc<dyn LocalStorage>, StorageError>,
    extension: String,
    delete_local_orphans: bool,
    registry: Mutex<BookRegistry>,
    books_rx: watch::Receiver<Vec<Book>>,
    status_tx: watch::Sender<String>,
    error_tx: watch::Sender<String>,
    busy: AtomicBool,
    remote_listed: AtomicBool,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncController {
    /// Setup failures are kept and reported when the affected phase runs,
    /// so a missing server URL still lets the local scan proceed.
    pub fn new(
        remote: Result<DavClient, DavError>,
        local: Result<Arc<dyn LocalStorage>, StorageError>,
    ) -> Self {
        let extension = remote
            .as_ref()
            .map(|client| client.extension().to_string())
            .unwrap_or_else(|_| DEFAULT_EXTENSION.to_string());
        let registry = BookRegistry::new();
        let books_rx = registry.watch();
        let (status_tx, _) = watch::channel(String::new());
        let (error_tx, _) = watch::channel(String::new());
        Self {
            remote,
            local,
            extension,
            delete_local_orphans: false,
            registry: Mutex::new(registry),
            books_rx,
            status_tx,
            error_tx,
            busy: AtomicBool::new(false),
            remote_listed: AtomicBool::new(false),
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn with_orphan_deletion(mut self, enabled: bool) -> Self {
        self.delete_local_orphans = enabled;
        self
    }

    pub fn books(&self) -> watch::Receiver<Vec<Book>> {
        self.books_rx.clone()
    }

    pub fn status(&self) -> watch::Receiver<String> {
        self.status_tx.subscribe()
    }

    /// First scan failure of the current cycle, empty when there was none.
    pub fn error(&self) -> watch::Receiver<String> {
        self.error_tx.subscribe()
    }

    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<RegistryEvent> {
        self.registry.lock().await.subscribe()
    }

    pub async fn snapshot(&self) -> Vec<Book> {
        self.registry.lock().await.snapshot()
    }

    /// Full reconciliation cycle: clears the registry, lists the remote
    /// collection, then local storage. The local scan runs even when the
    /// remote one failed.
    pub async fn check(&self) -> Result<(), ControllerError> {
        let _busy = self.begin()?;
        self.error_tx.send_replace(String::new());
        self.remote_listed.store(false, Ordering::Release);
        self.registry.lock().await.clear();

        self.remote_phase().await;
        self.local_phase().await;

        self.status_tx.send_replace(String::new());
        Ok(())
    }

    /// Refreshes only the remote side. Returns whether the listing succeeded.
    pub async fn scan_remote(&self) -> Result<bool, ControllerError> {
        let _busy = self.begin()?;
        Ok(self.remote_phase().await)
    }

    /// Refreshes only the local side. Returns whether the listing succeeded.
    pub async fn scan_local(&self) -> Result<bool, ControllerError> {
        let _busy = self.begin()?;
        Ok(self.local_phase().await)
    }

    /// Runs the transfer engine over the current registry.
    ///
    /// Orphans are only deleted when deletion is enabled and the remote side
    /// was listed successfully since the last `check`.
    pub async fn download(&self) -> Result<DownloadOutcome, ControllerError> {
        let _busy = self.begin()?;
        let delete_orphans = self.delete_local_orphans && self.remote_listed.load(Ordering::Acquire);

        let mut registry = self.registry.lock().await;
        let has_work = registry
            .snapshot()
            .iter()
            .any(|book| book.is_pending() || (delete_orphans && book.is_orphan()));
        if !has_work {
            tracing::info!("nothing to sync");
            return Ok(DownloadOutcome::NothingToSync);
        }

        let client = match &self.remote {
            Ok(client) => client.clone(),
            Err(err) => return Err(ControllerError::RemoteUnavailable(err.to_string())),
        };
        let storage = match &self.local {
            Ok(storage) => Arc::clone(storage),
            Err(err) => {
                let message = err.to_string();
                self.status_tx.send_replace(message.clone());
                return Err(ControllerError::LocalUnavailable(message));
            }
        };

        let summary = TransferEngine::new(client, storage)
            .with_orphan_deletion(delete_orphans)
            .run_all(&mut registry, &self.status_tx)
            .await;
        Ok(DownloadOutcome::Completed(summary))
    }

    fn begin(&self) -> Result<BusyGuard<'_>, ControllerError> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ControllerError::Busy)?;
        Ok(BusyGuard(&self.busy))
    }

    async fn remote_phase(&self) -> bool {
        self.status_tx.send_replace(STATUS_CHECKING_REMOTE.to_string());
        let listing = match &self.remote {
            Ok(client) => client.list_collection().await,
            Err(err) => {
                self.fail("remote", err.to_string());
                return false;
            }
        };
        let listing = match listing {
            Ok(listing) => listing,
            Err(err) => {
                if err.is_auth() {
                    tracing::warn!("server rejected the configured credentials");
                }
                self.remote_listed.store(false, Ordering::Release);
                self.fail("remote", err.to_string());
                return false;
            }
        };

        let mut registry = self.registry.lock().await;
        registry.reset_remote();
        let mut listed = 0usize;
        for entry in listing {
            registry.merge_remote(&entry);
            listed += 1;
        }
        let pruned = registry.prune_detached();
        self.remote_listed.store(true, Ordering::Release);
        self.status_tx.send_replace(String::new());
        tracing::info!(listed, pruned, "remote scan finished");
        true
    }

    async fn local_phase(&self) -> bool {
        self.status_tx.send_replace(STATUS_CHECKING_LOCAL.to_string());
        let storage = match &self.local {
            Ok(storage) => storage,
            Err(err) => {
                self.fail("local", err.to_string());
                return false;
            }
        };
        let entries = match storage.list(&self.extension).await {
            Ok(entries) => entries,
            Err(err) => {
                self.fail("local", err.to_string());
                return false;
            }
        };

        let mut registry = self.registry.lock().await;
        registry.reset_local();
        for entry in &entries {
            registry.merge_local(entry);
        }
        let pruned = registry.prune_detached();
        self.status_tx.send_replace(String::new());
        tracing::info!(
            listed = entries.len(),
            pruned,
            storage = storage.name(),
            "local scan finished"
        );
        true
    }

    fn fail(&self, phase: &str, message: String) {
        tracing::warn!(phase, error = %message, "scan failed");
        self.status_tx.send_replace(message.clone());
        self.error_tx.send_if_modified(|current| {
            if current.is_empty() {
                *current = message;
                true
            } else {
                false
            }
        });
    }
}

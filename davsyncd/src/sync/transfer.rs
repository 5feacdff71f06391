use std::io;
use std::sync::Arc;

use davsync_core::{DavClient, DavError};
use futures_util::StreamExt;
use reqwest::{Response, StatusCode};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use url::Url;

use super::registry::{Book, BookRegistry};
use crate::storage::{LocalRef, LocalStorage, LocalWriter, StorageError};

pub const STATUS_STORED_LOCALLY: &str = "stored locally";
pub const STATUS_SYNCING: &str = "syncing";
pub const STATUS_NO_INPUT_STREAM: &str = "no input stream";
const DEFAULT_MIME: &str = "application/octet-stream";

/// Why a single file did not make it to local storage. The display form is
/// what ends up in the record's status.
#[derive(Debug, Error)]
pub enum TransferFailure {
    #[error("download failed: {0}")]
    Request(#[from] DavError),
    #[error("could not create local file: {0}")]
    Create(StorageError),
    #[error("file already exists, but cannot be accessed")]
    NameMismatch,
    #[error("no output stream")]
    NoOutputStream,
    #[error("Error downloading {0}")]
    Copy(#[from] CopyError),
}

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("{0}")]
    Read(#[from] reqwest::Error),
    #[error("{0}")]
    Write(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub downloaded: usize,
    pub deleted: usize,
    pub failed: usize,
    pub skipped: usize,
}

enum Fetched {
    Stored { handle: LocalRef, bytes: u64 },
    NoInputStream,
}

/// Walks the registry once and brings local storage in line with the remote
/// listing, one file at a time.
pub struct TransferEngine {
    client: DavClient,
    storage: Arc<dyn LocalStorage>,
    delete_local_orphans: bool,
}

impl TransferEngine {
    pub fn new(client: DavClient, storage: Arc<dyn LocalStorage>) -> Self {
        Self {
            client,
            storage,
            delete_local_orphans: false,
        }
    }

    pub fn with_orphan_deletion(mut self, enabled: bool) -> Self {
        self.delete_local_orphans = enabled;
        self
    }

    pub async fn run_all(
        &self,
        registry: &mut BookRegistry,
        status: &watch::Sender<String>,
    ) -> TransferSummary {
        let mut summary = TransferSummary::default();
        let mut index = 0;

        while let Some(book) = registry.at(index).cloned() {
            if self.delete_local_orphans && book.is_orphan() {
                if self.delete_orphan(registry, book).await {
                    summary.deleted += 1;
                    // The next record shifted into this slot.
                    continue;
                }
                summary.failed += 1;
            } else if book.is_pending() {
                if self.fetch(registry, book, status).await {
                    summary.downloaded += 1;
                } else {
                    summary.failed += 1;
                }
            } else {
                summary.skipped += 1;
            }
            index += 1;
        }

        status.send_replace(String::new());
        tracing::info!(
            downloaded = summary.downloaded,
            deleted = summary.deleted,
            failed = summary.failed,
            "transfer run finished"
        );
        summary
    }

    async fn delete_orphan(&self, registry: &mut BookRegistry, mut book: Book) -> bool {
        let Some(handle) = book.local_ref.clone() else {
            return false;
        };
        match self.storage.delete(&handle).await {
            Ok(()) => {
                tracing::info!(name = %book.name, storage = self.storage.name(), "deleted local orphan");
                registry.remove(&book.name);
                true
            }
            Err(err) => {
                tracing::warn!(name = %book.name, error = %err, "failed to delete local orphan");
                book.error = true;
                book.status = format!("could not delete local file: {err}");
                registry.update(book);
                false
            }
        }
    }

    async fn fetch(
        &self,
        registry: &mut BookRegistry,
        mut book: Book,
        status: &watch::Sender<String>,
    ) -> bool {
        let Some(href) = book.remote_ref.clone() else {
            return false;
        };
        book.syncing = true;
        book.status = STATUS_SYNCING.to_string();
        registry.update(book.clone());
        status.send_replace(format!("syncing {}", book.name));

        let outcome = self.download(&book, &href).await;
        book.syncing = false;
        let stored = match outcome {
            Ok(Fetched::Stored { handle, bytes }) => {
                tracing::info!(name = %book.name, bytes, "stored locally");
                book.local_ref = Some(handle);
                book.local_size = bytes;
                book.status = STATUS_STORED_LOCALLY.to_string();
                true
            }
            Ok(Fetched::NoInputStream) => {
                tracing::warn!(name = %book.name, "server returned no content");
                book.status = STATUS_NO_INPUT_STREAM.to_string();
                false
            }
            Err(failure) => {
                tracing::warn!(name = %book.name, error = ?failure, "transfer failed");
                book.error = true;
                book.status = failure.to_string();
                false
            }
        };
        registry.update(book);
        stored
    }

    async fn download(&self, book: &Book, href: &Url) -> Result<Fetched, TransferFailure> {
        let response = self.client.get(href).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(Fetched::NoInputStream);
        }

        let mime = book.remote_content_type.as_deref().unwrap_or(DEFAULT_MIME);
        let created = self
            .storage
            .create(&book.name, mime)
            .await
            .map_err(TransferFailure::Create)?;
        if created.name != book.name {
            tracing::warn!(
                requested = %book.name,
                actual = %created.name,
                "storage picked a different name"
            );
            self.discard(&created.handle).await;
            return Err(TransferFailure::NameMismatch);
        }

        let mut writer = match self.storage.open_write(&created.handle).await {
            Ok(writer) => writer,
            Err(err) => {
                tracing::warn!(name = %book.name, error = %err, "could not open local file for writing");
                self.discard(&created.handle).await;
                return Err(TransferFailure::NoOutputStream);
            }
        };
        let copied = copy_body(response, &mut writer).await;
        drop(writer);
        match copied {
            Ok(bytes) => Ok(Fetched::Stored {
                handle: created.handle,
                bytes,
            }),
            Err(err) => {
                self.discard(&created.handle).await;
                Err(err.into())
            }
        }
    }

    async fn discard(&self, handle: &LocalRef) {
        if let Err(err) = self.storage.delete(handle).await {
            tracing::warn!(handle = %handle, error = %err, "failed to remove local artifact");
        }
    }
}

async fn copy_body(response: Response, writer: &mut LocalWriter) -> Result<u64, CopyError> {
    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        writer.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    writer.flush().await?;
    writer.shutdown().await?;
    Ok(written)
}

#[cfg(test)]
#[path = "transfer_tests.rs"]
mod tests;

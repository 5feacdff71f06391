use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::AsyncWrite;

use crate::storage::{CreatedFile, LocalEntry, LocalRef, LocalStorage, LocalWriter, StorageError};

/// In-memory storage with switches for the failure modes real providers show.
#[derive(Default)]
pub(crate) struct MemoryStorage {
    pub files: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    pub deleted: Mutex<Vec<LocalRef>>,
    pub rename_on_create: bool,
    /// Name whose `create` fails as if the volume were full.
    pub fail_create: Option<String>,
    pub fail_open_write: bool,
    pub fail_write: bool,
    pub fail_list: bool,
    pub fail_delete: bool,
}

impl MemoryStorage {
    pub fn with_files(names: &[&str]) -> Self {
        let storage = Self::default();
        {
            let mut files = storage.files.lock().unwrap();
            for name in names {
                files.insert(name.to_string(), b"local".to_vec());
            }
        }
        storage
    }

    pub fn handle(name: &str) -> LocalRef {
        LocalRef::File(PathBuf::from(name))
    }

    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.files.lock().unwrap().keys().cloned().collect()
    }

    pub fn deleted(&self) -> Vec<LocalRef> {
        self.deleted.lock().unwrap().clone()
    }

    fn name_of(handle: &LocalRef) -> Result<String, StorageError> {
        match handle {
            LocalRef::File(path) => Ok(path.to_string_lossy().into_owned()),
            other => Err(StorageError::ForeignHandle(other.clone())),
        }
    }
}

#[async_trait]
impl LocalStorage for MemoryStorage {
    async fn list(&self, suffix: &str) -> Result<Vec<LocalEntry>, StorageError> {
        if self.fail_list {
            return Err(io::Error::other("volume unmounted").into());
        }
        Ok(self
            .files
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name.ends_with(suffix))
            .map(|(name, data)| LocalEntry {
                name: name.clone(),
                handle: Self::handle(name),
                size: data.len() as u64,
            })
            .collect())
    }

    async fn create(&self, name: &str, _mime: &str) -> Result<CreatedFile, StorageError> {
        if self.fail_create.as_deref() == Some(name) {
            return Err(io::Error::other("no space left").into());
        }
        let mut files = self.files.lock().unwrap();
        let actual = if self.rename_on_create || files.contains_key(name) {
            format!("{name} (1)")
        } else {
            name.to_string()
        };
        files.insert(actual.clone(), Vec::new());
        Ok(CreatedFile {
            handle: Self::handle(&actual),
            name: actual,
        })
    }

    async fn open_write(&self, handle: &LocalRef) -> Result<LocalWriter, StorageError> {
        if self.fail_open_write {
            return Err(io::Error::other("read-only volume").into());
        }
        Ok(Box::new(MemoryWriter {
            files: Arc::clone(&self.files),
            name: Self::name_of(handle)?,
            fail: self.fail_write,
        }))
    }

    async fn delete(&self, handle: &LocalRef) -> Result<(), StorageError> {
        self.deleted.lock().unwrap().push(handle.clone());
        if self.fail_delete {
            return Err(io::Error::other("permission denied").into());
        }
        self.files.lock().unwrap().remove(&Self::name_of(handle)?);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

struct MemoryWriter {
    pub files: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    name: String,
    fail: bool,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.fail {
            return Poll::Ready(Err(io::Error::other("disk full")));
        }
        self.files
            .lock()
            .unwrap()
            .entry(self.name.clone())
            .or_default()
            .extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};

use super::{
    CreatedFile, LocalEntry, LocalRef, LocalStorage, LocalWriter, MAX_NAME_ATTEMPTS, StorageError,
    deduplicated_name, validate_name,
};

/// A user-chosen folder; only its direct children are considered.
pub struct DirectoryStorage {
    root: PathBuf,
    name: String,
}

impl DirectoryStorage {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        let metadata = fs::metadata(&root).await?;
        if !metadata.is_dir() {
            return Err(StorageError::NotADirectory(root));
        }
        let name = format!("dir:{}", root.display());
        Ok(Self { root, name })
    }

    fn resolve(&self, handle: &LocalRef) -> Result<PathBuf, StorageError> {
        match handle {
            LocalRef::File(path) if path.parent() == Some(self.root.as_path()) => Ok(path.clone()),
            other => Err(StorageError::ForeignHandle(other.clone())),
        }
    }
}

#[async_trait]
impl LocalStorage for DirectoryStorage {
    async fn list(&self, suffix: &str) -> Result<Vec<LocalEntry>, StorageError> {
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let file_type = entry.file_type().await?;
            if !file_type.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !name.ends_with(suffix) {
                continue;
            }
            let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            entries.push(LocalEntry {
                name,
                handle: LocalRef::File(entry.path()),
                size,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn create(&self, name: &str, _mime: &str) -> Result<CreatedFile, StorageError> {
        validate_name(name)?;
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let candidate = deduplicated_name(name, attempt);
            let path = self.root.join(&candidate);
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => {
                    return Ok(CreatedFile {
                        handle: LocalRef::File(path),
                        name: candidate,
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(StorageError::NameExhausted(name.to_string()))
    }

    async fn open_write(&self, handle: &LocalRef) -> Result<LocalWriter, StorageError> {
        let path = self.resolve(handle)?;
        let file = match OpenOptions::new().write(true).truncate(true).open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(handle.clone()));
            }
            Err(err) => return Err(err.into()),
        };
        Ok(Box::new(file))
    }

    async fn delete(&self, handle: &LocalRef) -> Result<(), StorageError> {
        let path = self.resolve(handle)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

mod directory;
mod media_index;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWrite;

pub use directory::DirectoryStorage;
pub use media_index::{AUDIOBOOKS_RELATIVE_PATH, MediaIndexStorage};

/// Upper bound on `name (n).ext` candidates tried before giving up.
const MAX_NAME_ATTEMPTS: u32 = 1000;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("missing target folder")]
    MissingTargetFolder,
    #[error("target folder is not a directory: {0}")]
    NotADirectory(PathBuf),
    #[error("invalid file name: {0:?}")]
    InvalidName(String),
    #[error("handle does not belong to this storage: {0}")]
    ForeignHandle(LocalRef),
    #[error("local file not found: {0}")]
    NotFound(LocalRef),
    #[error("no free file name for {0:?}")]
    NameExhausted(String),
}

/// Opaque handle to a local file, only meaningful to the backend that issued it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LocalRef {
    Media(i64),
    File(PathBuf),
}

impl fmt::Display for LocalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalRef::Media(id) => write!(f, "media:{id}"),
            LocalRef::File(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub name: String,
    pub handle: LocalRef,
    /// Zero when the backend cannot report a size cheaply.
    pub size: u64,
}

/// Result of `create`: the provider may assign a different name than requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedFile {
    pub handle: LocalRef,
    pub name: String,
}

pub type LocalWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[async_trait]
pub trait LocalStorage: Send + Sync {
    /// Files whose name ends with `suffix`, ordered by name.
    async fn list(&self, suffix: &str) -> Result<Vec<LocalEntry>, StorageError>;

    async fn create(&self, name: &str, mime: &str) -> Result<CreatedFile, StorageError>;

    async fn open_write(&self, handle: &LocalRef) -> Result<LocalWriter, StorageError>;

    async fn delete(&self, handle: &LocalRef) -> Result<(), StorageError>;

    /// Label used in logs.
    fn name(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Media,
    Directory,
}

impl BackendKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "media" | "mediastore" => Some(BackendKind::Media),
            "directory" | "dir" => Some(BackendKind::Directory),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Media => "media",
            BackendKind::Directory => "directory",
        }
    }
}

/// Opens the configured backend. The directory backend needs a target folder.
pub async fn open_backend(
    kind: BackendKind,
    media_root: PathBuf,
    target_dir: Option<PathBuf>,
) -> Result<Arc<dyn LocalStorage>, StorageError> {
    match kind {
        BackendKind::Media => {
            tracing::info!(root = %media_root.display(), "opening media index");
            Ok(Arc::new(MediaIndexStorage::open(&media_root).await?) as Arc<dyn LocalStorage>)
        }
        BackendKind::Directory => {
            let target = target_dir.ok_or(StorageError::MissingTargetFolder)?;
            tracing::info!(root = %target.display(), "opening target folder");
            Ok(Arc::new(DirectoryStorage::open(target).await?) as Arc<dyn LocalStorage>)
        }
    }
}

fn validate_name(name: &str) -> Result<(), StorageError> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// `name` for attempt 0, then `stem (n).ext`, the way content providers
/// resolve collisions.
fn deduplicated_name(name: &str, attempt: u32) -> String {
    if attempt == 0 {
        return name.to_string();
    }
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{} ({attempt}){}", &name[..dot], &name[dot..]),
        _ => format!("{name} ({attempt})"),
    }
}

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Row, SqlitePool, migrate::Migrator};
use tokio::fs::{self, OpenOptions};

use super::{
    CreatedFile, LocalEntry, LocalRef, LocalStorage, LocalWriter, MAX_NAME_ATTEMPTS, StorageError,
    deduplicated_name, validate_name,
};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

pub const AUDIOBOOKS_RELATIVE_PATH: &str = "Audiobooks";
const INDEX_FILENAME: &str = "media-index.db";

/// A small media index in the spirit of a platform media store: files live
/// under `<root>/<relative_path>/` and every file has a row in SQLite.
pub struct MediaIndexStorage {
    pool: SqlitePool,
    root: PathBuf,
    name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MediaRow {
    id: i64,
    display_name: String,
    relative_path: String,
    size: i64,
}

impl MediaIndexStorage {
    pub async fn open(root: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(root.join(AUDIOBOOKS_RELATIVE_PATH)).await?;
        let options = SqliteConnectOptions::new()
            .filename(root.join(INDEX_FILENAME))
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        Self::from_pool(pool, root).await
    }

    pub async fn from_pool(pool: SqlitePool, root: &Path) -> Result<Self, StorageError> {
        MIGRATOR.run(&pool).await?;
        let storage = Self {
            pool,
            root: root.to_path_buf(),
            name: format!("media:{}", root.display()),
        };
        storage.reindex().await?;
        Ok(storage)
    }

    /// Brings the index in line with the audiobook folder: unknown files are
    /// added, rows whose file vanished are dropped.
    pub async fn reindex(&self) -> Result<(), StorageError> {
        let folder = self.root.join(AUDIOBOOKS_RELATIVE_PATH);
        fs::create_dir_all(&folder).await?;

        let mut dir = fs::read_dir(&folder).await?;
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let metadata = entry.metadata().await?;
            let modified = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64);
            sqlx::query(
                "INSERT INTO media (display_name, relative_path, is_audiobook, size, date_modified)
                 VALUES (?1, ?2, 1, ?3, ?4)
                 ON CONFLICT(relative_path, display_name) DO UPDATE SET
                     size = excluded.size,
                     date_modified = excluded.date_modified",
            )
            .bind(&name)
            .bind(AUDIOBOOKS_RELATIVE_PATH)
            .bind(metadata.len() as i64)
            .bind(modified)
            .execute(&self.pool)
            .await?;
        }

        for row in self.all_rows().await? {
            if fs::metadata(self.path_of(&row)).await.is_err() {
                sqlx::query("DELETE FROM media WHERE id = ?1")
                    .bind(row.id)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    fn path_of(&self, row: &MediaRow) -> PathBuf {
        self.root.join(&row.relative_path).join(&row.display_name)
    }

    async fn all_rows(&self) -> Result<Vec<MediaRow>, StorageError> {
        let rows = sqlx::query("SELECT id, display_name, relative_path, size FROM media")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_media).collect()
    }

    async fn row_for(&self, handle: &LocalRef) -> Result<MediaRow, StorageError> {
        let LocalRef::Media(id) = handle else {
            return Err(StorageError::ForeignHandle(handle.clone()));
        };
        let row = sqlx::query("SELECT id, display_name, relative_path, size FROM media WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => row_to_media(&row),
            None => Err(StorageError::NotFound(handle.clone())),
        }
    }
}

fn row_to_media(row: &sqlx::sqlite::SqliteRow) -> Result<MediaRow, StorageError> {
    Ok(MediaRow {
        id: row.try_get("id")?,
        display_name: row.try_get("display_name")?,
        relative_path: row.try_get("relative_path")?,
        size: row.try_get("size")?,
    })
}

#[async_trait]
impl LocalStorage for MediaIndexStorage {
    async fn list(&self, suffix: &str) -> Result<Vec<LocalEntry>, StorageError> {
        let rows = sqlx::query(
            "SELECT id, display_name, relative_path, size, date_modified FROM media
             WHERE ?1 = '' OR substr(display_name, -length(?1)) = ?1
             ORDER BY display_name ASC",
        )
        .bind(suffix)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            let media = row_to_media(row)?;
            // The size column goes stale after a write; prefer the file itself.
            let size = match fs::metadata(self.path_of(&media)).await {
                Ok(metadata) => metadata.len(),
                Err(_) => media.size.max(0) as u64,
            };
            entries.push(LocalEntry {
                name: media.display_name,
                handle: LocalRef::Media(media.id),
                size,
            });
        }
        Ok(entries)
    }

    async fn create(&self, name: &str, mime: &str) -> Result<CreatedFile, StorageError> {
        validate_name(name)?;
        let folder = self.root.join(AUDIOBOOKS_RELATIVE_PATH);
        fs::create_dir_all(&folder).await?;

        for attempt in 0..MAX_NAME_ATTEMPTS {
            let candidate = deduplicated_name(name, attempt);
            let inserted = sqlx::query(
                "INSERT INTO media (display_name, relative_path, mime_type, is_audiobook, size)
                 VALUES (?1, ?2, ?3, 1, 0)
                 ON CONFLICT(relative_path, display_name) DO NOTHING",
            )
            .bind(&candidate)
            .bind(AUDIOBOOKS_RELATIVE_PATH)
            .bind(mime)
            .execute(&self.pool)
            .await?;
            if inserted.rows_affected() == 0 {
                continue;
            }
            let id = inserted.last_insert_rowid();

            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(folder.join(&candidate))
                .await
            {
                Ok(_) => {
                    return Ok(CreatedFile {
                        handle: LocalRef::Media(id),
                        name: candidate,
                    });
                }
                Err(err) => {
                    sqlx::query("DELETE FROM media WHERE id = ?1")
                        .bind(id)
                        .execute(&self.pool)
                        .await?;
                    if err.kind() != ErrorKind::AlreadyExists {
                        return Err(err.into());
                    }
                }
            }
        }
        Err(StorageError::NameExhausted(name.to_string()))
    }

    async fn open_write(&self, handle: &LocalRef) -> Result<LocalWriter, StorageError> {
        let row = self.row_for(handle).await?;
        let file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(self.path_of(&row))
            .await?;
        Ok(Box::new(file))
    }

    async fn delete(&self, handle: &LocalRef) -> Result<(), StorageError> {
        let row = self.row_for(handle).await?;
        match fs::remove_file(self.path_of(&row)).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        sqlx::query("DELETE FROM media WHERE id = ?1")
            .bind(row.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

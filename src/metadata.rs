//! Metadata persistence layer for videohub.
//!
//! Three tables back the API: `categories`, `videos` and the
//! `video_categories` join table. Categories carry a `name_key` column (the
//! trimmed, lower-cased name) with a UNIQUE constraint; that constraint is the
//! final arbiter when two requests try to create the same category with
//! different casing at the same moment.
//!
//! Every call opens its own short-lived connection, so a `MetadataStore` is
//! cheap to clone and safe to move into `spawn_blocking` closures.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use tokio::task;

use crate::error::{VideoError, VideoResult};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A row of the `categories` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
}

/// A persisted video together with the categories it is filed under.
///
/// `file_path` and `thumbnail_path` are relative to the storage root; see
/// [`crate::storage::StorageLayout::resolve`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoRecord {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub file_name: String,
    pub file_path: String,
    pub thumbnail_file_name: String,
    pub thumbnail_path: String,
    pub uploaded_at: String,
    #[serde(default)]
    pub categories: Vec<Category>,
}

/// Everything needed to insert a video; the id is assigned by SQLite.
#[derive(Debug, Clone)]
pub struct NewVideo {
    pub title: String,
    pub description: String,
    pub file_name: String,
    pub file_path: String,
    pub thumbnail_file_name: String,
    pub thumbnail_path: String,
    pub uploaded_at: String,
    pub categories: Vec<Category>,
}

#[derive(Debug, Clone)]
pub struct MetadataStore {
    db_path: PathBuf,
}

impl MetadataStore {
    /// Opens (and if necessary creates) the SQLite DB and ensures the expected
    /// schema exists. WAL mode is enabled so listing never blocks an upload.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating database directory {}", parent.display()))?;
            }
        }

        let store = Self {
            db_path: path.to_path_buf(),
        };
        store.with_connection(|conn| {
            conn.pragma_update(None, "journal_mode", "WAL")
                .context("enabling WAL mode for metadata DB")?;
            ensure_tables(conn)
        })?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Runs a blocking store operation on the blocking pool. Any failure,
    /// including a panicked task, is reported as a storage error.
    pub async fn call<F, T>(&self, f: F) -> VideoResult<T>
    where
        F: FnOnce(&MetadataStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        task::spawn_blocking(move || f(&store))
            .await
            .map_err(|err| VideoError::Storage(anyhow::anyhow!("task join error: {err}")))?
            .map_err(VideoError::Storage)
    }

    fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = Connection::open(&self.db_path)
            .with_context(|| format!("opening metadata DB {}", self.db_path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        f(&mut conn)
    }

    /// All categories sorted by name (binary collation, id as tie-breaker).
    pub fn list_categories(&self) -> Result<Vec<Category>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT id, name
                FROM categories
                ORDER BY name COLLATE BINARY ASC, id ASC
                "#,
            )?;

            let mut rows = stmt.query([])?;
            let mut categories = Vec::new();
            while let Some(row) = rows.next()? {
                categories.push(row_to_category(row)?);
            }
            Ok(categories)
        })
    }

    pub fn find_category_by_key(&self, name_key: &str) -> Result<Option<Category>> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT id, name FROM categories WHERE name_key = ?1",
                params![name_key],
                row_to_category,
            )
            .optional()
            .context("looking up category")
        })
    }

    /// Inserts a category unless one with the same key already exists, then
    /// returns whichever row owns the key. Losing an insert race is therefore
    /// indistinguishable from finding the row on the first lookup.
    pub fn insert_category(&self, name: &str, name_key: &str) -> Result<Category> {
        self.with_connection(|conn| {
            conn.execute(
                r#"
                INSERT INTO categories (name, name_key)
                VALUES (?1, ?2)
                ON CONFLICT(name_key) DO NOTHING
                "#,
                params![name, name_key],
            )
            .context("inserting category")?;

            conn.query_row(
                "SELECT id, name FROM categories WHERE name_key = ?1",
                params![name_key],
                row_to_category,
            )
            .context("reading back inserted category")
        })
    }

    /// Writes the video row and all of its category links in one transaction.
    pub fn insert_video(&self, video: &NewVideo) -> Result<VideoRecord> {
        self.with_connection(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                r#"
                INSERT INTO videos (
                    title, description, file_name, file_path,
                    thumbnail_file_name, thumbnail_path, uploaded_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    video.title,
                    video.description,
                    video.file_name,
                    video.file_path,
                    video.thumbnail_file_name,
                    video.thumbnail_path,
                    video.uploaded_at,
                ],
            )
            .context("inserting video row")?;
            let id = tx.last_insert_rowid();

            for category in &video.categories {
                tx.execute(
                    "INSERT INTO video_categories (video_id, category_id) VALUES (?1, ?2)",
                    params![id, category.id],
                )
                .with_context(|| format!("linking video {id} to category {}", category.id))?;
            }

            tx.commit().context("committing video")?;

            Ok(VideoRecord {
                id,
                title: video.title.clone(),
                description: video.description.clone(),
                file_name: video.file_name.clone(),
                file_path: video.file_path.clone(),
                thumbnail_file_name: video.thumbnail_file_name.clone(),
                thumbnail_path: video.thumbnail_path.clone(),
                uploaded_at: video.uploaded_at.clone(),
                categories: video.categories.clone(),
            })
        })
    }

    /// Every video in upload order, each with its categories sorted by name.
    pub fn list_videos(&self) -> Result<Vec<VideoRecord>> {
        self.with_connection(|conn| {
            let mut links: HashMap<i64, Vec<Category>> = HashMap::new();
            {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT vc.video_id, c.id, c.name
                    FROM video_categories vc
                    JOIN categories c ON c.id = vc.category_id
                    ORDER BY c.name COLLATE BINARY ASC, c.id ASC
                    "#,
                )?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    let video_id: i64 = row.get(0)?;
                    links.entry(video_id).or_default().push(Category {
                        id: row.get(1)?,
                        name: row.get(2)?,
                    });
                }
            }

            let mut stmt = conn.prepare(
                r#"
                SELECT id, title, description, file_name, file_path,
                       thumbnail_file_name, thumbnail_path, uploaded_at
                FROM videos
                ORDER BY id ASC
                "#,
            )?;
            let mut rows = stmt.query([])?;
            let mut records = Vec::new();
            while let Some(row) = rows.next()? {
                let mut record = row_to_video(row)?;
                record.categories = links.remove(&record.id).unwrap_or_default();
                records.push(record);
            }
            Ok(records)
        })
    }

    pub fn get_video(&self, id: i64) -> Result<Option<VideoRecord>> {
        self.with_connection(|conn| {
            let record = conn
                .query_row(
                    r#"
                    SELECT id, title, description, file_name, file_path,
                           thumbnail_file_name, thumbnail_path, uploaded_at
                    FROM videos
                    WHERE id = ?1
                    "#,
                    params![id],
                    row_to_video,
                )
                .optional()
                .context("looking up video")?;

            let Some(mut record) = record else {
                return Ok(None);
            };

            let mut stmt = conn.prepare(
                r#"
                SELECT c.id, c.name
                FROM video_categories vc
                JOIN categories c ON c.id = vc.category_id
                WHERE vc.video_id = ?1
                ORDER BY c.name COLLATE BINARY ASC, c.id ASC
                "#,
            )?;
            let mut rows = stmt.query([id])?;
            while let Some(row) = rows.next()? {
                record.categories.push(row_to_category(row)?);
            }
            Ok(Some(record))
        })
    }
}

/// Runs the SQL required to create the tables if they do not already exist.
/// Wrapped in a transaction so a failure leaves the DB untouched.
fn ensure_tables(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;

    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS categories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            name_key TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS videos (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            file_name TEXT NOT NULL UNIQUE,
            file_path TEXT NOT NULL,
            thumbnail_file_name TEXT NOT NULL,
            thumbnail_path TEXT NOT NULL,
            uploaded_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS video_categories (
            video_id INTEGER NOT NULL,
            category_id INTEGER NOT NULL,
            PRIMARY KEY (video_id, category_id),
            FOREIGN KEY (video_id) REFERENCES videos(id) ON DELETE CASCADE,
            FOREIGN KEY (category_id) REFERENCES categories(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_video_categories_category
            ON video_categories(category_id);
        "#,
    )?;

    tx.commit()?;
    Ok(())
}

fn row_to_category(row: &Row<'_>) -> rusqlite::Result<Category> {
    Ok(Category {
        id: row.get(0)?,
        name: row.get(1)?,
    })
}

/// Converts a `videos` row into a `VideoRecord` with an empty category list.
fn row_to_video(row: &Row<'_>) -> rusqlite::Result<VideoRecord> {
    Ok(VideoRecord {
        id: row.get("id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        file_name: row.get("file_name")?,
        file_path: row.get("file_path")?,
        thumbnail_file_name: row.get("thumbnail_file_name")?,
        thumbnail_path: row.get("thumbnail_path")?,
        uploaded_at: row.get("uploaded_at")?,
        categories: Vec::new(),
    })
}

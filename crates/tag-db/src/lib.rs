//! SQLite tag, rating and color-label store for AssetLoupe.
//!
//! The default database lives at:
//!   ~/.assetloupe/tags.db
//!
//! One writer thread owns the connection. Every public method packages its
//! statements as a job, sends it over a channel and blocks on a one-shot reply,
//! so the handle can be shared freely between the UI side and the thumbnail
//! worker without sharing the connection itself.
//!
//! Uses WAL mode so external readers never block the writer.

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use crossbeam_channel::{bounded, unbounded, Sender};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::thread;
use thumbnail_cache::tags::{FileMetadata, Tag, TagStore};
use tracing::{debug, warn};

type Job = Box<dyn FnOnce(&Connection) + Send>;

/// Highest accepted star rating
pub const MAX_RATING: i32 = 5;

/// Tag database handle.
pub struct TagDb {
    jobs: Option<Sender<Job>>,
    writer: Option<thread::JoinHandle<()>>,
    db_path: PathBuf,
}

impl TagDb {
    /// Open or create the per-user database.
    pub fn open() -> Result<Self> {
        let dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".assetloupe");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create data dir: {}", dir.display()))?;
        Self::open_at(&dir.join("tags.db"))
    }

    /// Open a database at a specific path.
    pub fn open_at(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

        // WAL mode for concurrent read/write
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        create_tables(&conn)?;

        let (jobs, queue) = unbounded::<Job>();
        let writer = thread::Builder::new()
            .name("tag-db-writer".into())
            .spawn(move || {
                for job in queue {
                    job(&conn);
                }
                debug!("tag database writer stopped");
            })
            .context("Failed to spawn tag database writer")?;

        Ok(Self {
            jobs: Some(jobs),
            writer: Some(writer),
            db_path: db_path.to_path_buf(),
        })
    }

    /// Get the database file path.
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Run `f` on the writer thread and wait for its result.
    fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let (reply, response) = bounded(1);
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| anyhow!("tag database is closed"))?;
        jobs.send(Box::new(move |conn| {
            let _ = reply.send(f(conn));
        }))
        .map_err(|_| anyhow!("tag database writer has stopped"))?;

        response
            .recv()
            .context("tag database writer dropped the request")?
    }

    // -- Tags --

    /// Create a tag if no tag of that name exists (case-insensitive). Returns its id.
    pub fn add_tag(&self, name: &str, category: Option<&str>, color: Option<&str>) -> Result<i64> {
        let name = name.trim().to_string();
        if name.is_empty() {
            bail!("tag name must not be empty");
        }
        let category = category.map(str::to_string);
        let color = color.map(str::to_string);

        self.call(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO tags (name, category, color, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![name, category, color, now()],
            )?;
            let id = conn.query_row(
                "SELECT id FROM tags WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )?;
            Ok(id)
        })
    }

    /// Look a tag up by name (case-insensitive).
    pub fn tag_by_name(&self, name: &str) -> Result<Option<Tag>> {
        let name = name.to_string();
        self.call(move |conn| {
            let tag = conn
                .query_row(
                    "SELECT id, name, category, color FROM tags WHERE name = ?1",
                    params![name],
                    tag_from_row,
                )
                .optional()?;
            Ok(tag)
        })
    }

    /// All tags ordered by category, then name.
    pub fn all_tags(&self) -> Result<Vec<Tag>> {
        self.call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, category, color FROM tags
                 ORDER BY category IS NULL, category, name",
            )?;
            let tags = stmt.query_map([], tag_from_row)?.collect::<Result<Vec<_>, _>>()?;
            Ok(tags)
        })
    }

    // -- File tags --

    /// Attach a tag to a file. Attaching twice is a no-op.
    pub fn add_tag_to_file(&self, path: &Path, tag_id: i64) -> Result<()> {
        let file_path = path_key(path);
        self.call(move |conn| {
            // Dropped without commit on error, so an unknown tag leaves no file row behind
            let tx = conn.unchecked_transaction()?;
            let file_id = ensure_file(&tx, &file_path)?;
            tx.execute(
                "INSERT OR IGNORE INTO file_tags (file_id, tag_id, added_at) VALUES (?1, ?2, ?3)",
                params![file_id, tag_id, now()],
            )
            .with_context(|| format!("Failed to tag {file_path} with tag {tag_id}"))?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Detach a tag from a file. Returns whether it was attached.
    pub fn remove_tag_from_file(&self, path: &Path, tag_id: i64) -> Result<bool> {
        let file_path = path_key(path);
        self.call(move |conn| {
            let removed = conn.execute(
                "DELETE FROM file_tags
                 WHERE tag_id = ?2
                   AND file_id = (SELECT id FROM file_metadata WHERE file_path = ?1)",
                params![file_path, tag_id],
            )?;
            Ok(removed > 0)
        })
    }

    /// Files carrying a tag.
    pub fn files_with_tag(&self, tag_id: i64) -> Result<Vec<PathBuf>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT f.file_path FROM file_metadata f
                 JOIN file_tags ft ON ft.file_id = f.id
                 WHERE ft.tag_id = ?1
                 ORDER BY f.file_path",
            )?;
            let rows = stmt.query_map(params![tag_id], |row| row.get::<_, String>(0))?;
            let paths = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(paths.into_iter().map(PathBuf::from).collect())
        })
    }

    // -- File metadata --

    /// Tags, rating and color label for a file. Unknown files return the default.
    pub fn file_metadata(&self, path: &Path) -> Result<FileMetadata> {
        let file_path = path_key(path);
        self.call(move |conn| {
            let row = conn
                .query_row(
                    "SELECT id, rating, color_label FROM file_metadata WHERE file_path = ?1",
                    params![file_path],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i32>(1)?,
                            row.get::<_, Option<String>>(2)?,
                        ))
                    },
                )
                .optional()?;

            let Some((file_id, rating, color_label)) = row else {
                return Ok(FileMetadata::default());
            };

            let mut stmt = conn.prepare(
                "SELECT t.id, t.name, t.category, t.color FROM tags t
                 JOIN file_tags ft ON ft.tag_id = t.id
                 WHERE ft.file_id = ?1
                 ORDER BY t.name",
            )?;
            let tags = stmt
                .query_map(params![file_id], tag_from_row)?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(FileMetadata {
                tags,
                rating,
                color_label,
            })
        })
    }

    /// Set the star rating (0 to 5).
    pub fn set_rating(&self, path: &Path, rating: i32) -> Result<()> {
        if !(0..=MAX_RATING).contains(&rating) {
            bail!("rating must be between 0 and {MAX_RATING}, got {rating}");
        }
        let file_path = path_key(path);
        self.call(move |conn| {
            let file_id = ensure_file(conn, &file_path)?;
            conn.execute(
                "UPDATE file_metadata SET rating = ?1, modified_at = ?2 WHERE id = ?3",
                params![rating, now(), file_id],
            )?;
            Ok(())
        })
    }

    /// Set or clear the color label.
    pub fn set_color_label(&self, path: &Path, color_label: Option<&str>) -> Result<()> {
        let file_path = path_key(path);
        let color_label = color_label.map(str::to_string);
        self.call(move |conn| {
            let file_id = ensure_file(conn, &file_path)?;
            conn.execute(
                "UPDATE file_metadata SET color_label = ?1, modified_at = ?2 WHERE id = ?3",
                params![color_label, now(), file_id],
            )?;
            Ok(())
        })
    }

    // -- Statistics --

    /// Get the number of files with any stored metadata.
    pub fn file_count(&self) -> Result<i64> {
        self.call(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM file_metadata", [], |row| row.get(0))?;
            Ok(count)
        })
    }
}

impl Drop for TagDb {
    fn drop(&mut self) {
        // Closing the channel ends the writer loop
        self.jobs.take();
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                warn!("tag database writer panicked");
            }
        }
    }
}

impl TagStore for TagDb {
    fn file_metadata(&self, path: &Path) -> Result<FileMetadata> {
        TagDb::file_metadata(self, path)
    }

    fn add_tag(&self, name: &str, category: Option<&str>, color: Option<&str>) -> Result<i64> {
        TagDb::add_tag(self, name, category, color)
    }

    fn add_tag_to_file(&self, path: &Path, tag_id: i64) -> Result<()> {
        TagDb::add_tag_to_file(self, path, tag_id)
    }
}

// -- Schema --

fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS file_metadata (
            id INTEGER PRIMARY KEY,
            file_path TEXT NOT NULL UNIQUE,
            rating INTEGER NOT NULL DEFAULT 0,
            color_label TEXT,
            created_at TEXT NOT NULL,
            modified_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tags (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE COLLATE NOCASE,
            category TEXT,
            color TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS file_tags (
            file_id INTEGER NOT NULL REFERENCES file_metadata(id) ON DELETE CASCADE,
            tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
            added_at TEXT NOT NULL,
            PRIMARY KEY (file_id, tag_id)
        );

        CREATE INDEX IF NOT EXISTS idx_file_tags_tag ON file_tags(tag_id);
        CREATE INDEX IF NOT EXISTS idx_file_rating ON file_metadata(rating);
        CREATE INDEX IF NOT EXISTS idx_file_color ON file_metadata(color_label);
        ",
    )?;
    Ok(())
}

// -- Utility --

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn tag_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tag> {
    Ok(Tag {
        id: row.get(0)?,
        name: row.get(1)?,
        category: row.get(2)?,
        color: row.get(3)?,
    })
}

/// Row id for a file, inserting an empty record on first use.
fn ensure_file(conn: &Connection, file_path: &str) -> Result<i64> {
    let stamp = now();
    conn.execute(
        "INSERT OR IGNORE INTO file_metadata (file_path, created_at, modified_at) VALUES (?1, ?2, ?2)",
        params![file_path, stamp],
    )?;
    let id = conn.query_row(
        "SELECT id FROM file_metadata WHERE file_path = ?1",
        params![file_path],
        |row| row.get(0),
    )?;
    Ok(id)
}

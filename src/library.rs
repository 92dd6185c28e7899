//! # Media Library Module
//!
//! Questo modulo gestisce il database SQLite della libreria media.
//!
//! ## Responsabilità:
//! - Apre/migra il database per-libreria (path derivato da hash della root)
//! - CRUD degli attachment e del loro blob di metadata (varianti/dimensioni)
//! - Meta key/value per-attachment (record di ottimizzazione, fallimenti,
//!   path di backup, marker di restore saltato)
//! - Ledger di ri-ottimizzazione (id già visitati nel passaggio corrente)
//! - Righe statistiche per-attachment (upsert cumulativo)
//! - Checkpoint singleton per l'aggregazione statistiche resumabile
//! - Ingestione di una directory di immagini (stand-in dell'upload del CMS)
//!
//! ## Strategia di persistence:
//! - Un database per libreria media (basato su hash del path della root)
//! - Salvataggio in `~/.remote-optimizer/library_<hash>.db`
//! - Path dei file sempre relativi alla root della libreria
//!
//! ## Schema:
//! - `attachments(id, file, mime_type, metadata)` — metadata è JSON serde
//! - `attachment_meta(attachment_id, meta_key, meta_value)` — UNIQUE per chiave
//! - `reoptimize_ledger(attachment_id)`
//! - `attachment_stats(attachment_id, normal_savings, webp_savings, ...)`
//! - `stats_task(id = 1, status, last_seen_id, totali parziali, timestamp)`

use crate::error::OptimizeError;
use crate::file_manager::FileManager;
use crate::records::{FailureRecord, OptimizationRecord};
use crate::thumbnails::{self, ThumbnailSpec};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Meta key holding the serialized [`OptimizationRecord`]
pub const META_OPTIMIZATION_RECORD: &str = "optimization_record";
/// Meta key holding the serialized [`FailureRecord`]
pub const META_FAILURE_RECORD: &str = "failure_record";
/// Meta key holding the backup path relative to the backup root
pub const META_BACKUP_PATH: &str = "backup_path";
/// One-shot marker: restore was attempted but the backup was missing
pub const META_RESTORE_SKIPPED: &str = "restore_skipped";

/// Directory under the library root holding pristine originals
const BACKUP_DIR_NAME: &str = ".optimizer-backup";

/// Metadata for one derived thumbnail variant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SizeMetadata {
    /// File path relative to the library root
    pub file: String,
    pub width: u32,
    pub height: u32,
    pub filesize: u64,
    pub mime_type: String,
}

/// The mutable metadata blob attached to every attachment
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AttachmentMetadata {
    pub width: u32,
    pub height: u32,
    pub filesize: u64,
    /// Named thumbnail variants
    pub sizes: BTreeMap<String, SizeMetadata>,
}

/// One media-library attachment row
#[derive(Debug, Clone)]
pub struct Attachment {
    pub id: i64,
    /// Original file path relative to the library root
    pub file: String,
    pub mime_type: String,
    pub metadata: AttachmentMetadata,
}

/// Per-attachment statistics row
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsRow {
    pub normal_savings: u64,
    pub webp_savings: u64,
    pub webp_conversions: u64,
    pub png_jpg_conversions: u64,
}

/// State of the resumable stats aggregation task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Processing,
    Completed,
}

impl TaskStatus {
    fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
        }
    }

    fn parse(s: &str) -> Result<Self, OptimizeError> {
        match s {
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            other => Err(OptimizeError::Validation(format!(
                "Unknown stats task status: {}",
                other
            ))),
        }
    }
}

/// Singleton checkpoint for the resumable statistics scan.
///
/// `last_seen_id` is the resume token: the next page starts strictly after
/// it, so a timeout mid-scan loses at most one page of progress.
#[derive(Debug, Clone)]
pub struct ProcessingTask {
    pub status: TaskStatus,
    pub last_seen_id: i64,
    pub total_count: u64,
    pub processed_count: u64,
    pub totals: StatsRow,
    pub started_at: u64,
    pub updated_at: u64,
}

impl ProcessingTask {
    pub fn started(total_count: u64) -> Self {
        let now = unix_now();
        Self {
            status: TaskStatus::Processing,
            last_seen_id: 0,
            total_count,
            processed_count: 0,
            totals: StatsRow::default(),
            started_at: now,
            updated_at: now,
        }
    }
}

/// SQLite-backed media library: attachment rows, metadata, stats, checkpoints
pub struct MediaLibrary {
    root: PathBuf,
    conn: Mutex<Connection>,
}

impl MediaLibrary {
    /// Open (or create) the database for a library root directory
    pub fn open(root: &Path) -> Result<Self, OptimizeError> {
        let state_dir = dirs::home_dir()
            .ok_or_else(|| OptimizeError::Validation("Could not find home directory".to_string()))?
            .join(".remote-optimizer");

        std::fs::create_dir_all(&state_dir)?;

        // Unique database per library, based on the root path hash
        let mut hasher = Sha256::new();
        hasher.update(root.to_string_lossy().as_bytes());
        let hash = hex::encode(hasher.finalize())[..16].to_string();

        let db_path = state_dir.join(format!("library_{}.db", hash));
        debug!("Opening library database: {}", db_path.display());

        let conn = Connection::open(db_path)?;
        let library = Self {
            root: root.to_path_buf(),
            conn: Mutex::new(conn),
        };
        library.migrate()?;
        Ok(library)
    }

    /// Open an in-memory database, used by tests and dry inspections
    pub fn open_in_memory(root: &Path) -> Result<Self, OptimizeError> {
        let conn = Connection::open_in_memory()?;
        let library = Self {
            root: root.to_path_buf(),
            conn: Mutex::new(conn),
        };
        library.migrate()?;
        Ok(library)
    }

    fn migrate(&self) -> Result<(), OptimizeError> {
        let conn = self.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS attachments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file TEXT NOT NULL UNIQUE,
                mime_type TEXT NOT NULL,
                metadata TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS attachment_meta (
                attachment_id INTEGER NOT NULL,
                meta_key TEXT NOT NULL,
                meta_value TEXT NOT NULL,
                UNIQUE(attachment_id, meta_key)
            );
            CREATE TABLE IF NOT EXISTS reoptimize_ledger (
                attachment_id INTEGER PRIMARY KEY
            );
            CREATE TABLE IF NOT EXISTS attachment_stats (
                attachment_id INTEGER PRIMARY KEY,
                normal_savings INTEGER NOT NULL DEFAULT 0,
                webp_savings INTEGER NOT NULL DEFAULT 0,
                webp_conversions INTEGER NOT NULL DEFAULT 0,
                png_jpg_conversions INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS stats_task (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                status TEXT NOT NULL,
                last_seen_id INTEGER NOT NULL,
                total_count INTEGER NOT NULL,
                processed_count INTEGER NOT NULL,
                normal_savings INTEGER NOT NULL,
                webp_savings INTEGER NOT NULL,
                webp_conversions INTEGER NOT NULL,
                png_jpg_conversions INTEGER NOT NULL,
                started_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("library connection poisoned")
    }

    /// Run a closure against the raw connection. Used by the fetcher and the
    /// stats aggregator for their paging queries.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, OptimizeError> {
        let conn = self.lock();
        Ok(f(&conn)?)
    }

    /// Library root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Root of the backup tree mirroring the library layout
    pub fn backup_root(&self) -> PathBuf {
        self.root.join(BACKUP_DIR_NAME)
    }

    /// Absolute path for a library-relative file
    pub fn absolute_path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    // ---- attachments -------------------------------------------------------

    /// Insert a new attachment row, returning its id
    pub fn insert_attachment(
        &self,
        file: &str,
        mime_type: &str,
        metadata: &AttachmentMetadata,
    ) -> Result<i64, OptimizeError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO attachments (file, mime_type, metadata) VALUES (?1, ?2, ?3)",
            params![file, mime_type, serde_json::to_string(metadata)?],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Fetch one attachment by id
    pub fn get_attachment(&self, id: i64) -> Result<Option<Attachment>, OptimizeError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, file, mime_type, metadata FROM attachments WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((id, file, mime_type, metadata)) => Ok(Some(Attachment {
                id,
                file,
                mime_type,
                metadata: serde_json::from_str(&metadata)?,
            })),
            None => Ok(None),
        }
    }

    /// Check whether a file is already registered as an attachment
    pub fn attachment_exists(&self, file: &str) -> Result<bool, OptimizeError> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM attachments WHERE file = ?1",
            params![file],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Overwrite the metadata blob of an attachment
    pub fn update_metadata(
        &self,
        id: i64,
        metadata: &AttachmentMetadata,
    ) -> Result<(), OptimizeError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE attachments SET metadata = ?1 WHERE id = ?2",
            params![serde_json::to_string(metadata)?, id],
        )?;
        Ok(())
    }

    /// Delete the attachment row itself (meta/stats cleanup is the tracker's job)
    pub fn delete_attachment_row(&self, id: i64) -> Result<(), OptimizeError> {
        let conn = self.lock();
        conn.execute("DELETE FROM attachments WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ---- per-attachment meta ----------------------------------------------

    pub fn meta_get(&self, id: i64, key: &str) -> Result<Option<String>, OptimizeError> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                "SELECT meta_value FROM attachment_meta WHERE attachment_id = ?1 AND meta_key = ?2",
                params![id, key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn meta_set(&self, id: i64, key: &str, value: &str) -> Result<(), OptimizeError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO attachment_meta (attachment_id, meta_key, meta_value)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(attachment_id, meta_key) DO UPDATE SET meta_value = excluded.meta_value",
            params![id, key, value],
        )?;
        Ok(())
    }

    pub fn meta_delete(&self, id: i64, key: &str) -> Result<(), OptimizeError> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM attachment_meta WHERE attachment_id = ?1 AND meta_key = ?2",
            params![id, key],
        )?;
        Ok(())
    }

    /// Delete every meta row of an attachment
    pub fn meta_delete_all(&self, id: i64) -> Result<(), OptimizeError> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM attachment_meta WHERE attachment_id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Stored optimization record, if the attachment was ever optimized
    pub fn get_optimization_record(
        &self,
        id: i64,
    ) -> Result<Option<OptimizationRecord>, OptimizeError> {
        match self.meta_get(id, META_OPTIMIZATION_RECORD)? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn set_optimization_record(
        &self,
        id: i64,
        record: &OptimizationRecord,
    ) -> Result<(), OptimizeError> {
        self.meta_set(id, META_OPTIMIZATION_RECORD, &serde_json::to_string(record)?)
    }

    pub fn get_failure_record(&self, id: i64) -> Result<Option<FailureRecord>, OptimizeError> {
        match self.meta_get(id, META_FAILURE_RECORD)? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn set_failure_record(
        &self,
        id: i64,
        record: &FailureRecord,
    ) -> Result<(), OptimizeError> {
        self.meta_set(id, META_FAILURE_RECORD, &serde_json::to_string(record)?)
    }

    // ---- re-optimization ledger -------------------------------------------

    /// Mark an attachment as visited during the current re-optimization pass
    pub fn ledger_insert(&self, id: i64) -> Result<(), OptimizeError> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO reoptimize_ledger (attachment_id) VALUES (?1)",
            params![id],
        )?;
        Ok(())
    }

    /// Truncate the ledger when a full re-optimization pass completes
    pub fn ledger_clear(&self) -> Result<(), OptimizeError> {
        let conn = self.lock();
        conn.execute("DELETE FROM reoptimize_ledger", [])?;
        Ok(())
    }

    // ---- per-attachment stats rows ----------------------------------------

    /// Accumulate one pass's savings into the attachment's stats row
    pub fn stats_accumulate(&self, id: i64, delta: &StatsRow) -> Result<(), OptimizeError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO attachment_stats
                 (attachment_id, normal_savings, webp_savings, webp_conversions, png_jpg_conversions)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(attachment_id) DO UPDATE SET
                 normal_savings = normal_savings + excluded.normal_savings,
                 webp_savings = webp_savings + excluded.webp_savings,
                 webp_conversions = webp_conversions + excluded.webp_conversions,
                 png_jpg_conversions = png_jpg_conversions + excluded.png_jpg_conversions",
            params![
                id,
                delta.normal_savings as i64,
                delta.webp_savings as i64,
                delta.webp_conversions as i64,
                delta.png_jpg_conversions as i64
            ],
        )?;
        Ok(())
    }

    pub fn stats_row(&self, id: i64) -> Result<Option<StatsRow>, OptimizeError> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                "SELECT normal_savings, webp_savings, webp_conversions, png_jpg_conversions
                 FROM attachment_stats WHERE attachment_id = ?1",
                params![id],
                |row| {
                    Ok(StatsRow {
                        normal_savings: row.get::<_, i64>(0)? as u64,
                        webp_savings: row.get::<_, i64>(1)? as u64,
                        webp_conversions: row.get::<_, i64>(2)? as u64,
                        png_jpg_conversions: row.get::<_, i64>(3)? as u64,
                    })
                },
            )
            .optional()?)
    }

    /// Drop the stats row when an attachment reverts to unoptimized
    pub fn stats_delete(&self, id: i64) -> Result<(), OptimizeError> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM attachment_stats WHERE attachment_id = ?1",
            params![id],
        )?;
        Ok(())
    }

    // ---- stats aggregation checkpoint -------------------------------------

    pub fn load_stats_task(&self) -> Result<Option<ProcessingTask>, OptimizeError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT status, last_seen_id, total_count, processed_count,
                        normal_savings, webp_savings, webp_conversions, png_jpg_conversions,
                        started_at, updated_at
                 FROM stats_task WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, i64>(8)?,
                        row.get::<_, i64>(9)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((status, last_seen, total, processed, normal, webp, webp_c, png_c, start, upd)) => {
                Ok(Some(ProcessingTask {
                    status: TaskStatus::parse(&status)?,
                    last_seen_id: last_seen,
                    total_count: total as u64,
                    processed_count: processed as u64,
                    totals: StatsRow {
                        normal_savings: normal as u64,
                        webp_savings: webp as u64,
                        webp_conversions: webp_c as u64,
                        png_jpg_conversions: png_c as u64,
                    },
                    started_at: start as u64,
                    updated_at: upd as u64,
                }))
            }
            None => Ok(None),
        }
    }

    pub fn save_stats_task(&self, task: &ProcessingTask) -> Result<(), OptimizeError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO stats_task
                 (id, status, last_seen_id, total_count, processed_count,
                  normal_savings, webp_savings, webp_conversions, png_jpg_conversions,
                  started_at, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 last_seen_id = excluded.last_seen_id,
                 total_count = excluded.total_count,
                 processed_count = excluded.processed_count,
                 normal_savings = excluded.normal_savings,
                 webp_savings = excluded.webp_savings,
                 webp_conversions = excluded.webp_conversions,
                 png_jpg_conversions = excluded.png_jpg_conversions,
                 started_at = excluded.started_at,
                 updated_at = excluded.updated_at",
            params![
                task.status.as_str(),
                task.last_seen_id,
                task.total_count as i64,
                task.processed_count as i64,
                task.totals.normal_savings as i64,
                task.totals.webp_savings as i64,
                task.totals.webp_conversions as i64,
                task.totals.png_jpg_conversions as i64,
                task.started_at as i64,
                task.updated_at as i64
            ],
        )?;
        Ok(())
    }

    /// Drop the checkpoint, forcing the next aggregation to start from zero
    pub fn reset_stats_task(&self) -> Result<(), OptimizeError> {
        let conn = self.lock();
        conn.execute("DELETE FROM stats_task", [])?;
        Ok(())
    }

    // ---- directory ingestion ----------------------------------------------

    /// Register every not-yet-known image under the library root as an
    /// attachment, generating the standard thumbnail variants.
    ///
    /// This stands in for the host CMS upload pipeline: attachments are
    /// created here and never by the optimization flow.
    pub fn ingest_directory(&self, sizes: &[ThumbnailSpec]) -> Result<usize, OptimizeError> {
        let backup_root = self.backup_root();
        let mut added = 0;

        for entry in WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let path = entry.path();
            if !FileManager::is_image(path) || path.starts_with(&backup_root) {
                continue;
            }
            if is_generated_variant(path, sizes) {
                continue;
            }

            let relative = path
                .strip_prefix(&self.root)
                .map_err(|_| {
                    OptimizeError::Validation(format!(
                        "File outside library root: {}",
                        path.display()
                    ))
                })?
                .to_string_lossy()
                .to_string();

            if self.attachment_exists(&relative)? {
                continue;
            }

            let (width, height) = match thumbnails::image_dimensions(path) {
                Ok(dims) => dims,
                Err(e) => {
                    warn!("Skipping unreadable image {}: {}", path.display(), e);
                    continue;
                }
            };
            let filesize = std::fs::metadata(path)?.len();

            let generated = thumbnails::generate(path, sizes)?;
            let mut size_map = BTreeMap::new();
            for (name, thumb) in generated {
                let thumb_relative = thumb
                    .file
                    .strip_prefix(&self.root)
                    .unwrap_or(&thumb.file)
                    .to_string_lossy()
                    .to_string();
                size_map.insert(
                    name,
                    SizeMetadata {
                        file: thumb_relative,
                        width: thumb.width,
                        height: thumb.height,
                        filesize: thumb.filesize,
                        mime_type: FileManager::mime_type(&thumb.file).to_string(),
                    },
                );
            }

            let metadata = AttachmentMetadata {
                width,
                height,
                filesize,
                sizes: size_map,
            };
            let id =
                self.insert_attachment(&relative, FileManager::mime_type(path), &metadata)?;
            debug!("Registered attachment {}: {}", id, relative);
            added += 1;
        }

        info!("Registered {} new attachments", added);
        Ok(added)
    }
}

/// Heuristic: skip `<stem>-<size>.<ext>` files produced by thumbnail generation
fn is_generated_variant(path: &Path, sizes: &[ThumbnailSpec]) -> bool {
    let stem = match path.file_stem() {
        Some(s) => s.to_string_lossy().to_string(),
        None => return false,
    };
    sizes
        .iter()
        .any(|spec| stem.ends_with(&format!("-{}", spec.name)))
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

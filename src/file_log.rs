//! Durable record of files already uploaded.
//!
//! One row per path relative to the monitored base directory. A file counts
//! as logged when its mtime matches the stored one, or failing that, when
//! its content hash does.

use crate::error::{ErrorContext, Result, UploaderError};
use crate::logging::{log_debug, log_info, log_warn};
use crate::upload_queue::calculate_file_hash;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Component, Path, PathBuf};

const COMPONENT: &str = "file-log";

/// Version stored in `PRAGMA user_version` once migrations have run.
///
/// 1: `Uploads` keyed by hash with a unique `filePath`.
/// 2: `uploaded_files` keyed by relative path.
pub const SCHEMA_VERSION: i32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLogEntry {
    pub relative_path: String,
    pub hash: String,
    pub modified: Option<String>,
}

#[derive(Debug)]
pub struct FileLog {
    conn: Connection,
    base_dir: Option<PathBuf>,
}

impl FileLog {
    /// Open (creating if needed) the log database and bring its schema up to date.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create upload log directory")?;
        }

        let conn = Connection::open(db_path).context("Failed to open upload log")?;
        let log = Self::from_connection(conn)?;

        log_info(
            COMPONENT,
            &format!("✓ Upload log opened at {}", db_path.display()),
        )
        .unwrap_or_default();

        Ok(log)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        migrate(&mut conn)?;
        Ok(Self {
            conn,
            base_dir: None,
        })
    }

    /// Later paths are stored relative to `path`.
    pub fn set_base_path(&mut self, path: &Path) {
        self.base_dir = Some(path.to_path_buf());
    }

    pub fn base_path(&self) -> Option<&Path> {
        self.base_dir.as_deref()
    }

    /// Has this file's current content already been uploaded?
    ///
    /// Database and filesystem errors count as "not logged".
    pub fn is_logged(&self, path: &Path) -> bool {
        match self.check_logged(path) {
            Ok(logged) => logged,
            Err(e) => {
                log_warn(
                    COMPONENT,
                    &format!("Cannot check {} against the log: {}", path.display(), e),
                )
                .unwrap_or_default();
                false
            }
        }
    }

    fn check_logged(&self, path: &Path) -> Result<bool> {
        let (absolute, relative) = self.resolve(path);

        let Some(entry) = self.entry_for(&relative)? else {
            return Ok(false);
        };

        // Unchanged mtime: trust it without re-hashing.
        if let (Some(stored), Some(current)) = (&entry.modified, modified_timestamp(&absolute)) {
            if *stored == current {
                return Ok(true);
            }
        }

        // Same bytes under a new mtime (touched, copied, rewritten).
        match calculate_file_hash(&absolute) {
            Ok(hash) => Ok(hash == entry.hash),
            Err(e) => {
                log_debug(COMPONENT, &e).unwrap_or_default();
                Ok(false)
            }
        }
    }

    /// Record the file's current hash and mtime, replacing any older entry.
    pub fn add_file(&self, path: &Path) -> Result<()> {
        let (absolute, relative) = self.resolve(path);
        let hash = calculate_file_hash(&absolute).map_err(UploaderError::Other)?;
        let modified = modified_timestamp(&absolute);

        self.conn.execute(
            "INSERT OR REPLACE INTO uploaded_files (file_path, hash, modified)
             VALUES (?1, ?2, ?3)",
            params![relative, hash, modified],
        )?;

        log_debug(COMPONENT, &format!("Logged {} ({})", relative, hash)).unwrap_or_default();
        Ok(())
    }

    /// The subset of `paths` that still needs uploading.
    pub fn filter_out_logged(&self, paths: Vec<PathBuf>) -> Vec<PathBuf> {
        paths
            .into_iter()
            .filter(|path| !self.is_logged(path))
            .collect()
    }

    pub fn clear(&self) -> Result<()> {
        let removed = self.conn.execute("DELETE FROM uploaded_files", [])?;
        log_info(COMPONENT, &format!("Cleared {} log entries", removed)).unwrap_or_default();
        Ok(())
    }

    pub fn entry(&self, path: &Path) -> Result<Option<FileLogEntry>> {
        let (_, relative) = self.resolve(path);
        self.entry_for(&relative)
    }

    pub fn len(&self) -> Result<usize> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM uploaded_files", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn entry_for(&self, relative: &str) -> Result<Option<FileLogEntry>> {
        let entry = self
            .conn
            .query_row(
                "SELECT file_path, hash, modified FROM uploaded_files WHERE file_path = ?1",
                params![relative],
                |row| {
                    Ok(FileLogEntry {
                        relative_path: row.get(0)?,
                        hash: row.get(1)?,
                        modified: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    /// Absolute path for reading the file, relative key for storage.
    fn resolve(&self, path: &Path) -> (PathBuf, String) {
        let absolute = match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        };

        let relative = self
            .base_dir
            .as_deref()
            .and_then(|base| absolute.strip_prefix(base).ok())
            .map(path_key)
            .unwrap_or_else(|| path_key(&absolute));

        (absolute, relative)
    }
}

/// `/`-separated key so the same tree maps to the same rows on every platform.
pub(crate) fn path_key(path: &Path) -> String {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            Component::ParentDir => Some("..".to_string()),
            Component::RootDir | Component::Prefix(_) | Component::CurDir => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn modified_timestamp(path: &Path) -> Option<String> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(DateTime::<Utc>::from(modified).to_rfc3339_opts(SecondsFormat::Nanos, true))
}

fn schema_version(conn: &Connection) -> Result<i32> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

fn migrate(conn: &mut Connection) -> Result<()> {
    let version = schema_version(conn)?;
    if version >= SCHEMA_VERSION {
        return Ok(());
    }

    log_info(
        COMPONENT,
        &format!(
            "Upgrading upload log schema {} -> {}",
            version, SCHEMA_VERSION
        ),
    )
    .unwrap_or_default();

    let tx = conn.transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS uploaded_files (
            file_path TEXT PRIMARY KEY NOT NULL,
            hash TEXT NOT NULL,
            modified TEXT
        )",
    )?;

    if version == 1 {
        tx.execute_batch(
            "INSERT OR REPLACE INTO uploaded_files (file_path, hash, modified)
                SELECT filePath, hash, modified FROM Uploads;
             DROP TABLE Uploads;",
        )?;
    }

    tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    tx.commit()?;

    Ok(())
}

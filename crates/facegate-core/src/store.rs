//! SQLite-backed enrollment store.
//!
//! One row per identity, keyed by id. Only the 8-bit grids are persisted:
//! the averaged patch (`face_img`) and the raw captures (`face_images`,
//! concatenated). The float vector is rebuilt from `face_img` on load.

use crate::sample::{FaceSample, SAMPLE_LEN};
use crate::types::EnrolledIdentity;
use rusqlite::{params, Connection, Row};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id          TEXT PRIMARY KEY NOT NULL,
    name        TEXT NOT NULL,
    face_img    BLOB NOT NULL,
    face_images BLOB NOT NULL,
    created_at  TEXT NOT NULL
);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("enrollment store unavailable at {}: {reason}", path.display())]
    Unavailable { path: PathBuf, reason: String },
    #[error("corrupt record {id}: {reason}")]
    CorruptRecord { id: String, reason: String },
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result of a best-effort full load.
#[derive(Debug)]
pub struct LoadReport {
    /// Identities in ascending id order.
    pub identities: Vec<EnrolledIdentity>,
    /// Records that could not be decoded.
    pub skipped: usize,
}

/// Lightweight listing entry; no pixel data.
#[derive(Debug, Clone, Serialize)]
pub struct IdentitySummary {
    pub id: String,
    pub name: String,
    pub samples: usize,
    pub created_at: String,
}

/// Row as read from SQLite, before validation.
struct RawRecord {
    id: String,
    name: String,
    face_img: Vec<u8>,
    face_images: Vec<u8>,
}

impl RawRecord {
    /// Column type problems belong to the record, not the query.
    fn from_row(row: &Row<'_>) -> Result<Self, StoreError> {
        let read = || -> rusqlite::Result<Self> {
            Ok(RawRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                face_img: row.get(2)?,
                face_images: row.get(3)?,
            })
        };
        read().map_err(|e| StoreError::CorruptRecord {
            id: row.get::<_, String>(0).unwrap_or_default(),
            reason: e.to_string(),
        })
    }

    fn decode(self) -> Result<EnrolledIdentity, StoreError> {
        let RawRecord {
            id,
            name,
            face_img,
            face_images,
        } = self;
        let corrupt = |reason: String| StoreError::CorruptRecord {
            id: id.clone(),
            reason,
        };

        let face_img =
            FaceSample::from_raw(face_img).map_err(|e| corrupt(format!("face_img: {e}")))?;

        if face_images.is_empty() || face_images.len() % SAMPLE_LEN != 0 {
            return Err(corrupt(format!(
                "face_images holds {} bytes, not a whole number of {SAMPLE_LEN}-byte samples",
                face_images.len()
            )));
        }
        let face_images = face_images
            .chunks_exact(SAMPLE_LEN)
            .map(|chunk| FaceSample::from_raw(chunk.to_vec()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| corrupt(format!("face_images: {e}")))?;

        Ok(EnrolledIdentity::from_parts(id, name, face_img, face_images))
    }
}

/// Durable mapping from identity id to enrolled identity.
pub struct EnrollmentStore {
    conn: Connection,
    path: PathBuf,
}

impl EnrollmentStore {
    /// Open (or create) the store at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| unavailable(path, e))?;
        }
        let conn = Connection::open(path).map_err(|e| unavailable(path, e))?;
        Self::init(conn, path.to_path_buf())
    }

    /// Open a throwaway store that lives only as long as the handle.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, PathBuf::from(":memory:"))
    }

    fn init(conn: Connection, path: PathBuf) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| unavailable(&path, e))?;
        tracing::debug!(path = %path.display(), "enrollment store opened");
        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist a full record, replacing any existing record with the same id.
    pub fn save(&self, identity: &EnrolledIdentity) -> Result<(), StoreError> {
        let face_images: Vec<u8> = identity
            .face_images()
            .iter()
            .flat_map(|s| s.as_bytes().iter().copied())
            .collect();
        let created_at = chrono::Utc::now().to_rfc3339();

        self.conn.execute(
            "INSERT INTO identities (id, name, face_img, face_images, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 face_img = excluded.face_img,
                 face_images = excluded.face_images,
                 created_at = excluded.created_at",
            params![
                identity.id(),
                identity.name(),
                identity.face_img().as_bytes(),
                face_images,
                created_at,
            ],
        )?;

        tracing::info!(
            id = identity.id(),
            name = identity.name(),
            samples = identity.face_images().len(),
            "identity saved"
        );
        Ok(())
    }

    /// Load every record. Undecodable records are skipped and counted.
    pub fn load_all(&self) -> Result<LoadReport, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, face_img, face_images FROM identities ORDER BY id")
            .map_err(|e| unavailable(&self.path, e))?;

        let rows = stmt
            .query_map([], |row| Ok(RawRecord::from_row(row)))
            .map_err(|e| unavailable(&self.path, e))?;

        let mut identities = Vec::new();
        let mut skipped = 0usize;

        for row in rows {
            // A failing step means the table itself cannot be read.
            let record = row.map_err(|e| unavailable(&self.path, e))?;
            match record.and_then(RawRecord::decode) {
                Ok(identity) => identities.push(identity),
                Err(e) => {
                    skipped += 1;
                    tracing::warn!(error = %e, "skipping unreadable identity record");
                }
            }
        }

        tracing::info!(
            path = %self.path.display(),
            loaded = identities.len(),
            skipped,
            "enrollment store loaded"
        );
        Ok(LoadReport {
            identities,
            skipped,
        })
    }

    /// List enrolled identities without decoding pixel data.
    pub fn list(&self) -> Result<Vec<IdentitySummary>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, length(face_images), created_at FROM identities ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            let bytes: i64 = row.get(2)?;
            Ok(IdentitySummary {
                id: row.get(0)?,
                name: row.get(1)?,
                samples: bytes.max(0) as usize / SAMPLE_LEN,
                created_at: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM identities", [], |row| row.get(0))?;
        Ok(n.max(0) as usize)
    }
}

fn unavailable(path: &Path, err: impl std::fmt::Display) -> StoreError {
    StoreError::Unavailable {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

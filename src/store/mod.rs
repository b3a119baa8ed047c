//! Durable single-writer document snapshots keyed by document id.
//!
//! Persistence is atomic write-then-rename: a save writes `<id>.tmp`
//! then renames it over `<id>.json`, so a concurrent `load` never
//! observes a half-written file.

use std::path::{Path, PathBuf};

use thiserror::Error;
use uuid::Uuid;

use crate::document::Document;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error persisting document {id}: {source}")]
    Io {
        id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize document {0}")]
    Serialize(String, #[source] serde_json::Error),
}

/// Filesystem-backed `Document` persistence.
///
/// A corrupt or empty snapshot is treated as absent on `load` — the
/// store never guesses at content, it only reports "nothing here".
#[derive(Debug, Clone)]
pub struct DocumentStore {
    root: PathBuf,
}

impl DocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    fn tmp_path_for(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.tmp"))
    }

    /// Load a document snapshot. Returns `Ok(None)` for a missing,
    /// empty, or unparsable file rather than surfacing a distinct error —
    /// callers treat all three as "create a fresh record".
    pub async fn load(&self, id: &str) -> Result<Option<Document>, StoreError> {
        let path = self.path_for(id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::Io { id: id.to_string(), source: err }),
        };
        if raw.trim().is_empty() {
            log::warn!("document {id} snapshot is empty, treating as absent");
            return Ok(None);
        }
        match serde_json::from_str::<SnapshotRecord>(&raw) {
            Ok(record) => Ok(Some(record.into_document())),
            Err(err) => {
                log::warn!("document {id} snapshot is corrupt, treating as absent: {err}");
                Ok(None)
            }
        }
    }

    /// Persist `doc` atomically. On failure, best-effort removes the
    /// partial temp file and surfaces the error to the caller — the
    /// engine treats this as non-fatal and retries on the next flush.
    pub async fn save(&self, doc: &Document) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StoreError::Io { id: doc.id.clone(), source: e })?;

        let record = SnapshotRecord::from_document(doc);
        let body = serde_json::to_string_pretty(&record)
            .map_err(|e| StoreError::Serialize(doc.id.clone(), e))?;

        let tmp_path = self.tmp_path_for(&doc.id);
        let final_path = self.path_for(&doc.id);

        let write_result = tokio::fs::write(&tmp_path, body.as_bytes()).await;
        if let Err(err) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io { id: doc.id.clone(), source: err });
        }

        if let Err(err) = tokio::fs::rename(&tmp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io { id: doc.id.clone(), source: err });
        }

        Ok(())
    }

    /// Allocate a fresh id, build an empty document, and persist it.
    pub async fn create(&self, title: String, user_id: Option<String>) -> Result<Document, StoreError> {
        let id = Uuid::new_v4().to_string();
        let doc = Document::new(id, title, user_id);
        self.save(&doc).await?;
        Ok(doc)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Self-describing on-disk record: all `Document` fields plus
/// `last_saved`, and an observational `active_users` field that is
/// always written empty and never read back (presence is transient).
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct SnapshotRecord {
    #[serde(flatten)]
    document: Document,
    last_saved: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    active_users: serde_json::Value,
}

impl SnapshotRecord {
    fn from_document(doc: &Document) -> Self {
        Self {
            document: doc.clone(),
            last_saved: chrono::Utc::now(),
            active_users: serde_json::json!({}),
        }
    }

    fn into_document(self) -> Document {
        self.document
    }
}

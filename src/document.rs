//! Document data model: the persisted snapshot plus the live presence
//! state layered on top of it by the engine.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ot::Op;

/// A document's persisted content and bookkeeping.
///
/// `version` increments once per flush that applied at least one
/// operation and is what clients reconcile a `document-sync` against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub content: String,
    pub version: u64,
    /// Bounded tail of applied ops, retained for immediate-echo transform.
    pub operations_tail: Vec<Op>,
    pub metadata: DocumentMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub created_by: Option<String>,
    pub last_modified_by: Option<String>,
    pub word_count: usize,
    pub character_count: usize,
    pub status: DocumentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub last_accessed_by: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Draft,
    Published,
    Archived,
}

impl Document {
    pub fn new(id: impl Into<String>, title: impl Into<String>, created_by: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            content: String::new(),
            version: 0,
            operations_tail: Vec::new(),
            metadata: DocumentMetadata {
                created_by: created_by.clone(),
                last_modified_by: created_by,
                word_count: 0,
                character_count: 0,
                status: DocumentStatus::Draft,
                created_at: now,
                updated_at: now,
                last_accessed_at: now,
                last_accessed_by: None,
            },
        }
    }

    /// Recompute word/character counts from `content`, called once per
    /// committing flush.
    pub fn recount(&mut self) {
        self.metadata.character_count = self.content.chars().count();
        self.metadata.word_count = self
            .content
            .split_whitespace()
            .filter(|w| !w.is_empty())
            .count();
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            id: self.id.clone(),
            title: self.title.clone(),
            content: self.content.clone(),
            version: self.version,
            metadata: self.metadata.clone(),
        }
    }
}

/// Wire-facing view of a document's canonical state, sent as
/// `document-state` on join and reconciled via `document-sync`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub id: String,
    pub title: String,
    pub content: String,
    pub version: u64,
    pub metadata: DocumentMetadata,
}

/// One connected collaborator's presence record, keyed by session id in
/// the engine's live state — not persisted with the document (reloaded
/// as empty, per the store's "presence is transient" rule).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Presence {
    pub user_id: String,
    pub display_name: String,
    pub color: String,
    pub avatar: Option<String>,
    pub joined_at: DateTime<Utc>,
    pub cursor: Option<Cursor>,
    pub last_cursor_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Cursor {
    pub position: usize,
    pub selection_end: Option<usize>,
}

/// Aggregate counters exposed over `GET /api/documents/:id/stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentStats {
    pub id: String,
    pub version: u64,
    pub active_user_count: usize,
    pub tail_length: usize,
    pub queued_count: usize,
    pub metadata: DocumentMetadata,
    pub updated_at: DateTime<Utc>,
}

/// A deterministic pseudo-color assigned to a new participant from a
/// fixed palette, keyed off the seed's byte sum.
pub fn assign_color(seed: &str) -> String {
    const PALETTE: [&str; 8] = [
        "#e06c75", "#98c379", "#e5c07b", "#61afef", "#c678dd", "#56b6c2", "#d19a66", "#be5046",
    ];
    let index = seed.bytes().fold(0usize, |acc, b| acc.wrapping_add(b as usize)) % PALETTE.len();
    PALETTE[index].to_string()
}

pub type ActiveUsers = HashMap<String, Presence>;

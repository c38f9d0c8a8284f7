//! Record types for storing posts.

use crate::{RecordId, Timestamp};
use serde::{Deserialize, Serialize};

/// Prefix of identifiers generated on the device before the server assigns one.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Generate a fresh client-side identifier.
pub fn local_id() -> RecordId {
    format!("{}{}", LOCAL_ID_PREFIX, uuid::Uuid::new_v4())
}

/// Whether an identifier was generated locally and never confirmed by the server.
pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

/// A post as seen by the UI and the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Unique identifier for this record
    pub id: RecordId,
    pub title: String,
    pub content: String,
    pub author: String,
    /// When the record was first created
    pub created_at: Timestamp,
    /// Last modification time, the only field used for conflict resolution
    pub updated_at: Timestamp,
}

impl Record {
    /// Build a record from a create intent.
    pub fn new(id: impl Into<RecordId>, input: NewRecord, now: Timestamp) -> Self {
        Self {
            id: id.into(),
            title: input.title,
            content: input.content,
            author: input.author,
            created_at: now,
            updated_at: now,
        }
    }

    /// Merge a patch into this record and bump `updated_at`.
    pub fn apply_patch(&mut self, patch: &RecordPatch, now: Timestamp) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(content) = &patch.content {
            self.content = content.clone();
        }
        if let Some(author) = &patch.author {
            self.author = author.clone();
        }
        self.updated_at = now;
    }

    /// Fields of this record as a create payload.
    pub fn to_new_record(&self) -> NewRecord {
        NewRecord {
            title: self.title.clone(),
            content: self.content.clone(),
            author: self.author.clone(),
        }
    }
}

/// Body of a create intent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRecord {
    pub title: String,
    pub content: String,
    pub author: String,
}

impl NewRecord {
    pub fn new(
        title: impl Into<String>,
        content: impl Into<String>,
        author: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            author: author.into(),
        }
    }
}

/// A partial record. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

impl RecordPatch {
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    /// True when no field is set.
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.content.is_none() && self.author.is_none()
    }

    /// Overlay `newer` on top of this patch; fields set in `newer` win.
    pub fn merge(&mut self, newer: RecordPatch) {
        if newer.title.is_some() {
            self.title = newer.title;
        }
        if newer.content.is_some() {
            self.content = newer.content;
        }
        if newer.author.is_some() {
            self.author = newer.author;
        }
    }
}

impl From<NewRecord> for RecordPatch {
    fn from(input: NewRecord) -> Self {
        Self {
            title: Some(input.title),
            content: Some(input.content),
            author: Some(input.author),
        }
    }
}

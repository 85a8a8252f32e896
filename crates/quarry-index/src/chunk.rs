//! Chunk and change-set model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use quarry_memory::IndexRecord;

use crate::hash::content_hash;

/// A contiguous, typed fragment of a source file.
///
/// `id` addresses storage and is derived from position; `content_hash`
/// decides equality. Two chunks with equal hashes are the same chunk
/// wherever they sit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub file_path: String,
    pub content: String,
    pub language: String,
    pub start_line: usize,
    pub end_line: usize,
    pub chunk_type: String,
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity_score: Option<f32>,
}

/// `path:start-end`
#[must_use]
pub fn positional_id(file_path: &str, start_line: usize, end_line: usize) -> String {
    format!("{file_path}:{start_line}-{end_line}")
}

impl Chunk {
    #[must_use]
    pub fn new(
        file_path: &str,
        content: String,
        language: &str,
        (start_line, end_line): (usize, usize),
        chunk_type: &str,
    ) -> Self {
        Self {
            id: positional_id(file_path, start_line, end_line),
            file_path: file_path.to_owned(),
            content_hash: content_hash(&content),
            content,
            language: language.to_owned(),
            start_line,
            end_line,
            chunk_type: chunk_type.to_owned(),
            dependencies: Vec::new(),
            complexity_score: None,
        }
    }

    #[must_use]
    pub fn to_record(&self, processed_at: DateTime<Utc>) -> IndexRecord {
        IndexRecord {
            id: self.id.clone(),
            file_path: self.file_path.clone(),
            content: self.content.clone(),
            language: self.language.clone(),
            start_line: self.start_line,
            end_line: self.end_line,
            chunk_type: self.chunk_type.clone(),
            content_hash: Some(self.content_hash.clone()),
            processed_at,
        }
    }

    /// Rebuild a chunk from its stored record, hashing the content when the
    /// record predates stored digests.
    #[must_use]
    pub fn from_record(record: &IndexRecord) -> Self {
        Self {
            id: record.id.clone(),
            file_path: record.file_path.clone(),
            content: record.content.clone(),
            language: record.language.clone(),
            start_line: record.start_line,
            end_line: record.end_line,
            chunk_type: record.chunk_type.clone(),
            content_hash: record
                .content_hash
                .clone()
                .unwrap_or_else(|| content_hash(&record.content)),
            dependencies: Vec::new(),
            complexity_score: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    Added,
    Modified,
    Deleted,
    Renamed,
}

/// One entry of a change set produced by an external change detector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub status: ChangeStatus,
    /// Former path of a renamed file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_path: Option<String>,
}

impl FileChange {
    #[must_use]
    pub fn added(path: &str) -> Self {
        Self {
            path: path.to_owned(),
            status: ChangeStatus::Added,
            previous_path: None,
        }
    }

    #[must_use]
    pub fn modified(path: &str) -> Self {
        Self {
            path: path.to_owned(),
            status: ChangeStatus::Modified,
            previous_path: None,
        }
    }

    #[must_use]
    pub fn deleted(path: &str) -> Self {
        Self {
            path: path.to_owned(),
            status: ChangeStatus::Deleted,
            previous_path: None,
        }
    }

    #[must_use]
    pub fn renamed(from: &str, to: &str) -> Self {
        Self {
            path: to.to_owned(),
            status: ChangeStatus::Renamed,
            previous_path: Some(from.to_owned()),
        }
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::chunking::ChunkingConfig;

pub const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum RealmTag {
    Finance,
    Medical,
    #[default]
    General,
}

impl RealmTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            RealmTag::Finance => "finance",
            RealmTag::Medical => "medical",
            RealmTag::General => "general",
        }
    }
}

impl fmt::Display for RealmTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One chunk of a document as stored on a metadata log line.
///
/// Every field has a serde default so that a line written by an older build,
/// or the empty placeholder substituted for a missing line, still decodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ChunkRecord {
    #[serde(default)]
    pub chunk_id: String,
    #[serde(default, rename = "source")]
    pub source_document: String,
    #[serde(default, rename = "page")]
    pub page_number: u32,
    #[serde(default, rename = "chunk_index")]
    pub sequence_index: u64,
    #[serde(default)]
    pub text: String,
    #[serde(default, rename = "realm", skip_serializing_if = "Option::is_none")]
    pub realm_tag: Option<RealmTag>,
}

impl ChunkRecord {
    pub fn is_placeholder(&self) -> bool {
        self.chunk_id.is_empty() && self.text.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    pub score: f32,
    pub metadata: ChunkRecord,
}

#[derive(Debug, Clone)]
pub struct IngestionOptions {
    pub chunking: ChunkingConfig,
    pub finance_regex: &'static str,
    pub medical_regex: &'static str,
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig::default(),
            finance_regex: r"(?i)invoice|payment",
            medical_regex: r"(?i)patient|diagnosis",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetrievalOptions {
    pub overfetch_factor: usize,
    pub dedup_threshold: f64,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            overfetch_factor: 3,
            dedup_threshold: 0.8,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Completed,
    Empty,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub status: UploadStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<IngestionSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionSummary {
    pub namespace: String,
    pub filename: String,
    pub checksum: String,
    pub chunk_count: usize,
    pub total_vectors: usize,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskResponse {
    pub answer: String,
    pub sources: Vec<ChunkRecord>,
}

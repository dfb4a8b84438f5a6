//! Core data models used throughout DocChat.
//!
//! These types represent the documents, chunks, embeddings, quota records,
//! and chat sessions that flow through the ingestion and chat pipelines.
//! Timestamps are Unix seconds.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{DocChatError, Result};

/// Current time as Unix seconds.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

// ============ Documents ============

/// Declared source format of an uploaded document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Text,
    Markdown,
    Csv,
    Json,
    Pdf,
    Docx,
}

impl DocumentFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "txt",
            Self::Markdown => "md",
            Self::Csv => "csv",
            Self::Json => "json",
            Self::Pdf => "pdf",
            Self::Docx => "docx",
        }
    }

    /// Infer the format from a filename's extension.
    pub fn from_filename(filename: &str) -> Result<Self> {
        let ext = filename
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .ok_or_else(|| {
                DocChatError::Validation(format!("cannot infer format of '{}'", filename))
            })?;
        ext.parse()
    }

    /// Formats whose bytes are already UTF-8 text.
    pub fn is_plain_text(&self) -> bool {
        matches!(self, Self::Text | Self::Markdown | Self::Csv | Self::Json)
    }
}

impl FromStr for DocumentFormat {
    type Err = DocChatError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "txt" | "text" | "text/plain" => Ok(Self::Text),
            "md" | "markdown" | "text/markdown" => Ok(Self::Markdown),
            "csv" | "text/csv" => Ok(Self::Csv),
            "json" | "application/json" => Ok(Self::Json),
            "pdf" | "application/pdf" => Ok(Self::Pdf),
            "docx"
            | "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
                Ok(Self::Docx)
            }
            other => Err(DocChatError::Validation(format!(
                "unsupported document format: '{}'. Supported: txt, md, csv, json, pdf, docx",
                other
            ))),
        }
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing status of a document.
///
/// ```text
/// uploaded ──▶ chunking ──▶ embedding ──▶ ready
///                 │   ▲          │
///                 ▼   │ retry    │
///               failed ◀─────────┘
/// ```
///
/// Leaving `ready` happens only through deletion, which removes the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Uploaded,
    Chunking,
    Embedding,
    Ready,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Chunking => "chunking",
            Self::Embedding => "embedding",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    pub fn can_transition_to(self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;
        match (self, next) {
            (Uploaded, Chunking) => true,
            (Chunking, Embedding) | (Chunking, Failed) => true,
            (Embedding, Ready) | (Embedding, Failed) => true,
            (Failed, Chunking) => true,
            (Uploaded, _) | (Chunking, _) | (Embedding, _) | (Ready, _) | (Failed, _) => false,
        }
    }

    /// Checked transition; invalid moves are a [`DocChatError::Validation`].
    pub fn transition(self, next: DocumentStatus) -> Result<DocumentStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DocChatError::Validation(format!(
                "invalid document status transition: {} -> {}",
                self, next
            )))
        }
    }
}

impl FromStr for DocumentStatus {
    type Err = DocChatError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "uploaded" => Ok(Self::Uploaded),
            "chunking" => Ok(Self::Chunking),
            "embedding" => Ok(Self::Embedding),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            other => Err(DocChatError::Storage(format!(
                "unknown document status: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An uploaded document and its processing state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub owner_id: String,
    pub filename: String,
    pub format: DocumentFormat,
    pub status: DocumentStatus,
    pub chunk_count: usize,
    pub size_bytes: u64,
    /// Number of pipeline runs started (1 after the first ingestion).
    pub attempts: u32,
    /// Cause of the most recent failure; cleared on retry.
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Document {
    pub fn new(owner_id: &str, filename: &str, format: DocumentFormat, size_bytes: u64) -> Self {
        let now = now_ts();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            filename: filename.to_string(),
            format,
            status: DocumentStatus::Uploaded,
            chunk_count: 0,
            size_bytes,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, stamping `updated_at`.
    pub fn advance(&mut self, next: DocumentStatus) -> Result<()> {
        self.status = self.status.transition(next)?;
        self.updated_at = now_ts();
        Ok(())
    }
}

/// A contiguous, overlapping segment of a document's text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub ordinal: usize,
    pub text: String,
    /// Character offset of the first character in the source text.
    pub start: usize,
    /// Character offset one past the last character.
    pub end: usize,
    /// Leading characters shared with the previous chunk.
    pub overlap: usize,
    /// SHA-256 of `text`.
    pub hash: String,
}

/// The vector for one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub model: String,
    pub dims: usize,
}

// ============ Quota ============

/// A user's token budget, version-stamped for optimistic concurrency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaAccount {
    pub user_id: String,
    pub allocated: i64,
    pub consumed: i64,
    pub version: u64,
    pub updated_at: i64,
}

impl QuotaAccount {
    pub fn new(user_id: &str, allocated: i64) -> Self {
        Self {
            user_id: user_id.to_string(),
            allocated,
            consumed: 0,
            version: 0,
            updated_at: now_ts(),
        }
    }

    /// Tokens still available; negative after an over-budget reconcile.
    pub fn remaining(&self) -> i64 {
        self.allocated - self.consumed
    }
}

/// Handle returned by a successful reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationToken {
    pub id: String,
    pub user_id: String,
    pub estimated: i64,
}

/// Settlement state of a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ReservationState {
    Outstanding,
    Reconciled { actual: i64 },
    Released,
}

impl ReservationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Outstanding => "outstanding",
            Self::Reconciled { .. } => "reconciled",
            Self::Released => "released",
        }
    }

    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Outstanding)
    }
}

/// A provisional deduction held until a turn's actual cost is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: String,
    pub user_id: String,
    pub estimated: i64,
    pub state: ReservationState,
    pub session_id: Option<String>,
    pub created_at: i64,
    pub settled_at: Option<i64>,
}

impl Reservation {
    pub fn token(&self) -> ReservationToken {
        ReservationToken {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            estimated: self.estimated,
        }
    }
}

/// Kind of quota movement recorded in the usage log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageOperation {
    Chat,
    AdminAdjustment,
}

impl UsageOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::AdminAdjustment => "admin_adjustment",
        }
    }
}

impl FromStr for UsageOperation {
    type Err = DocChatError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "chat" => Ok(Self::Chat),
            "admin_adjustment" => Ok(Self::AdminAdjustment),
            other => Err(DocChatError::Storage(format!(
                "unknown usage operation: {}",
                other
            ))),
        }
    }
}

/// Append-only audit record of a quota movement.
///
/// `tokens` is what the user was billed for `Chat`, and the allocation
/// delta for `AdminAdjustment`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEntry {
    pub user_id: String,
    pub tokens: i64,
    pub operation: UsageOperation,
    pub session_id: Option<String>,
    pub reservation_id: Option<String>,
    pub detail: Option<String>,
    pub created_at: i64,
}

// ============ Chat ============

/// A conversation owned by one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub system_prompt: Option<String>,
    pub archived: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ChatSession {
    pub fn new(owner_id: &str, title: Option<&str>, system_prompt: Option<&str>) -> Self {
        let now = chrono::Utc::now();
        let title = match title.map(str::trim) {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => format!("New Chat - {}", now.format("%Y-%m-%d %H:%M:%S")),
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            title,
            system_prompt: system_prompt.map(str::to_string),
            archived: false,
            created_at: now.timestamp(),
            updated_at: now.timestamp(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl FromStr for Role {
    type Err = DocChatError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(DocChatError::Storage(format!("unknown role: {}", other))),
        }
    }
}

/// One committed message in a session. Immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub session_id: String,
    pub seq: u64,
    pub role: Role,
    pub text: String,
    /// Chunks supplied as context when generating this turn.
    pub context_chunk_ids: Vec<String>,
    pub tokens_billed: i64,
    pub created_at: i64,
}

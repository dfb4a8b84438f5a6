//! Storage abstraction for DocChat.
//!
//! The [`Store`] trait defines every persistence operation the ingestion,
//! quota, and chat pipelines need, so backends are pluggable. The
//! application crate ships a SQLite implementation; [`memory::InMemoryStore`]
//! backs tests.
//!
//! Implementations must be `Send + Sync` to work with async runtimes, and
//! must apply each multi-record write ([`replace_chunks`](Store::replace_chunks),
//! [`commit_quota`](Store::commit_quota), [`append_turns`](Store::append_turns))
//! atomically.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{
    ChatSession, Chunk, Document, DocumentStatus, Embedding, QuotaAccount, Reservation, Turn,
    UsageEntry,
};
use crate::quota::QuotaCommit;

/// Abstract storage backend.
///
/// # Operations
///
/// | Group | Methods |
/// |-------|---------|
/// | Documents | `insert_document`, `update_document`, `get_document`, `document_source`, `list_documents`, `documents_with_status`, `delete_document` |
/// | Chunks | `replace_chunks`, `clear_chunks`, `get_chunks`, `load_embeddings` |
/// | Quota | `create_account`, `get_account`, `get_reservation`, `list_reservations`, `commit_quota`, `usage_log` |
/// | Chat | `insert_session`, `get_session`, `list_sessions`, `append_turns`, `list_turns`, `next_turn_seq` |
#[async_trait]
pub trait Store: Send + Sync {
    /// Persist a new document together with its raw source bytes.
    async fn insert_document(&self, doc: &Document, source: &[u8]) -> Result<()>;

    /// Overwrite a document's mutable fields (status, counts, error).
    async fn update_document(&self, doc: &Document) -> Result<()>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    async fn document_source(&self, id: &str) -> Result<Option<Vec<u8>>>;

    /// Documents owned by `owner_id`, newest first.
    async fn list_documents(&self, owner_id: &str) -> Result<Vec<Document>>;

    async fn documents_with_status(&self, status: DocumentStatus) -> Result<Vec<Document>>;

    /// Remove a document with its source, chunks, and embeddings. Returns
    /// whether it existed.
    async fn delete_document(&self, id: &str) -> Result<bool>;

    /// Atomically replace all chunks and embeddings of a document.
    async fn replace_chunks(
        &self,
        document_id: &str,
        chunks: &[Chunk],
        embeddings: &[Embedding],
    ) -> Result<()>;

    async fn clear_chunks(&self, document_id: &str) -> Result<()>;

    /// Fetch chunks by id; unknown ids are skipped.
    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>>;

    /// Every chunk of a document paired with its embedding, by ordinal.
    async fn load_embeddings(&self, document_id: &str) -> Result<Vec<(Chunk, Embedding)>>;

    /// Create an account unless one exists. Returns whether it was created.
    async fn create_account(&self, account: &QuotaAccount) -> Result<bool>;

    async fn get_account(&self, user_id: &str) -> Result<Option<QuotaAccount>>;

    async fn get_reservation(&self, id: &str) -> Result<Option<Reservation>>;

    async fn list_reservations(&self, user_id: &str) -> Result<Vec<Reservation>>;

    /// Apply a [`QuotaCommit`] if its preconditions hold. Returns `false`
    /// without writing anything when the account version moved or a settled
    /// reservation is no longer outstanding.
    async fn commit_quota(&self, commit: &QuotaCommit) -> Result<bool>;

    /// Most recent usage entries for a user, newest first.
    async fn usage_log(&self, user_id: &str, limit: usize) -> Result<Vec<UsageEntry>>;

    async fn insert_session(&self, session: &ChatSession) -> Result<()>;

    async fn get_session(&self, id: &str) -> Result<Option<ChatSession>>;

    /// Sessions owned by `owner_id`, most recently updated first.
    async fn list_sessions(&self, owner_id: &str) -> Result<Vec<ChatSession>>;

    /// Atomically append turns and bump the session's `updated_at`. A turn
    /// whose `seq` already exists fails the whole append with
    /// [`Conflict`](crate::DocChatError::Conflict).
    async fn append_turns(&self, turns: &[Turn]) -> Result<()>;

    /// Turns of a session in `seq` order, skipping `skip` and returning at
    /// most `limit`.
    async fn list_turns(&self, session_id: &str, limit: usize, skip: usize) -> Result<Vec<Turn>>;

    /// One past the highest committed `seq`, or 0.
    async fn next_turn_seq(&self, session_id: &str) -> Result<u64>;
}

//! SQLite-backed [`Store`] implementation.
//!
//! Multi-record writes run inside one transaction. The quota commit is a
//! version-guarded `UPDATE ... WHERE version = ?`, so a stale writer sees
//! zero affected rows and rolls back.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use docchat_core::embedding::{blob_to_vec, vec_to_blob};
use docchat_core::models::{
    ChatSession, Chunk, Document, DocumentStatus, Embedding, QuotaAccount, Reservation,
    ReservationState, Turn, UsageEntry,
};
use docchat_core::quota::{QuotaCommit, ReservationChange};
use docchat_core::store::Store;
use docchat_core::{DocChatError, Result};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn storage(e: sqlx::Error) -> DocChatError {
    DocChatError::Storage(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

const DOCUMENT_COLUMNS: &str = "id, owner_id, filename, format, status, chunk_count, size_bytes, \
                                attempts, last_error, created_at, updated_at";

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let format: String = row.get("format");
    let status: String = row.get("status");
    Ok(Document {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        filename: row.get("filename"),
        format: format.parse()?,
        status: status.parse()?,
        chunk_count: row.get::<i64, _>("chunk_count") as usize,
        size_bytes: row.get::<i64, _>("size_bytes") as u64,
        attempts: row.get::<i64, _>("attempts") as u32,
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_chunk(row: &SqliteRow) -> Chunk {
    Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        ordinal: row.get::<i64, _>("ordinal") as usize,
        text: row.get("text"),
        start: row.get::<i64, _>("start_offset") as usize,
        end: row.get::<i64, _>("end_offset") as usize,
        overlap: row.get::<i64, _>("overlap") as usize,
        hash: row.get("hash"),
    }
}

fn row_to_account(row: &SqliteRow) -> QuotaAccount {
    QuotaAccount {
        user_id: row.get("user_id"),
        allocated: row.get("allocated"),
        consumed: row.get("consumed"),
        version: row.get::<i64, _>("version") as u64,
        updated_at: row.get("updated_at"),
    }
}

fn row_to_reservation(row: &SqliteRow) -> Result<Reservation> {
    let state: String = row.get("state");
    let actual: Option<i64> = row.get("actual");
    let state = match (state.as_str(), actual) {
        ("outstanding", _) => ReservationState::Outstanding,
        ("reconciled", Some(actual)) => ReservationState::Reconciled { actual },
        ("released", _) => ReservationState::Released,
        (other, _) => {
            return Err(DocChatError::Storage(format!(
                "invalid reservation state: {}",
                other
            )))
        }
    };
    Ok(Reservation {
        id: row.get("id"),
        user_id: row.get("user_id"),
        estimated: row.get("estimated"),
        state,
        session_id: row.get("session_id"),
        created_at: row.get("created_at"),
        settled_at: row.get("settled_at"),
    })
}

fn row_to_session(row: &SqliteRow) -> ChatSession {
    ChatSession {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        title: row.get("title"),
        system_prompt: row.get("system_prompt"),
        archived: row.get::<i64, _>("archived") != 0,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_turn(row: &SqliteRow) -> Result<Turn> {
    let role: String = row.get("role");
    let ids: String = row.get("context_chunk_ids");
    Ok(Turn {
        session_id: row.get("session_id"),
        seq: row.get::<i64, _>("seq") as u64,
        role: role.parse()?,
        text: row.get("text"),
        context_chunk_ids: serde_json::from_str(&ids)
            .map_err(|e| DocChatError::Storage(format!("invalid context_chunk_ids: {}", e)))?,
        tokens_billed: row.get("tokens_billed"),
        created_at: row.get("created_at"),
    })
}

fn row_to_usage(row: &SqliteRow) -> Result<UsageEntry> {
    let operation: String = row.get("operation");
    Ok(UsageEntry {
        user_id: row.get("user_id"),
        tokens: row.get("tokens"),
        operation: operation.parse()?,
        session_id: row.get("session_id"),
        reservation_id: row.get("reservation_id"),
        detail: row.get("detail"),
        created_at: row.get("created_at"),
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_document(&self, doc: &Document, source: &[u8]) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, owner_id, filename, format, status, chunk_count,
                                   size_bytes, attempts, last_error, source, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.owner_id)
        .bind(&doc.filename)
        .bind(doc.format.as_str())
        .bind(doc.status.as_str())
        .bind(doc.chunk_count as i64)
        .bind(doc.size_bytes as i64)
        .bind(doc.attempts as i64)
        .bind(&doc.last_error)
        .bind(source)
        .bind(doc.created_at)
        .bind(doc.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                DocChatError::Conflict(format!("document {} already exists", doc.id))
            } else {
                storage(e)
            }
        })?;
        Ok(())
    }

    async fn update_document(&self, doc: &Document) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE documents
            SET status = ?, chunk_count = ?, attempts = ?, last_error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(doc.status.as_str())
        .bind(doc.chunk_count as i64)
        .bind(doc.attempts as i64)
        .bind(&doc.last_error)
        .bind(doc.updated_at)
        .bind(&doc.id)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if result.rows_affected() == 0 {
            return Err(DocChatError::NotFound(format!("document {}", doc.id)));
        }
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE id = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn document_source(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT source FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        Ok(row.map(|r| r.get("source")))
    }

    async fn list_documents(&self, owner_id: &str) -> Result<Vec<Document>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE owner_id = ? ORDER BY created_at DESC, rowid DESC",
            DOCUMENT_COLUMNS
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(row_to_document).collect()
    }

    async fn documents_with_status(&self, status: DocumentStatus) -> Result<Vec<Document>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE status = ? ORDER BY created_at DESC, rowid DESC",
            DOCUMENT_COLUMNS
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(row_to_document).collect()
    }

    async fn delete_document(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        sqlx::query("DELETE FROM embeddings WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        tx.commit().await.map_err(storage)?;
        Ok(result.rows_affected() > 0)
    }

    async fn replace_chunks(
        &self,
        document_id: &str,
        chunks: &[Chunk],
        embeddings: &[Embedding],
    ) -> Result<()> {
        if chunks.len() != embeddings.len() {
            return Err(DocChatError::Validation(format!(
                "{} chunks but {} embeddings for document {}",
                chunks.len(),
                embeddings.len(),
                document_id
            )));
        }

        let mut tx = self.pool.begin().await.map_err(storage)?;

        sqlx::query("DELETE FROM embeddings WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

        for (chunk, embedding) in chunks.iter().zip(embeddings) {
            if chunk.id != embedding.chunk_id || chunk.document_id != document_id {
                return Err(DocChatError::Validation(format!(
                    "embedding {} does not belong to chunk {} of document {}",
                    embedding.chunk_id, chunk.id, document_id
                )));
            }

            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, ordinal, text, start_offset, end_offset,
                                    overlap, hash)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.ordinal as i64)
            .bind(&chunk.text)
            .bind(chunk.start as i64)
            .bind(chunk.end as i64)
            .bind(chunk.overlap as i64)
            .bind(&chunk.hash)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

            sqlx::query(
                "INSERT INTO embeddings (chunk_id, document_id, model, dims, vector) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&embedding.chunk_id)
            .bind(document_id)
            .bind(&embedding.model)
            .bind(embedding.dims as i64)
            .bind(vec_to_blob(&embedding.vector))
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }

        tx.commit().await.map_err(storage)?;
        Ok(())
    }

    async fn clear_chunks(&self, document_id: &str) -> Result<()> {
        self.replace_chunks(document_id, &[], &[]).await
    }

    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let row = sqlx::query("SELECT * FROM chunks WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage)?;
            if let Some(row) = row {
                out.push(row_to_chunk(&row));
            }
        }
        Ok(out)
    }

    async fn load_embeddings(&self, document_id: &str) -> Result<Vec<(Chunk, Embedding)>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.document_id, c.ordinal, c.text, c.start_offset, c.end_offset,
                   c.overlap, c.hash, e.model, e.dims, e.vector
            FROM chunks c
            JOIN embeddings e ON e.chunk_id = c.id
            WHERE c.document_id = ?
            ORDER BY c.ordinal
            "#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        Ok(rows
            .iter()
            .map(|row| {
                let chunk = row_to_chunk(row);
                let blob: Vec<u8> = row.get("vector");
                let embedding = Embedding {
                    chunk_id: chunk.id.clone(),
                    vector: blob_to_vec(&blob),
                    model: row.get("model"),
                    dims: row.get::<i64, _>("dims") as usize,
                };
                (chunk, embedding)
            })
            .collect())
    }

    async fn create_account(&self, account: &QuotaAccount) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO quota_accounts (user_id, allocated, consumed, version, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO NOTHING
            "#,
        )
        .bind(&account.user_id)
        .bind(account.allocated)
        .bind(account.consumed)
        .bind(account.version as i64)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_account(&self, user_id: &str) -> Result<Option<QuotaAccount>> {
        let row = sqlx::query("SELECT * FROM quota_accounts WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        Ok(row.as_ref().map(row_to_account))
    }

    async fn get_reservation(&self, id: &str) -> Result<Option<Reservation>> {
        let row = sqlx::query("SELECT * FROM reservations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.as_ref().map(row_to_reservation).transpose()
    }

    async fn list_reservations(&self, user_id: &str) -> Result<Vec<Reservation>> {
        let rows = sqlx::query(
            "SELECT * FROM reservations WHERE user_id = ? ORDER BY created_at, id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(row_to_reservation).collect()
    }

    async fn commit_quota(&self, commit: &QuotaCommit) -> Result<bool> {
        let account = &commit.account;
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let updated = sqlx::query(
            r#"
            UPDATE quota_accounts
            SET allocated = ?, consumed = ?, version = ?, updated_at = ?
            WHERE user_id = ? AND version = ?
            "#,
        )
        .bind(account.allocated)
        .bind(account.consumed)
        .bind(account.version as i64)
        .bind(account.updated_at)
        .bind(&account.user_id)
        .bind(commit.expected_version as i64)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        if updated.rows_affected() == 0 {
            let exists: bool =
                sqlx::query_scalar("SELECT COUNT(*) > 0 FROM quota_accounts WHERE user_id = ?")
                    .bind(&account.user_id)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(storage)?;
            if !exists {
                return Err(DocChatError::NotFound(format!(
                    "quota account {}",
                    account.user_id
                )));
            }
            return Ok(false);
        }

        match &commit.reservation {
            ReservationChange::None => {}
            ReservationChange::Create(r) => {
                sqlx::query(
                    r#"
                    INSERT INTO reservations (id, user_id, estimated, state, actual, session_id,
                                              created_at, settled_at)
                    VALUES (?, ?, ?, 'outstanding', NULL, ?, ?, NULL)
                    "#,
                )
                .bind(&r.id)
                .bind(&r.user_id)
                .bind(r.estimated)
                .bind(&r.session_id)
                .bind(r.created_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        DocChatError::Conflict(format!("reservation {} already exists", r.id))
                    } else {
                        storage(e)
                    }
                })?;
            }
            ReservationChange::Settle { id, to } => {
                let actual = match to {
                    ReservationState::Reconciled { actual } => Some(*actual),
                    _ => None,
                };
                let settled = sqlx::query(
                    r#"
                    UPDATE reservations SET state = ?, actual = ?, settled_at = ?
                    WHERE id = ? AND state = 'outstanding'
                    "#,
                )
                .bind(to.as_str())
                .bind(actual)
                .bind(account.updated_at)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
                if settled.rows_affected() == 0 {
                    return Ok(false);
                }
            }
        }

        if let Some(entry) = &commit.usage {
            sqlx::query(
                r#"
                INSERT INTO usage_log (user_id, tokens, operation, session_id, reservation_id,
                                       detail, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&entry.user_id)
            .bind(entry.tokens)
            .bind(entry.operation.as_str())
            .bind(&entry.session_id)
            .bind(&entry.reservation_id)
            .bind(&entry.detail)
            .bind(entry.created_at)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }

        tx.commit().await.map_err(storage)?;
        Ok(true)
    }

    async fn usage_log(&self, user_id: &str, limit: usize) -> Result<Vec<UsageEntry>> {
        let rows = sqlx::query("SELECT * FROM usage_log WHERE user_id = ? ORDER BY id DESC LIMIT ?")
            .bind(user_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.iter().map(row_to_usage).collect()
    }

    async fn insert_session(&self, session: &ChatSession) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chat_sessions (id, owner_id, title, system_prompt, archived,
                                       created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.owner_id)
        .bind(&session.title)
        .bind(&session.system_prompt)
        .bind(session.archived as i64)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                DocChatError::Conflict(format!("session {} already exists", session.id))
            } else {
                storage(e)
            }
        })?;
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<ChatSession>> {
        let row = sqlx::query("SELECT * FROM chat_sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        Ok(row.as_ref().map(row_to_session))
    }

    async fn list_sessions(&self, owner_id: &str) -> Result<Vec<ChatSession>> {
        let rows = sqlx::query(
            "SELECT * FROM chat_sessions WHERE owner_id = ? ORDER BY updated_at DESC, created_at DESC, id",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        Ok(rows.iter().map(row_to_session).collect())
    }

    async fn append_turns(&self, turns: &[Turn]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let now = docchat_core::models::now_ts();

        for turn in turns {
            let touched = sqlx::query("UPDATE chat_sessions SET updated_at = ? WHERE id = ?")
                .bind(now)
                .bind(&turn.session_id)
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
            if touched.rows_affected() == 0 {
                return Err(DocChatError::NotFound(format!("session {}", turn.session_id)));
            }

            let ids = serde_json::to_string(&turn.context_chunk_ids)
                .map_err(|e| DocChatError::Storage(e.to_string()))?;
            sqlx::query(
                r#"
                INSERT INTO turns (session_id, seq, role, text, context_chunk_ids,
                                   tokens_billed, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&turn.session_id)
            .bind(turn.seq as i64)
            .bind(turn.role.as_str())
            .bind(&turn.text)
            .bind(ids)
            .bind(turn.tokens_billed)
            .bind(turn.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DocChatError::Conflict(format!(
                        "turn {} already committed in session {}",
                        turn.seq, turn.session_id
                    ))
                } else {
                    storage(e)
                }
            })?;
        }

        tx.commit().await.map_err(storage)?;
        Ok(())
    }

    async fn list_turns(&self, session_id: &str, limit: usize, skip: usize) -> Result<Vec<Turn>> {
        let rows = sqlx::query(
            "SELECT * FROM turns WHERE session_id = ? ORDER BY seq LIMIT ? OFFSET ?",
        )
        .bind(session_id)
        .bind(limit.min(i64::MAX as usize) as i64)
        .bind(skip.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(row_to_turn).collect()
    }

    async fn next_turn_seq(&self, session_id: &str) -> Result<u64> {
        let next: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(seq) + 1, 0) FROM turns WHERE session_id = ?")
                .bind(session_id)
                .fetch_one(&self.pool)
                .await
                .map_err(storage)?;
        Ok(next as u64)
    }
}

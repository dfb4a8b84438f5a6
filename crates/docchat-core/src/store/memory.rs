//! In-memory [`Store`] implementation for tests and embedding in other
//! processes.
//!
//! All state lives behind one `std::sync::RwLock`, which makes every
//! operation (including the multi-record ones) trivially atomic. Guards are
//! never held across an `.await`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::error::{DocChatError, Result};
use crate::models::{
    now_ts, ChatSession, Chunk, Document, DocumentStatus, Embedding, QuotaAccount, Reservation,
    ReservationState, Turn, UsageEntry,
};
use crate::quota::{QuotaCommit, ReservationChange};

use super::Store;

struct StoredDoc {
    doc: Document,
    source: Vec<u8>,
    inserted: u64,
}

#[derive(Default)]
struct Inner {
    docs: HashMap<String, StoredDoc>,
    inserted: u64,
    chunks: HashMap<String, Vec<(Chunk, Embedding)>>,
    accounts: HashMap<String, QuotaAccount>,
    reservations: HashMap<String, Reservation>,
    usage: Vec<UsageEntry>,
    sessions: HashMap<String, ChatSession>,
    turns: HashMap<String, BTreeMap<u64, Turn>>,
}

/// In-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| DocChatError::Storage("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| DocChatError::Storage("memory store lock poisoned".to_string()))
    }
}

fn newest_first(docs: &mut [&StoredDoc]) {
    docs.sort_by(|a, b| {
        b.doc
            .created_at
            .cmp(&a.doc.created_at)
            .then(b.inserted.cmp(&a.inserted))
    });
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_document(&self, doc: &Document, source: &[u8]) -> Result<()> {
        let mut inner = self.write()?;
        if inner.docs.contains_key(&doc.id) {
            return Err(DocChatError::Conflict(format!(
                "document {} already exists",
                doc.id
            )));
        }
        inner.inserted += 1;
        let inserted = inner.inserted;
        inner.docs.insert(
            doc.id.clone(),
            StoredDoc {
                doc: doc.clone(),
                source: source.to_vec(),
                inserted,
            },
        );
        Ok(())
    }

    async fn update_document(&self, doc: &Document) -> Result<()> {
        let mut inner = self.write()?;
        match inner.docs.get_mut(&doc.id) {
            Some(stored) => {
                stored.doc = doc.clone();
                Ok(())
            }
            None => Err(DocChatError::NotFound(format!("document {}", doc.id))),
        }
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.read()?.docs.get(id).map(|s| s.doc.clone()))
    }

    async fn document_source(&self, id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.read()?.docs.get(id).map(|s| s.source.clone()))
    }

    async fn list_documents(&self, owner_id: &str) -> Result<Vec<Document>> {
        let inner = self.read()?;
        let mut docs: Vec<&StoredDoc> = inner
            .docs
            .values()
            .filter(|s| s.doc.owner_id == owner_id)
            .collect();
        newest_first(&mut docs);
        Ok(docs.into_iter().map(|s| s.doc.clone()).collect())
    }

    async fn documents_with_status(&self, status: DocumentStatus) -> Result<Vec<Document>> {
        let inner = self.read()?;
        let mut docs: Vec<&StoredDoc> = inner
            .docs
            .values()
            .filter(|s| s.doc.status == status)
            .collect();
        newest_first(&mut docs);
        Ok(docs.into_iter().map(|s| s.doc.clone()).collect())
    }

    async fn delete_document(&self, id: &str) -> Result<bool> {
        let mut inner = self.write()?;
        inner.chunks.remove(id);
        Ok(inner.docs.remove(id).is_some())
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
        let mut pairs = Vec::with_capacity(chunks.len());
        for (c, e) in chunks.iter().zip(embeddings) {
            if c.id != e.chunk_id || c.document_id != document_id {
                return Err(DocChatError::Validation(format!(
                    "embedding {} does not belong to chunk {} of document {}",
                    e.chunk_id, c.id, document_id
                )));
            }
            pairs.push((c.clone(), e.clone()));
        }
        pairs.sort_by_key(|(c, _)| c.ordinal);

        let mut inner = self.write()?;
        if !inner.docs.contains_key(document_id) {
            return Err(DocChatError::NotFound(format!("document {}", document_id)));
        }
        inner.chunks.insert(document_id.to_string(), pairs);
        Ok(())
    }

    async fn clear_chunks(&self, document_id: &str) -> Result<()> {
        self.write()?.chunks.remove(document_id);
        Ok(())
    }

    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        let inner = self.read()?;
        let mut by_id: HashMap<&str, &Chunk> = HashMap::new();
        for pairs in inner.chunks.values() {
            for (c, _) in pairs {
                by_id.insert(c.id.as_str(), c);
            }
        }
        Ok(ids
            .iter()
            .filter_map(|id| by_id.get(id.as_str()).map(|c| (*c).clone()))
            .collect())
    }

    async fn load_embeddings(&self, document_id: &str) -> Result<Vec<(Chunk, Embedding)>> {
        Ok(self
            .read()?
            .chunks
            .get(document_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_account(&self, account: &QuotaAccount) -> Result<bool> {
        let mut inner = self.write()?;
        if inner.accounts.contains_key(&account.user_id) {
            return Ok(false);
        }
        inner
            .accounts
            .insert(account.user_id.clone(), account.clone());
        Ok(true)
    }

    async fn get_account(&self, user_id: &str) -> Result<Option<QuotaAccount>> {
        Ok(self.read()?.accounts.get(user_id).cloned())
    }

    async fn get_reservation(&self, id: &str) -> Result<Option<Reservation>> {
        Ok(self.read()?.reservations.get(id).cloned())
    }

    async fn list_reservations(&self, user_id: &str) -> Result<Vec<Reservation>> {
        let inner = self.read()?;
        let mut out: Vec<Reservation> = inner
            .reservations
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn commit_quota(&self, commit: &QuotaCommit) -> Result<bool> {
        let mut inner = self.write()?;
        let user_id = &commit.account.user_id;
        let current = inner
            .accounts
            .get(user_id)
            .ok_or_else(|| DocChatError::NotFound(format!("quota account {}", user_id)))?;
        if current.version != commit.expected_version {
            return Ok(false);
        }

        match &commit.reservation {
            ReservationChange::None => {}
            ReservationChange::Create(r) => {
                if inner.reservations.contains_key(&r.id) {
                    return Err(DocChatError::Conflict(format!(
                        "reservation {} already exists",
                        r.id
                    )));
                }
            }
            ReservationChange::Settle { id, .. } => {
                let r = inner
                    .reservations
                    .get(id)
                    .ok_or_else(|| DocChatError::NotFound(format!("reservation {}", id)))?;
                if r.state != ReservationState::Outstanding {
                    return Ok(false);
                }
            }
        }

        inner
            .accounts
            .insert(user_id.clone(), commit.account.clone());
        match &commit.reservation {
            ReservationChange::None => {}
            ReservationChange::Create(r) => {
                inner.reservations.insert(r.id.clone(), r.clone());
            }
            ReservationChange::Settle { id, to } => {
                if let Some(r) = inner.reservations.get_mut(id) {
                    r.state = *to;
                    r.settled_at = Some(now_ts());
                }
            }
        }
        if let Some(entry) = &commit.usage {
            inner.usage.push(entry.clone());
        }
        Ok(true)
    }

    async fn usage_log(&self, user_id: &str, limit: usize) -> Result<Vec<UsageEntry>> {
        let inner = self.read()?;
        Ok(inner
            .usage
            .iter()
            .rev()
            .filter(|u| u.user_id == user_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn insert_session(&self, session: &ChatSession) -> Result<()> {
        let mut inner = self.write()?;
        if inner.sessions.contains_key(&session.id) {
            return Err(DocChatError::Conflict(format!(
                "session {} already exists",
                session.id
            )));
        }
        inner.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<ChatSession>> {
        Ok(self.read()?.sessions.get(id).cloned())
    }

    async fn list_sessions(&self, owner_id: &str) -> Result<Vec<ChatSession>> {
        let inner = self.read()?;
        let mut out: Vec<ChatSession> = inner
            .sessions
            .values()
            .filter(|s| s.owner_id == owner_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then(b.created_at.cmp(&a.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(out)
    }

    async fn append_turns(&self, turns: &[Turn]) -> Result<()> {
        let mut inner = self.write()?;
        for t in turns {
            if !inner.sessions.contains_key(&t.session_id) {
                return Err(DocChatError::NotFound(format!("session {}", t.session_id)));
            }
            let exists = inner
                .turns
                .get(&t.session_id)
                .is_some_and(|m| m.contains_key(&t.seq));
            if exists {
                return Err(DocChatError::Conflict(format!(
                    "turn {} already committed in session {}",
                    t.seq, t.session_id
                )));
            }
        }

        let now = now_ts();
        for t in turns {
            inner
                .turns
                .entry(t.session_id.clone())
                .or_default()
                .insert(t.seq, t.clone());
            if let Some(s) = inner.sessions.get_mut(&t.session_id) {
                s.updated_at = now;
            }
        }
        Ok(())
    }

    async fn list_turns(&self, session_id: &str, limit: usize, skip: usize) -> Result<Vec<Turn>> {
        let inner = self.read()?;
        Ok(inner
            .turns
            .get(session_id)
            .map(|m| m.values().skip(skip).take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn next_turn_seq(&self, session_id: &str) -> Result<u64> {
        let inner = self.read()?;
        Ok(inner
            .turns
            .get(session_id)
            .and_then(|m| m.keys().next_back())
            .map(|s| s + 1)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentFormat, Role, UsageOperation};

    fn doc(owner: &str, name: &str) -> Document {
        Document::new(owner, name, DocumentFormat::Text, 3)
    }

    fn chunk(doc_id: &str, ordinal: usize) -> (Chunk, Embedding) {
        let c = Chunk {
            id: format!("{}-{}", doc_id, ordinal),
            document_id: doc_id.to_string(),
            ordinal,
            text: format!("chunk {}", ordinal),
            start: 0,
            end: 0,
            overlap: 0,
            hash: String::new(),
        };
        let e = Embedding {
            chunk_id: c.id.clone(),
            vector: vec![1.0, 0.0],
            model: "m".into(),
            dims: 2,
        };
        (c, e)
    }

    #[tokio::test]
    async fn test_document_lifecycle() {
        let store = InMemoryStore::new();
        let d1 = doc("alice", "a.txt");
        let d2 = doc("alice", "b.txt");
        store.insert_document(&d1, b"abc").await.unwrap();
        store.insert_document(&d2, b"def").await.unwrap();
        store.insert_document(&doc("bob", "c.txt"), b"ghi").await.unwrap();

        let listed = store.list_documents("alice").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, d2.id);
        assert_eq!(store.document_source(&d1.id).await.unwrap().unwrap(), b"abc");

        let (c1, e1) = chunk(&d1.id, 1);
        let (c0, e0) = chunk(&d1.id, 0);
        store
            .replace_chunks(&d1.id, &[c1, c0], &[e1, e0])
            .await
            .unwrap();
        let loaded = store.load_embeddings(&d1.id).await.unwrap();
        assert_eq!(loaded[0].0.ordinal, 0);

        assert!(store.delete_document(&d1.id).await.unwrap());
        assert!(!store.delete_document(&d1.id).await.unwrap());
        assert!(store.load_embeddings(&d1.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replace_chunks_rejects_mismatch() {
        let store = InMemoryStore::new();
        let d = doc("alice", "a.txt");
        store.insert_document(&d, b"abc").await.unwrap();
        let (c0, _) = chunk(&d.id, 0);
        let (_, e1) = chunk(&d.id, 1);
        assert!(store.replace_chunks(&d.id, &[c0], &[e1]).await.is_err());
        assert!(store.load_embeddings(&d.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_quota_checks_version_and_state() {
        let store = InMemoryStore::new();
        let account = QuotaAccount::new("u1", 1000);
        assert!(store.create_account(&account).await.unwrap());
        assert!(!store.create_account(&account).await.unwrap());

        let reservation = Reservation {
            id: "r1".into(),
            user_id: "u1".into(),
            estimated: 100,
            state: ReservationState::Outstanding,
            session_id: None,
            created_at: now_ts(),
            settled_at: None,
        };
        let reserved = account.try_reserve(100).unwrap();
        let commit = QuotaCommit {
            expected_version: 0,
            account: reserved.clone(),
            reservation: ReservationChange::Create(reservation),
            usage: None,
        };
        assert!(store.commit_quota(&commit).await.unwrap());
        // Same expected version again: stale.
        assert!(!store.commit_quota(&commit).await.unwrap());

        let settle = |expected_version, account: QuotaAccount| QuotaCommit {
            expected_version,
            account,
            reservation: ReservationChange::Settle {
                id: "r1".into(),
                to: ReservationState::Reconciled { actual: 40 },
            },
            usage: Some(UsageEntry {
                user_id: "u1".into(),
                tokens: 40,
                operation: UsageOperation::Chat,
                session_id: None,
                reservation_id: Some("r1".into()),
                detail: None,
                created_at: now_ts(),
            }),
        };
        let reconciled = reserved.apply_reconcile(100, 40);
        assert!(store.commit_quota(&settle(1, reconciled.clone())).await.unwrap());
        // Already settled, even with a fresh version.
        assert!(!store
            .commit_quota(&settle(2, reconciled.apply_reconcile(100, 40)))
            .await
            .unwrap());

        let stored = store.get_account("u1").await.unwrap().unwrap();
        assert_eq!(stored.consumed, 40);
        assert_eq!(store.usage_log("u1", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_turns_append_and_page() {
        let store = InMemoryStore::new();
        let session = ChatSession::new("alice", Some("t"), None);
        store.insert_session(&session).await.unwrap();
        let mk = |seq, role| Turn {
            session_id: session.id.clone(),
            seq,
            role,
            text: format!("turn {}", seq),
            context_chunk_ids: Vec::new(),
            tokens_billed: 0,
            created_at: now_ts(),
        };

        assert_eq!(store.next_turn_seq(&session.id).await.unwrap(), 0);
        store
            .append_turns(&[mk(0, Role::User), mk(1, Role::Assistant)])
            .await
            .unwrap();
        assert_eq!(store.next_turn_seq(&session.id).await.unwrap(), 2);

        let dup = store.append_turns(&[mk(2, Role::User), mk(1, Role::Assistant)]).await;
        assert!(matches!(dup, Err(DocChatError::Conflict(_))));
        assert_eq!(store.next_turn_seq(&session.id).await.unwrap(), 2);

        let page = store.list_turns(&session.id, 1, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].seq, 1);
    }
}

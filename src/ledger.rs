//! Per-user token quota with optimistic concurrency.
//!
//! Every mutation reads the account, computes the next state with the pure
//! rules in [`docchat_core::quota`], and submits a [`QuotaCommit`] that the
//! store applies only if the account version has not moved. A lost race
//! re-reads and tries again, up to `max_cas_attempts` times.
//!
//! Reservations carry their own state (`outstanding`, `reconciled`,
//! `released`), and settling one is part of the same commit, so a token can
//! be settled at most once no matter how many callers race on it.

use std::sync::Arc;
use std::time::Duration;

use docchat_core::models::{
    now_ts, QuotaAccount, Reservation, ReservationState, ReservationToken, UsageEntry,
    UsageOperation,
};
use docchat_core::quota::{expected_consumed, QuotaBalance, QuotaCommit, ReservationChange};
use docchat_core::store::Store;
use docchat_core::{DocChatError, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

pub struct QuotaLedger {
    store: Arc<dyn Store>,
    default_allocation: i64,
    max_cas_attempts: u32,
}

/// Result of [`QuotaLedger::audit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaAudit {
    pub user_id: String,
    pub consumed: i64,
    pub expected: i64,
    pub outstanding: usize,
}

impl QuotaAudit {
    pub fn is_consistent(&self) -> bool {
        self.consumed == self.expected
    }
}

enum Step {
    Commit(QuotaCommit),
    /// Nothing to write; finish with this value.
    Done(bool),
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn Store>, default_allocation: i64, max_cas_attempts: u32) -> Self {
        Self {
            store,
            default_allocation,
            max_cas_attempts: max_cas_attempts.max(1),
        }
    }

    async fn account(&self, user_id: &str) -> Result<QuotaAccount> {
        self.store
            .get_account(user_id)
            .await?
            .ok_or_else(|| DocChatError::NotFound(format!("quota account {}", user_id)))
    }

    /// Read the account, build a commit with `plan`, and apply it, retrying
    /// when another writer got there first.
    async fn cas<F>(&self, user_id: &str, mut plan: F) -> Result<bool>
    where
        F: FnMut(&QuotaAccount) -> Result<Step>,
    {
        for attempt in 1..=self.max_cas_attempts {
            let account = self.account(user_id).await?;
            let commit = match plan(&account)? {
                Step::Commit(c) => c,
                Step::Done(v) => return Ok(v),
            };
            if self.store.commit_quota(&commit).await? {
                return Ok(true);
            }
            debug!(user_id, attempt, "quota commit lost a race, retrying");
            tokio::task::yield_now().await;
        }
        warn!(user_id, attempts = self.max_cas_attempts, "quota update gave up");
        Err(DocChatError::Conflict(format!(
            "quota account {} is busy, try again",
            user_id
        )))
    }

    pub async fn reserve(&self, user_id: &str, estimated: i64) -> Result<ReservationToken> {
        self.reserve_with(user_id, estimated, None).await
    }

    /// Provisionally charge `estimated` tokens. Fails with
    /// [`DocChatError::QuotaExceeded`] when the charge does not fit.
    pub async fn reserve_with(
        &self,
        user_id: &str,
        estimated: i64,
        session_id: Option<&str>,
    ) -> Result<ReservationToken> {
        let reservation = Reservation {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            estimated,
            state: ReservationState::Outstanding,
            session_id: session_id.map(str::to_string),
            created_at: now_ts(),
            settled_at: None,
        };
        self.cas(user_id, |account| {
            Ok(Step::Commit(QuotaCommit {
                expected_version: account.version,
                account: account.try_reserve(estimated)?,
                reservation: ReservationChange::Create(reservation.clone()),
                usage: None,
            }))
        })
        .await?;
        debug!(user_id, estimated, reservation_id = %reservation.id, "tokens reserved");
        Ok(reservation.token())
    }

    /// Load the reservation behind `token`, or `None` if it is already settled.
    async fn outstanding(&self, token: &ReservationToken) -> Result<Option<Reservation>> {
        let reservation = self
            .store
            .get_reservation(&token.id)
            .await?
            .filter(|r| r.user_id == token.user_id)
            .ok_or_else(|| DocChatError::NotFound(format!("reservation {}", token.id)))?;
        Ok((!reservation.state.is_settled()).then_some(reservation))
    }

    /// Replace the reservation's estimate with `actual`. Returns `false` if
    /// the token was already settled, in which case nothing changes.
    pub async fn reconcile(&self, token: &ReservationToken, actual: i64) -> Result<bool> {
        if actual < 0 {
            return Err(DocChatError::Validation(format!(
                "actual cost must be >= 0, got {}",
                actual
            )));
        }
        let Some(reservation) = self.outstanding(token).await? else {
            return Ok(false);
        };
        let settled = self
            .settle(&reservation, ReservationState::Reconciled { actual }, |account| {
                account.apply_reconcile(reservation.estimated, actual)
            })
            .await?;
        if settled {
            debug!(user_id = %token.user_id, estimated = reservation.estimated, actual, "reservation reconciled");
        }
        Ok(settled)
    }

    /// Reverse an outstanding reservation. Returns `false` if it was
    /// already settled.
    pub async fn release(&self, token: &ReservationToken) -> Result<bool> {
        let Some(reservation) = self.outstanding(token).await? else {
            return Ok(false);
        };
        let settled = self
            .settle(&reservation, ReservationState::Released, |account| {
                account.apply_release(reservation.estimated)
            })
            .await?;
        if settled {
            debug!(user_id = %token.user_id, estimated = reservation.estimated, "reservation released");
        }
        Ok(settled)
    }

    /// [`release`](Self::release) that keeps going while the account is
    /// contended, backing off between rounds, for callers that would
    /// otherwise strand the reservation's tokens.
    pub async fn release_until_settled(&self, token: &ReservationToken) -> Result<bool> {
        let mut round: u32 = 0;
        loop {
            match self.release(token).await {
                Err(DocChatError::Conflict(_)) => {
                    round += 1;
                    debug!(reservation_id = %token.id, round, "release contended, backing off");
                    tokio::time::sleep(Duration::from_millis(5u64 << round.min(7))).await;
                }
                other => return other,
            }
        }
    }

    async fn settle<F>(&self, reservation: &Reservation, to: ReservationState, apply: F) -> Result<bool>
    where
        F: Fn(&QuotaAccount) -> QuotaAccount,
    {
        let usage = match to {
            ReservationState::Reconciled { actual } => Some(UsageEntry {
                user_id: reservation.user_id.clone(),
                tokens: actual,
                operation: UsageOperation::Chat,
                session_id: reservation.session_id.clone(),
                reservation_id: Some(reservation.id.clone()),
                detail: None,
                created_at: now_ts(),
            }),
            _ => None,
        };

        for attempt in 1..=self.max_cas_attempts {
            let account = self.account(&reservation.user_id).await?;
            let commit = QuotaCommit {
                expected_version: account.version,
                account: apply(&account),
                reservation: ReservationChange::Settle {
                    id: reservation.id.clone(),
                    to,
                },
                usage: usage.clone(),
            };
            if self.store.commit_quota(&commit).await? {
                return Ok(true);
            }
            // Either the version moved or someone else settled the token.
            if self.outstanding(&reservation.token()).await?.is_none() {
                return Ok(false);
            }
            debug!(user_id = %reservation.user_id, attempt, "settle lost a race, retrying");
            tokio::task::yield_now().await;
        }
        Err(DocChatError::Conflict(format!(
            "quota account {} is busy, try again",
            reservation.user_id
        )))
    }

    pub async fn balance(&self, user_id: &str) -> Result<QuotaBalance> {
        Ok(QuotaBalance::from(&self.account(user_id).await?))
    }

    /// Create an account unless one exists. `None` uses the configured
    /// default allocation. Returns whether an account was created.
    pub async fn open_account(&self, user_id: &str, allocated: Option<i64>) -> Result<bool> {
        if user_id.trim().is_empty() {
            return Err(DocChatError::Validation("user id must not be empty".to_string()));
        }
        let allocated = allocated.unwrap_or(self.default_allocation);
        if allocated < 0 {
            return Err(DocChatError::Validation(format!(
                "allocation must be >= 0, got {}",
                allocated
            )));
        }
        let created = self
            .store
            .create_account(&QuotaAccount::new(user_id, allocated))
            .await?;
        if created {
            info!(user_id, allocated, "quota account opened");
        }
        Ok(created)
    }

    /// Admin change to a user's allocation. This is the only way an
    /// allocation can shrink; it may not go below zero.
    pub async fn adjust_allocation(
        &self,
        user_id: &str,
        delta: i64,
        admin_id: &str,
        reason: Option<&str>,
    ) -> Result<QuotaBalance> {
        if admin_id.trim().is_empty() {
            return Err(DocChatError::Validation("admin id must not be empty".to_string()));
        }
        let detail = format!(
            "admin {}: {}",
            admin_id,
            reason.unwrap_or("Admin token adjustment")
        );
        self.cas(user_id, |account| {
            if delta == 0 {
                return Ok(Step::Done(false));
            }
            Ok(Step::Commit(QuotaCommit {
                expected_version: account.version,
                account: account.apply_adjustment(delta)?,
                reservation: ReservationChange::None,
                usage: Some(UsageEntry {
                    user_id: user_id.to_string(),
                    tokens: delta,
                    operation: UsageOperation::AdminAdjustment,
                    session_id: None,
                    reservation_id: None,
                    detail: Some(detail.clone()),
                    created_at: now_ts(),
                }),
            }))
        })
        .await?;
        info!(user_id, delta, admin_id, "allocation adjusted");
        self.balance(user_id).await
    }

    pub async fn usage(&self, user_id: &str, limit: usize) -> Result<Vec<UsageEntry>> {
        self.store.usage_log(user_id, limit).await
    }

    /// Compare `consumed` with what the user's reservations add up to.
    pub async fn audit(&self, user_id: &str) -> Result<QuotaAudit> {
        let account = self.account(user_id).await?;
        let reservations = self.store.list_reservations(user_id).await?;
        Ok(QuotaAudit {
            user_id: user_id.to_string(),
            consumed: account.consumed,
            expected: expected_consumed(&reservations),
            outstanding: reservations
                .iter()
                .filter(|r| r.state == ReservationState::Outstanding)
                .count(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use docchat_core::models::{ChatSession, Chunk, Document, DocumentStatus, Embedding, Turn};
    use docchat_core::store::memory::InMemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn ledger(allocated: i64) -> QuotaLedger {
        let ledger = QuotaLedger::new(Arc::new(InMemoryStore::new()), 100, 16);
        ledger.open_account("u1", Some(allocated)).await.unwrap();
        ledger
    }

    #[tokio::test]
    async fn test_reserve_reconcile_release() {
        let ledger = ledger(1000).await;
        let a = ledger.reserve("u1", 300).await.unwrap();
        let b = ledger.reserve("u1", 200).await.unwrap();
        assert_eq!(ledger.balance("u1").await.unwrap().consumed, 500);

        assert!(ledger.reconcile(&a, 120).await.unwrap());
        assert!(ledger.release(&b).await.unwrap());
        let balance = ledger.balance("u1").await.unwrap();
        assert_eq!(balance.consumed, 120);
        assert_eq!(balance.remaining, 880);

        let audit = ledger.audit("u1").await.unwrap();
        assert!(audit.is_consistent());
        assert_eq!(audit.outstanding, 0);
    }

    #[tokio::test]
    async fn test_settle_is_idempotent() {
        let ledger = ledger(1000).await;
        let token = ledger.reserve("u1", 300).await.unwrap();
        assert!(ledger.reconcile(&token, 250).await.unwrap());
        assert!(!ledger.reconcile(&token, 250).await.unwrap());
        assert!(!ledger.release(&token).await.unwrap());
        assert_eq!(ledger.balance("u1").await.unwrap().consumed, 250);
        assert_eq!(ledger.usage("u1", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_quota_exceeded_leaves_account_untouched() {
        let ledger = ledger(1000).await;
        let t = ledger.reserve("u1", 950).await.unwrap();
        ledger.reconcile(&t, 950).await.unwrap();
        let err = ledger.reserve("u1", 100).await.unwrap_err();
        assert!(matches!(
            err,
            DocChatError::QuotaExceeded { remaining: 50, .. }
        ));
        assert_eq!(ledger.balance("u1").await.unwrap().consumed, 950);
    }

    #[tokio::test]
    async fn test_token_from_another_user_is_not_found() {
        let ledger = ledger(1000).await;
        let mut token = ledger.reserve("u1", 10).await.unwrap();
        token.user_id = "intruder".to_string();
        assert!(matches!(
            ledger.release(&token).await,
            Err(DocChatError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_adjust_allocation() {
        let ledger = ledger(100).await;
        let b = ledger
            .adjust_allocation("u1", 400, "admin", Some("top-up"))
            .await
            .unwrap();
        assert_eq!(b.allocated, 500);
        assert!(matches!(
            ledger.adjust_allocation("u1", -501, "admin", None).await,
            Err(DocChatError::Validation(_))
        ));
        let log = ledger.usage("u1", 10).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].operation, UsageOperation::AdminAdjustment);
        assert_eq!(log[0].detail.as_deref(), Some("admin admin: top-up"));
    }

    #[tokio::test]
    async fn test_open_account_is_idempotent_and_missing_is_not_found() {
        let ledger = ledger(100).await;
        assert!(!ledger.open_account("u1", Some(5)).await.unwrap());
        assert_eq!(ledger.balance("u1").await.unwrap().allocated, 100);
        assert!(ledger.open_account("u2", None).await.unwrap());
        assert_eq!(ledger.balance("u2").await.unwrap().allocated, 100);
        assert!(matches!(
            ledger.reserve("nobody", 1).await,
            Err(DocChatError::NotFound(_))
        ));
    }

    /// In-memory store whose next `lost` quota commits lose the race.
    #[derive(Default)]
    struct Contended {
        inner: InMemoryStore,
        lost: AtomicU32,
    }

    #[async_trait]
    impl Store for Contended {
        async fn insert_document(&self, doc: &Document, source: &[u8]) -> Result<()> {
            self.inner.insert_document(doc, source).await
        }
        async fn update_document(&self, doc: &Document) -> Result<()> {
            self.inner.update_document(doc).await
        }
        async fn get_document(&self, id: &str) -> Result<Option<Document>> {
            self.inner.get_document(id).await
        }
        async fn document_source(&self, id: &str) -> Result<Option<Vec<u8>>> {
            self.inner.document_source(id).await
        }
        async fn list_documents(&self, owner_id: &str) -> Result<Vec<Document>> {
            self.inner.list_documents(owner_id).await
        }
        async fn documents_with_status(&self, status: DocumentStatus) -> Result<Vec<Document>> {
            self.inner.documents_with_status(status).await
        }
        async fn delete_document(&self, id: &str) -> Result<bool> {
            self.inner.delete_document(id).await
        }
        async fn replace_chunks(
            &self,
            document_id: &str,
            chunks: &[Chunk],
            embeddings: &[Embedding],
        ) -> Result<()> {
            self.inner.replace_chunks(document_id, chunks, embeddings).await
        }
        async fn clear_chunks(&self, document_id: &str) -> Result<()> {
            self.inner.clear_chunks(document_id).await
        }
        async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>> {
            self.inner.get_chunks(ids).await
        }
        async fn load_embeddings(&self, document_id: &str) -> Result<Vec<(Chunk, Embedding)>> {
            self.inner.load_embeddings(document_id).await
        }
        async fn create_account(&self, account: &QuotaAccount) -> Result<bool> {
            self.inner.create_account(account).await
        }
        async fn get_account(&self, user_id: &str) -> Result<Option<QuotaAccount>> {
            self.inner.get_account(user_id).await
        }
        async fn get_reservation(&self, id: &str) -> Result<Option<Reservation>> {
            self.inner.get_reservation(id).await
        }
        async fn list_reservations(&self, user_id: &str) -> Result<Vec<Reservation>> {
            self.inner.list_reservations(user_id).await
        }
        async fn commit_quota(&self, commit: &QuotaCommit) -> Result<bool> {
            let lost = self
                .lost
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if lost {
                return Ok(false);
            }
            self.inner.commit_quota(commit).await
        }
        async fn usage_log(&self, user_id: &str, limit: usize) -> Result<Vec<UsageEntry>> {
            self.inner.usage_log(user_id, limit).await
        }
        async fn insert_session(&self, session: &ChatSession) -> Result<()> {
            self.inner.insert_session(session).await
        }
        async fn get_session(&self, id: &str) -> Result<Option<ChatSession>> {
            self.inner.get_session(id).await
        }
        async fn list_sessions(&self, owner_id: &str) -> Result<Vec<ChatSession>> {
            self.inner.list_sessions(owner_id).await
        }
        async fn append_turns(&self, turns: &[Turn]) -> Result<()> {
            self.inner.append_turns(turns).await
        }
        async fn list_turns(&self, session_id: &str, limit: usize, skip: usize) -> Result<Vec<Turn>> {
            self.inner.list_turns(session_id, limit, skip).await
        }
        async fn next_turn_seq(&self, session_id: &str) -> Result<u64> {
            self.inner.next_turn_seq(session_id).await
        }
    }

    #[tokio::test]
    async fn test_release_outlasts_contention() {
        let store = Arc::new(Contended::default());
        let ledger = QuotaLedger::new(store.clone(), 1000, 1);
        ledger.open_account("u1", None).await.unwrap();
        let token = ledger.reserve("u1", 400).await.unwrap();

        store.lost.store(3, Ordering::SeqCst);
        assert!(matches!(
            ledger.release(&token).await,
            Err(DocChatError::Conflict(_))
        ));
        assert_eq!(ledger.balance("u1").await.unwrap().consumed, 400);

        assert!(ledger.release_until_settled(&token).await.unwrap());
        assert_eq!(store.lost.load(Ordering::SeqCst), 0);
        assert_eq!(ledger.balance("u1").await.unwrap().consumed, 0);
        assert!(!ledger.release_until_settled(&token).await.unwrap());
        assert!(ledger.audit("u1").await.unwrap().is_consistent());
    }
}

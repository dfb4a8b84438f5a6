//! Chat turns: reserve quota, retrieve context, generate, bill, persist.
//!
//! A turn moves through
//! `received → quota_reserved → context_retrieved → generated → billed → persisted`
//! and leaves early as `quota_denied` or `generation_failed`. Once tokens
//! are reserved, every exit before billing releases them: explicitly on
//! error, and through [`ReservationGuard`] when the turn's future is
//! dropped.
//!
//! Turns of one session commit in submission order. Each submission takes a
//! ticket from the session's [`SessionSequencer`] queue on arrival and waits
//! for it before writing, so generation runs concurrently but commits are
//! serialized per session.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use docchat_core::models::{now_ts, ChatSession, ReservationToken, Role, Turn};
use docchat_core::prompt::{assemble, ContextPassage, PromptInput, PromptPolicy};
use docchat_core::store::Store;
use docchat_core::{DocChatError, Result};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, info_span, warn, Instrument};

use crate::generation::Generator;
use crate::ledger::QuotaLedger;
use crate::retriever::Retriever;

/// Per-turn switches.
#[derive(Debug, Clone)]
pub struct TurnOptions {
    pub use_rag: bool,
    /// Overrides the session's and the configured system prompt.
    pub system_prompt: Option<String>,
    /// Passages to retrieve; the configured default when `None`.
    pub k: Option<usize>,
}

impl Default for TurnOptions {
    fn default() -> Self {
        Self {
            use_rag: true,
            system_prompt: None,
            k: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnReply {
    pub reply: String,
    pub tokens_billed: i64,
    pub context_chunk_ids: Vec<String>,
    /// Balance left after billing; negative when the turn overran.
    pub remaining: i64,
    /// The user and assistant turns as committed.
    pub turns: Vec<Turn>,
}

// ============ Reservation guard ============

/// Releases a reservation when dropped unless it was billed first.
struct ReservationGuard {
    ledger: Arc<QuotaLedger>,
    token: Option<ReservationToken>,
}

impl ReservationGuard {
    fn new(ledger: Arc<QuotaLedger>, token: ReservationToken) -> Self {
        Self {
            ledger,
            token: Some(token),
        }
    }

    fn token(&self) -> Option<&ReservationToken> {
        self.token.as_ref()
    }

    fn disarm(&mut self) {
        self.token = None;
    }

    async fn release(mut self) {
        if let Some(token) = self.token.take() {
            if let Err(e) = self.ledger.release_until_settled(&token).await {
                warn!(reservation_id = %token.id, error = %e, "failed to release reservation");
            }
        }
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let ledger = self.ledger.clone();
                handle.spawn(async move {
                    if let Err(e) = ledger.release_until_settled(&token).await {
                        warn!(reservation_id = %token.id, error = %e, "failed to release abandoned reservation");
                    }
                });
            }
            Err(_) => {
                warn!(reservation_id = %token.id, "no runtime to release abandoned reservation");
            }
        }
    }
}

// ============ Session sequencer ============

struct SessionQueue {
    /// Ticket allowed to commit next.
    head: watch::Sender<u64>,
    state: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    next_ticket: u64,
    /// Tickets finished ahead of the head.
    finished: BTreeSet<u64>,
}

type QueueMap = Arc<Mutex<HashMap<String, Arc<SessionQueue>>>>;

/// Hands out per-session commit tickets in arrival order. A session's queue
/// exists only while it has tickets outstanding.
#[derive(Default)]
pub struct SessionSequencer {
    queues: QueueMap,
}

/// A place in a session's commit order. Dropping it (committed or not)
/// lets the next ticket proceed.
pub struct CommitTicket {
    queues: QueueMap,
    session_id: String,
    queue: Arc<SessionQueue>,
    ticket: u64,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionSequencer {
    pub fn ticket(&self, session_id: &str) -> CommitTicket {
        // Lock order: map, then queue state.
        let mut queues = lock(&self.queues);
        let queue = queues
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(SessionQueue {
                    head: watch::Sender::new(0),
                    state: Mutex::new(QueueState::default()),
                })
            })
            .clone();
        let ticket = {
            let mut state = lock(&queue.state);
            let t = state.next_ticket;
            state.next_ticket += 1;
            t
        };
        drop(queues);
        CommitTicket {
            queues: self.queues.clone(),
            session_id: session_id.to_string(),
            queue,
            ticket,
        }
    }
}

impl CommitTicket {
    /// Wait until every earlier ticket of the session has finished.
    pub async fn wait_turn(&self) -> Result<()> {
        let mut rx = self.queue.head.subscribe();
        rx.wait_for(|head| *head == self.ticket)
            .await
            .map(|_| ())
            .map_err(|_| DocChatError::Conflict("session commit queue closed".to_string()))
    }
}

impl Drop for CommitTicket {
    fn drop(&mut self) {
        let mut queues = lock(&self.queues);
        let mut state = lock(&self.queue.state);
        state.finished.insert(self.ticket);
        let mut head = *self.queue.head.borrow();
        while state.finished.remove(&head) {
            head += 1;
        }
        self.queue.head.send_replace(head);
        if head == state.next_ticket
            && queues
                .get(&self.session_id)
                .is_some_and(|q| Arc::ptr_eq(q, &self.queue))
        {
            queues.remove(&self.session_id);
        }
    }
}

// ============ Orchestrator ============

pub struct ChatOrchestrator {
    store: Arc<dyn Store>,
    retriever: Arc<Retriever>,
    ledger: Arc<QuotaLedger>,
    generator: Arc<dyn Generator>,
    policy: PromptPolicy,
    system_prompt: String,
    default_k: usize,
    sequencer: SessionSequencer,
}

impl ChatOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        retriever: Arc<Retriever>,
        ledger: Arc<QuotaLedger>,
        generator: Arc<dyn Generator>,
        policy: PromptPolicy,
        system_prompt: String,
        default_k: usize,
    ) -> Self {
        Self {
            store,
            retriever,
            ledger,
            generator,
            policy,
            system_prompt,
            default_k,
            sequencer: SessionSequencer::default(),
        }
    }

    pub async fn create_session(
        &self,
        owner_id: &str,
        title: Option<&str>,
        system_prompt: Option<&str>,
    ) -> Result<ChatSession> {
        if owner_id.trim().is_empty() {
            return Err(DocChatError::Validation("owner id must not be empty".to_string()));
        }
        let session = ChatSession::new(owner_id, title, system_prompt);
        self.store.insert_session(&session).await?;
        info!(session_id = %session.id, user_id = owner_id, "session created");
        Ok(session)
    }

    pub async fn list_sessions(&self, owner_id: &str) -> Result<Vec<ChatSession>> {
        self.store.list_sessions(owner_id).await
    }

    /// A session visible to `owner_id`; anyone else's is reported missing.
    pub async fn session(&self, session_id: &str, owner_id: &str) -> Result<ChatSession> {
        self.store
            .get_session(session_id)
            .await?
            .filter(|s| s.owner_id == owner_id)
            .ok_or_else(|| DocChatError::NotFound(format!("session {}", session_id)))
    }

    pub async fn history(
        &self,
        session_id: &str,
        owner_id: &str,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<Turn>> {
        self.session(session_id, owner_id).await?;
        self.store.list_turns(session_id, limit, skip).await
    }

    /// Answer one user message and commit it with the reply.
    pub async fn submit_turn(
        &self,
        session_id: &str,
        owner_id: &str,
        text: &str,
        options: TurnOptions,
    ) -> Result<TurnReply> {
        let text = text.trim();
        if text.is_empty() {
            return Err(DocChatError::Validation("message must not be empty".to_string()));
        }
        let session = self.session(session_id, owner_id).await?;

        let span = info_span!("turn", session_id, user_id = owner_id);
        async move {
            let ticket = self.sequencer.ticket(session_id);
            info!(state = "received");

            let system_prompt = options
                .system_prompt
                .clone()
                .or_else(|| session.system_prompt.clone())
                .unwrap_or_else(|| self.system_prompt.clone());
            let estimate = self.policy.reservation_estimate(&system_prompt, text);

            let token = match self.ledger.reserve_with(owner_id, estimate, Some(session_id)).await {
                Ok(token) => token,
                Err(e) => {
                    if matches!(e, DocChatError::QuotaExceeded { .. }) {
                        info!(state = "quota_denied", estimate);
                    }
                    return Err(e);
                }
            };
            let mut guard = ReservationGuard::new(self.ledger.clone(), token);
            info!(state = "quota_reserved", estimate);

            let generated = self
                .generate(session_id, owner_id, text, &system_prompt, &options)
                .await;
            let (completion, context_chunk_ids) = match generated {
                Ok(g) => g,
                Err(e) => {
                    info!(state = "generation_failed", error = %e);
                    guard.release().await;
                    return Err(e);
                }
            };
            info!(state = "generated", tokens = completion.tokens);

            let billed = match guard.token() {
                Some(token) => self.ledger.reconcile(token, completion.tokens).await,
                None => Ok(false),
            };
            match billed {
                Ok(true) => guard.disarm(),
                Ok(false) => {
                    guard.disarm();
                    return Err(DocChatError::Conflict(
                        "reservation was settled before billing".to_string(),
                    ));
                }
                Err(e) => {
                    guard.release().await;
                    return Err(e);
                }
            }
            info!(state = "billed", tokens = completion.tokens);

            ticket.wait_turn().await?;
            let seq = self.store.next_turn_seq(session_id).await?;
            let now = now_ts();
            let turns = vec![
                Turn {
                    session_id: session_id.to_string(),
                    seq,
                    role: Role::User,
                    text: text.to_string(),
                    context_chunk_ids: Vec::new(),
                    tokens_billed: 0,
                    created_at: now,
                },
                Turn {
                    session_id: session_id.to_string(),
                    seq: seq + 1,
                    role: Role::Assistant,
                    text: completion.text.clone(),
                    context_chunk_ids: context_chunk_ids.clone(),
                    tokens_billed: completion.tokens,
                    created_at: now,
                },
            ];
            self.store.append_turns(&turns).await?;
            drop(ticket);
            info!(state = "persisted", seq);

            let remaining = self.ledger.balance(owner_id).await?.remaining;
            Ok(TurnReply {
                reply: completion.text,
                tokens_billed: completion.tokens,
                context_chunk_ids,
                remaining,
                turns,
            })
        }
        .instrument(span)
        .await
    }

    async fn generate(
        &self,
        session_id: &str,
        owner_id: &str,
        text: &str,
        system_prompt: &str,
        options: &TurnOptions,
    ) -> Result<(crate::generation::Completion, Vec<String>)> {
        let passages: Vec<ContextPassage> = if options.use_rag {
            let k = options.k.unwrap_or(self.default_k);
            self.retriever
                .retrieve(owner_id, text, k)
                .await?
                .into_iter()
                .map(|hit| ContextPassage {
                    chunk_id: hit.chunk_id,
                    source: hit.filename,
                    text: hit.text,
                    score: hit.score,
                })
                .collect()
        } else {
            Vec::new()
        };
        info!(state = "context_retrieved", passages = passages.len());

        let history = self.store.list_turns(session_id, usize::MAX, 0).await?;
        let prompt = assemble(
            &self.policy,
            &PromptInput {
                system_prompt,
                history: &history,
                passages: &passages,
                user_text: text,
                use_rag: options.use_rag,
            },
        );
        let completion = self
            .generator
            .complete(&prompt, self.policy.max_completion_tokens)
            .await?;
        Ok((completion, prompt.context_chunk_ids))
    }
}

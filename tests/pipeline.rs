//! End-to-end pipeline tests over the in-memory store with scripted
//! embedding and generation backends.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use docchat::app::App;
use docchat::chat::TurnOptions;
use docchat::config::Config;
use docchat::generation::{Completion, Generator};
use docchat_core::embedding::Embedder;
use docchat_core::models::{DocumentFormat, DocumentStatus, Role};
use docchat_core::prompt::{Prompt, NO_CONTEXT_NOTE};
use docchat_core::store::memory::InMemoryStore;
use docchat_core::store::Store;
use docchat_core::{DocChatError, Result};

const KEYWORDS: [&str; 3] = ["refund", "policy", "shipping"];

/// Counts each keyword, plus a constant component so no vector is zero.
struct KeywordEmbedder {
    fail: AtomicBool,
    delay_ms: AtomicU64,
}

impl KeywordEmbedder {
    fn new() -> Self {
        Self {
            fail: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
        }
    }

    fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0, 0.0, 0.0, 1.0];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .map(str::to_lowercase)
        {
            if let Some(i) = KEYWORDS.iter().position(|k| *k == word) {
                v[i] += 1.0;
            }
        }
        v
    }
}

#[async_trait]
impl Embedder for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keywords"
    }

    fn dims(&self) -> usize {
        4
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(DocChatError::EmbeddingService("503 Service Unavailable".into()));
        }
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

/// Replies "answer N" at a fixed cost. Messages containing "slow" take
/// longer, messages containing "hang" never finish in test time.
struct FakeGenerator {
    tokens: i64,
    calls: AtomicUsize,
    failure: Mutex<Option<DocChatError>>,
    prompts: Mutex<Vec<Prompt>>,
}

impl FakeGenerator {
    fn new(tokens: i64) -> Self {
        Self {
            tokens,
            calls: AtomicUsize::new(0),
            failure: Mutex::new(None),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn fail_with(&self, err: DocChatError) {
        *self.failure.lock().unwrap() = Some(err);
    }

    fn last_user_message(&self) -> String {
        let prompts = self.prompts.lock().unwrap();
        prompts
            .last()
            .and_then(|p| p.messages.last())
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Generator for FakeGenerator {
    async fn complete(&self, prompt: &Prompt, _max_tokens: i64) -> Result<Completion> {
        let last = prompt
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        if last.contains("hang") {
            tokio::time::sleep(Duration::from_secs(60)).await;
        } else if last.contains("slow") {
            tokio::time::sleep(Duration::from_millis(150)).await;
        }
        self.prompts.lock().unwrap().push(prompt.clone());
        if let Some(err) = self.failure.lock().unwrap().clone() {
            return Err(err);
        }
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Completion {
            text: format!("answer {}", n),
            tokens: self.tokens,
        })
    }
}

struct Harness {
    app: App,
    store: Arc<InMemoryStore>,
    embedder: Arc<KeywordEmbedder>,
    generator: Arc<FakeGenerator>,
}

fn harness() -> Harness {
    let config = Config::from_toml(
        r#"
[db]
path = "unused.sqlite"

[chunking]
target_size = 500
overlap = 50

[generation]
max_tokens = 100

[prompt]
system_prompt = "Be brief."
context_token_budget = 300
history_token_budget = 200

[quota]
default_allocation = 5000

[ingest]
max_attempts = 2
backoff_ms = 1
"#,
    )
    .unwrap();
    let store = Arc::new(InMemoryStore::new());
    let embedder = Arc::new(KeywordEmbedder::new());
    let generator = Arc::new(FakeGenerator::new(42));
    let app = App::build(config, store.clone(), embedder.clone(), generator.clone()).unwrap();
    Harness {
        app,
        store,
        embedder,
        generator,
    }
}

/// A 440-character paragraph starting with `lead` and padded with filler.
fn paragraph(lead: &str) -> String {
    let mut s = lead.to_string();
    while s.len() < 440 {
        s.push_str(" lorem");
    }
    s.truncate(440);
    s
}

fn policy_text() -> String {
    [
        paragraph("Welcome to the store."),
        paragraph("Our refund policy explains returns."),
        paragraph("A refund covers shipping costs."),
        paragraph("This policy governs shipping times."),
    ]
    .join("\n\n")
}

async fn ready_policy(h: &Harness, owner: &str) -> String {
    let doc = h
        .app
        .documents
        .ingest(policy_text().into_bytes(), DocumentFormat::Text, "policy.txt", owner)
        .await
        .unwrap();
    assert_eq!(doc.status, DocumentStatus::Ready);
    doc.id
}

#[tokio::test]
async fn test_scenario_a_quota_denied_persists_nothing() {
    let h = harness();
    h.app.ledger.open_account("u1", Some(1000)).await.unwrap();
    let t = h.app.ledger.reserve("u1", 950).await.unwrap();
    h.app.ledger.reconcile(&t, 950).await.unwrap();
    let session = h.app.chat.create_session("u1", None, None).await.unwrap();

    assert!(matches!(
        h.app.ledger.reserve("u1", 100).await,
        Err(DocChatError::QuotaExceeded { .. })
    ));
    let err = h
        .app
        .chat
        .submit_turn(&session.id, "u1", "hello", TurnOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DocChatError::QuotaExceeded { .. }));

    assert!(h.store.list_turns(&session.id, 10, 0).await.unwrap().is_empty());
    assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.app.ledger.balance("u1").await.unwrap().consumed, 950);
}

#[tokio::test]
async fn test_scenario_b_ranked_retrieval() {
    let h = harness();
    let doc_id = ready_policy(&h, "u1").await;
    assert_eq!(h.app.documents.status(&doc_id).await.unwrap().chunk_count, 4);

    let hits = h.app.retriever.retrieve("u1", "refund policy", 3).await.unwrap();
    let ordinals: Vec<usize> = hits.iter().map(|h| h.ordinal).collect();
    assert_eq!(ordinals, vec![1, 2, 3]);
    assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    // Chunks 2 and 3 tie; the lower ordinal wins.
    assert_eq!(hits[1].score, hits[2].score);
    assert!(hits.iter().all(|h| h.filename == "policy.txt"));
}

#[tokio::test]
async fn test_scenario_c_concurrent_reservations() {
    let h = harness();
    h.app.ledger.open_account("u1", Some(1000)).await.unwrap();
    let (a, b) = tokio::join!(h.app.ledger.reserve("u1", 600), h.app.ledger.reserve("u1", 600));
    assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
    let failed = if a.is_err() { a } else { b };
    assert!(matches!(failed, Err(DocChatError::QuotaExceeded { .. })));
    assert_eq!(h.app.ledger.balance("u1").await.unwrap().consumed, 600);
}

#[tokio::test]
async fn test_scenario_d_failed_embedding_then_retry() {
    let h = harness();
    h.embedder.fail.store(true, Ordering::SeqCst);
    let doc = h
        .app
        .documents
        .ingest(policy_text().into_bytes(), DocumentFormat::Text, "policy.txt", "u1")
        .await
        .unwrap();
    assert_eq!(doc.status, DocumentStatus::Failed);
    assert!(doc.last_error.as_deref().unwrap().contains("embedding"));
    assert!(h.store.load_embeddings(&doc.id).await.unwrap().is_empty());
    assert!(h.app.retriever.retrieve("u1", "refund", 3).await.unwrap().is_empty());

    h.embedder.fail.store(false, Ordering::SeqCst);
    let retried = h.app.documents.retry(&doc.id).await.unwrap();
    assert_eq!(retried.status, DocumentStatus::Ready);
    assert_eq!(retried.attempts, 2);
    assert_eq!(retried.last_error, None);
    assert_eq!(h.app.retriever.retrieve("u1", "refund", 3).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_concurrent_retry_of_same_document_conflicts() {
    let h = harness();
    h.embedder.fail.store(true, Ordering::SeqCst);
    let doc = h
        .app
        .documents
        .ingest(b"refund policy".to_vec(), DocumentFormat::Text, "p.txt", "u1")
        .await
        .unwrap();
    h.embedder.fail.store(false, Ordering::SeqCst);
    h.embedder.delay_ms.store(100, Ordering::SeqCst);

    let (a, b) = tokio::join!(h.app.documents.retry(&doc.id), h.app.documents.retry(&doc.id));
    assert_eq!(a.unwrap().status, DocumentStatus::Ready);
    assert!(matches!(b, Err(DocChatError::Conflict(_))));
}

#[tokio::test]
async fn test_rag_turn_bills_actual_cost_and_records_context() {
    let h = harness();
    ready_policy(&h, "u1").await;
    h.app.ledger.open_account("u1", None).await.unwrap();
    let session = h.app.chat.create_session("u1", Some("Policies"), None).await.unwrap();

    let reply = h
        .app
        .chat
        .submit_turn(&session.id, "u1", "What is the refund policy?", TurnOptions::default())
        .await
        .unwrap();
    assert_eq!(reply.reply, "answer 0");
    assert_eq!(reply.tokens_billed, 42);
    assert_eq!(reply.remaining, 5000 - 42);
    assert!(!reply.context_chunk_ids.is_empty());

    let turns = h.app.chat.history(&session.id, "u1", 10, 0).await.unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!((turns[0].seq, turns[0].role), (0, Role::User));
    assert_eq!(turns[0].tokens_billed, 0);
    assert_eq!((turns[1].seq, turns[1].role), (1, Role::Assistant));
    assert_eq!(turns[1].context_chunk_ids, reply.context_chunk_ids);
    assert_eq!(turns[1].tokens_billed, 42);

    let user_message = h.generator.last_user_message();
    assert!(user_message.starts_with("Context: From policy.txt:"));
    assert!(user_message.ends_with("Question: What is the refund policy?"));

    let audit = h.app.ledger.audit("u1").await.unwrap();
    assert!(audit.is_consistent());
    assert_eq!(audit.outstanding, 0);
}

#[tokio::test]
async fn test_rag_without_documents_notes_missing_context() {
    let h = harness();
    h.app.ledger.open_account("u1", None).await.unwrap();
    let session = h.app.chat.create_session("u1", None, None).await.unwrap();
    let reply = h
        .app
        .chat
        .submit_turn(&session.id, "u1", "anything?", TurnOptions::default())
        .await
        .unwrap();
    assert!(reply.context_chunk_ids.is_empty());
    assert!(h.generator.last_user_message().contains(NO_CONTEXT_NOTE));

    let plain = TurnOptions {
        use_rag: false,
        ..TurnOptions::default()
    };
    h.app
        .chat
        .submit_turn(&session.id, "u1", "no context please", plain)
        .await
        .unwrap();
    assert_eq!(h.generator.last_user_message(), "no context please");
}

#[tokio::test]
async fn test_generation_failure_releases_reservation() {
    let h = harness();
    h.app.ledger.open_account("u1", None).await.unwrap();
    let session = h.app.chat.create_session("u1", None, None).await.unwrap();
    h.generator
        .fail_with(DocChatError::ServiceUnavailable("upstream 503".into()));

    let err = h
        .app
        .chat
        .submit_turn(&session.id, "u1", "hello", TurnOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    let balance = h.app.ledger.balance("u1").await.unwrap();
    assert_eq!(balance.consumed, 0);
    assert!(h.store.list_turns(&session.id, 10, 0).await.unwrap().is_empty());
    let audit = h.app.ledger.audit("u1").await.unwrap();
    assert!(audit.is_consistent());
    assert_eq!(audit.outstanding, 0);
}

#[tokio::test]
async fn test_cancelled_turn_releases_reservation() {
    let h = harness();
    h.app.ledger.open_account("u1", None).await.unwrap();
    let session = h.app.chat.create_session("u1", None, None).await.unwrap();

    let chat = h.app.chat.clone();
    let session_id = session.id.clone();
    let task = tokio::spawn(async move {
        chat.submit_turn(&session_id, "u1", "hang around", TurnOptions::default())
            .await
    });

    let mut reserved = false;
    for _ in 0..100 {
        if h.app.ledger.balance("u1").await.unwrap().consumed > 0 {
            reserved = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(reserved, "turn never reserved quota");
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    let mut released = false;
    for _ in 0..100 {
        if h.app.ledger.balance("u1").await.unwrap().consumed == 0 {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(released, "abandoned reservation was not released");
    assert!(h.app.ledger.audit("u1").await.unwrap().is_consistent());
}

#[tokio::test]
async fn test_turns_commit_in_submission_order() {
    let h = harness();
    h.app.ledger.open_account("u1", None).await.unwrap();
    let session = h.app.chat.create_session("u1", None, None).await.unwrap();

    let no_rag = || TurnOptions {
        use_rag: false,
        ..TurnOptions::default()
    };
    let (first, second) = tokio::join!(
        h.app.chat.submit_turn(&session.id, "u1", "first and slow", no_rag()),
        h.app.chat.submit_turn(&session.id, "u1", "second and quick", no_rag()),
    );
    first.unwrap();
    second.unwrap();

    let turns = h.app.chat.history(&session.id, "u1", 10, 0).await.unwrap();
    let texts: Vec<&str> = turns.iter().map(|t| t.text.as_str()).collect();
    assert_eq!(texts[0], "first and slow");
    assert_eq!(texts[2], "second and quick");
    assert_eq!(
        turns.iter().map(|t| t.seq).collect::<Vec<_>>(),
        vec![0, 1, 2, 3]
    );
    assert_eq!(h.app.ledger.balance("u1").await.unwrap().consumed, 84);
}

#[tokio::test]
async fn test_sessions_are_private() {
    let h = harness();
    h.app.ledger.open_account("u2", None).await.unwrap();
    let session = h.app.chat.create_session("u1", None, None).await.unwrap();
    assert!(matches!(
        h.app
            .chat
            .submit_turn(&session.id, "u2", "hi", TurnOptions::default())
            .await,
        Err(DocChatError::NotFound(_))
    ));
    assert!(matches!(
        h.app.chat.history(&session.id, "u2", 10, 0).await,
        Err(DocChatError::NotFound(_))
    ));
    assert!(matches!(
        h.app
            .chat
            .submit_turn(&session.id, "u1", "   ", TurnOptions::default())
            .await,
        Err(DocChatError::Validation(_))
    ));
    assert_eq!(h.app.ledger.balance("u2").await.unwrap().consumed, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ledger_linearizable_under_contention() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let ledger = Arc::new(docchat::ledger::QuotaLedger::new(store, 0, 1000));
    ledger.open_account("u1", Some(1000)).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..20 {
        let ledger = ledger.clone();
        tasks.push(tokio::spawn(async move { ledger.reserve("u1", 100).await }));
    }
    let mut tokens = Vec::new();
    for task in tasks {
        if let Ok(token) = task.await.unwrap() {
            tokens.push(token);
        }
    }
    assert_eq!(tokens.len(), 10);
    assert_eq!(ledger.balance("u1").await.unwrap().consumed, 1000);

    let mut settles = Vec::new();
    for (i, token) in tokens.into_iter().enumerate() {
        let ledger = ledger.clone();
        settles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                ledger.reconcile(&token, 30).await
            } else {
                ledger.release(&token).await
            }
        }));
    }
    for s in settles {
        assert!(s.await.unwrap().unwrap());
    }
    let audit = ledger.audit("u1").await.unwrap();
    assert!(audit.is_consistent());
    assert_eq!(audit.consumed, 5 * 30);
}

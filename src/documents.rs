//! Document ingestion and per-document vector indexes.
//!
//! [`DocumentStore`] drives each upload through
//! `uploaded → chunking → embedding → ready`, falling to `failed` when
//! extraction, embedding, or index construction fails. A failed document
//! keeps its source bytes so [`DocumentStore::retry`] can re-run the
//! pipeline without a new upload.
//!
//! Each pipeline run executes on its own task that owns the document's
//! in-flight claim. A caller that stops waiting (a dropped request, a
//! timeout) does not stop the run; it still ends in `ready` or `failed`.
//!
//! Indexes are built privately and only installed once every chunk vector
//! has been accepted, so a half-built index is never visible to queries.
//! Only one pipeline run (or delete) per document may be in flight; a second
//! one is rejected with [`DocChatError::Conflict`].

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use docchat_core::chunk::{chunk_text, ChunkParams};
use docchat_core::embedding::{embed_texts, Embedder};
use docchat_core::index::{IndexSpec, VectorIndex};
use docchat_core::models::{Document, DocumentFormat, DocumentStatus, Embedding};
use docchat_core::store::Store;
use docchat_core::{DocChatError, Result};
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::IngestConfig;
use crate::extract::extract_text;

pub struct DocumentStore {
    pipeline: Arc<Pipeline>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

/// State shared between the store and its background pipeline runs.
struct Pipeline {
    store: Arc<dyn Store>,
    embedder: Arc<dyn Embedder>,
    chunking: ChunkParams,
    ingest: IngestConfig,
    indexes: RwLock<HashMap<String, Arc<VectorIndex>>>,
}

/// Marks a document as being processed until dropped.
struct InFlight {
    set: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        lock(&self.set).remove(&self.id);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DocumentStore {
    pub fn new(
        store: Arc<dyn Store>,
        embedder: Arc<dyn Embedder>,
        chunking: ChunkParams,
        ingest: IngestConfig,
    ) -> Result<Self> {
        chunking.validate()?;
        Ok(Self {
            pipeline: Arc::new(Pipeline {
                store,
                embedder,
                chunking,
                ingest,
                indexes: RwLock::new(HashMap::new()),
            }),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    fn claim(&self, document_id: &str) -> Result<InFlight> {
        let mut set = lock(&self.in_flight);
        if !set.insert(document_id.to_string()) {
            return Err(DocChatError::Conflict(format!(
                "document {} is already being processed",
                document_id
            )));
        }
        Ok(InFlight {
            set: self.in_flight.clone(),
            id: document_id.to_string(),
        })
    }

    /// Run `work` on its own task, holding `claim` until it finishes, and
    /// wait for the result.
    async fn detach<F>(&self, claim: InFlight, work: F) -> Result<Document>
    where
        F: Future<Output = Result<Document>> + Send + 'static,
    {
        tokio::spawn(async move {
            let _claim = claim;
            work.await
        })
        .await
        .map_err(|e| DocChatError::Storage(format!("document pipeline task failed: {}", e)))?
    }

    /// Record a new upload and run the pipeline to completion.
    ///
    /// Oversized, empty, or ownerless uploads are rejected before anything
    /// is stored. Otherwise the returned document is either `ready` or
    /// `failed` (with `last_error` set).
    pub async fn ingest(
        &self,
        bytes: Vec<u8>,
        format: DocumentFormat,
        filename: &str,
        owner_id: &str,
    ) -> Result<Document> {
        if owner_id.trim().is_empty() {
            return Err(DocChatError::Validation("owner id must not be empty".to_string()));
        }
        if bytes.is_empty() {
            return Err(DocChatError::Validation(format!("{} is empty", filename)));
        }
        if bytes.len() as u64 > self.pipeline.ingest.max_upload_bytes {
            return Err(DocChatError::Validation(format!(
                "{} is {} bytes, limit is {}",
                filename,
                bytes.len(),
                self.pipeline.ingest.max_upload_bytes
            )));
        }

        let doc = Document::new(owner_id, filename, format, bytes.len() as u64);
        let claim = self.claim(&doc.id)?;
        let pipeline = self.pipeline.clone();
        let span = info_span!("ingest", document_id = %doc.id, user_id = %doc.owner_id);
        let work = async move {
            pipeline.store.insert_document(&doc, &bytes).await?;
            info!(filename = %doc.filename, format = %format, size = bytes.len(), "document uploaded");
            pipeline.run(doc, bytes).await
        };
        self.detach(claim, work.instrument(span)).await
    }

    pub async fn status(&self, document_id: &str) -> Result<Document> {
        self.pipeline
            .store
            .get_document(document_id)
            .await?
            .ok_or_else(|| DocChatError::NotFound(format!("document {}", document_id)))
    }

    /// Re-run the pipeline for a `failed` document from its stored source.
    pub async fn retry(&self, document_id: &str) -> Result<Document> {
        let claim = self.claim(document_id)?;
        let doc = self.status(document_id).await?;
        if doc.status != DocumentStatus::Failed {
            return Err(DocChatError::Validation(format!(
                "document {} is {}; only failed documents can be retried",
                document_id, doc.status
            )));
        }
        let source = self
            .pipeline
            .store
            .document_source(document_id)
            .await?
            .ok_or_else(|| DocChatError::NotFound(format!("source of document {}", document_id)))?;

        let pipeline = self.pipeline.clone();
        let span = info_span!("ingest", document_id = %doc.id, user_id = %doc.owner_id);
        let work = async move {
            info!(attempt = doc.attempts + 1, "retrying document");
            pipeline.run(doc, source).await
        };
        self.detach(claim, work.instrument(span)).await
    }

    /// Remove a document with its chunks, embeddings, and index.
    pub async fn delete(&self, document_id: &str, owner_id: &str) -> Result<()> {
        let _claim = self.claim(document_id)?;
        let doc = self.status(document_id).await?;
        if doc.owner_id != owner_id {
            return Err(DocChatError::NotFound(format!("document {}", document_id)));
        }
        self.pipeline.store.delete_document(document_id).await?;
        self.pipeline.remove_index(document_id);
        info!(document_id, user_id = owner_id, "document deleted");
        Ok(())
    }

    pub async fn list(&self, owner_id: &str) -> Result<Vec<Document>> {
        self.pipeline.store.list_documents(owner_id).await
    }

    /// Rebuild the in-memory index of every `ready` document from stored
    /// embeddings. Returns the number of indexes installed.
    ///
    /// Documents in other states are left alone: another process sharing
    /// the database may be running their pipelines.
    pub async fn load_indexes(&self) -> Result<usize> {
        let mut loaded = 0;
        for doc in self
            .pipeline
            .store
            .documents_with_status(DocumentStatus::Ready)
            .await?
        {
            let pairs = self.pipeline.store.load_embeddings(&doc.id).await?;
            let mut index = VectorIndex::new(&doc.id, self.pipeline.index_spec());
            let built = pairs.into_iter().try_for_each(|(chunk, embedding)| {
                index.insert(&chunk.id, chunk.ordinal, embedding.vector, &embedding.model)
            });
            match built {
                Ok(()) => {
                    self.pipeline.install_index(index);
                    loaded += 1;
                }
                Err(e) => {
                    error!(document_id = %doc.id, error = %e, "stored embeddings do not match the embedder; re-ingest the document");
                }
            }
        }
        info!(loaded, "vector indexes loaded");
        Ok(loaded)
    }

    /// Fail every document left in `chunking` or `embedding` by a process
    /// that stopped mid-pipeline, so it can be retried. Only the process
    /// that owns ingestion for the database (the server) calls this, once,
    /// before accepting work. Returns the number of documents failed.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let mut recovered = 0;
        for status in [DocumentStatus::Chunking, DocumentStatus::Embedding] {
            for mut doc in self.pipeline.store.documents_with_status(status).await? {
                let Ok(_claim) = self.claim(&doc.id) else {
                    continue;
                };
                warn!(document_id = %doc.id, status = %doc.status, "pipeline was interrupted");
                doc.last_error = Some("processing interrupted by shutdown".to_string());
                doc.advance(DocumentStatus::Failed)?;
                self.pipeline.store.clear_chunks(&doc.id).await?;
                self.pipeline.store.update_document(&doc).await?;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    pub fn index_for(&self, document_id: &str) -> Option<Arc<VectorIndex>> {
        self.pipeline
            .indexes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(document_id)
            .cloned()
    }
}

impl Pipeline {
    fn install_index(&self, index: VectorIndex) {
        self.indexes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(index.document_id().to_string(), Arc::new(index));
    }

    fn remove_index(&self, document_id: &str) {
        self.indexes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(document_id);
    }

    fn index_spec(&self) -> IndexSpec {
        IndexSpec {
            model: self.embedder.model_name().to_string(),
            dims: self.embedder.dims(),
            metric: self.embedder.metric(),
        }
    }

    async fn run(&self, mut doc: Document, source: Vec<u8>) -> Result<Document> {
        doc.attempts += 1;
        doc.last_error = None;
        doc.chunk_count = 0;
        doc.advance(DocumentStatus::Chunking)?;
        self.store.update_document(&doc).await?;

        match self.build(&mut doc, source).await {
            Ok(()) => {
                info!(chunks = doc.chunk_count, "document ready");
                Ok(doc)
            }
            Err(e) => self.fail(doc, e).await,
        }
    }

    async fn build(&self, doc: &mut Document, source: Vec<u8>) -> Result<()> {
        let format = doc.format;
        let params = self.chunking;
        let document_id = doc.id.clone();
        let chunks = tokio::task::spawn_blocking(move || {
            let text = extract_text(&source, format)?;
            if text.trim().is_empty() {
                return Err(DocChatError::Validation(format!(
                    "no text could be extracted from the {} source",
                    format
                )));
            }
            chunk_text(&document_id, &text, &params)
        })
        .await
        .map_err(|e| DocChatError::Validation(format!("text extraction aborted: {}", e)))??;

        doc.advance(DocumentStatus::Embedding)?;
        self.store.update_document(doc).await?;
        info!(chunks = chunks.len(), "embedding chunks");

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embed_with_retry(&texts).await?;

        let spec = self.index_spec();
        let mut index = VectorIndex::new(&doc.id, spec.clone());
        let mut embeddings = Vec::with_capacity(chunks.len());
        for (chunk, vector) in chunks.iter().zip(vectors) {
            index.insert(&chunk.id, chunk.ordinal, vector.clone(), &spec.model)?;
            embeddings.push(Embedding {
                chunk_id: chunk.id.clone(),
                vector,
                model: spec.model.clone(),
                dims: spec.dims,
            });
        }
        self.store.replace_chunks(&doc.id, &chunks, &embeddings).await?;

        let mut ready = doc.clone();
        ready.chunk_count = chunks.len();
        ready.advance(DocumentStatus::Ready)?;
        self.install_index(index);
        self.store.update_document(&ready).await?;
        *doc = ready;
        Ok(())
    }

    async fn embed_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match embed_texts(self.embedder.as_ref(), texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) if e.is_retryable() && attempt < self.ingest.max_attempts => {
                    let delay = self
                        .ingest
                        .backoff_ms
                        .saturating_mul(1u64 << (attempt - 1).min(16));
                    warn!(attempt, error = %e, delay_ms = delay, "embedding failed, retrying");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fail(&self, mut doc: Document, cause: DocChatError) -> Result<Document> {
        if matches!(cause, DocChatError::IndexCorruption(_)) {
            error!(error = %cause, "index corruption, document failed");
        } else {
            warn!(error = %cause, "document failed");
        }
        self.remove_index(&doc.id);
        self.store.clear_chunks(&doc.id).await?;
        doc.chunk_count = 0;
        doc.last_error = Some(cause.to_string());
        doc.advance(DocumentStatus::Failed)?;
        self.store.update_document(&doc).await?;
        Ok(doc)
    }
}

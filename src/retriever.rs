//! Cross-document semantic retrieval.
//!
//! The query is embedded once, each of the caller's `ready` documents is
//! queried for its own top `k`, and the per-document lists are merged with
//! [`merge_top_k`]. Chunk text is fetched from the store only for the final
//! hits.

use std::collections::HashMap;
use std::sync::Arc;

use docchat_core::embedding::{embed_query, Embedder};
use docchat_core::models::DocumentStatus;
use docchat_core::retrieve::merge_top_k;
use docchat_core::store::Store;
use docchat_core::{DocChatError, Result};
use serde::Serialize;
use tracing::{debug, error};

use crate::documents::DocumentStore;

/// One retrieved passage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub filename: String,
    pub ordinal: usize,
    pub text: String,
    pub score: f32,
}

pub struct Retriever {
    store: Arc<dyn Store>,
    embedder: Arc<dyn Embedder>,
    documents: Arc<DocumentStore>,
}

impl Retriever {
    pub fn new(store: Arc<dyn Store>, embedder: Arc<dyn Embedder>, documents: Arc<DocumentStore>) -> Self {
        Self {
            store,
            embedder,
            documents,
        }
    }

    /// Top `k` passages from `user_id`'s ready documents, best first.
    ///
    /// Documents in any other state are skipped. With no ready documents the
    /// query is not embedded at all and the result is empty.
    pub async fn retrieve(&self, user_id: &str, query: &str, k: usize) -> Result<Vec<RetrievedChunk>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let ready: Vec<_> = self
            .store
            .list_documents(user_id)
            .await?
            .into_iter()
            .filter(|d| d.status == DocumentStatus::Ready)
            .collect();
        if ready.is_empty() {
            return Ok(Vec::new());
        }

        let vector = embed_query(self.embedder.as_ref(), query).await?;

        let mut lists = Vec::with_capacity(ready.len());
        for doc in &ready {
            let Some(index) = self.documents.index_for(&doc.id) else {
                debug!(document_id = %doc.id, "ready document has no loaded index");
                continue;
            };
            match index.query(&vector, k) {
                Ok(hits) => lists.push(hits),
                Err(e @ DocChatError::IndexCorruption(_)) => {
                    error!(document_id = %doc.id, error = %e, "skipping corrupt index");
                }
                Err(e) => return Err(e),
            }
        }

        let hits = merge_top_k(lists, k);
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = hits.iter().map(|h| h.chunk_id.clone()).collect();
        let mut texts: HashMap<String, String> = self
            .store
            .get_chunks(&ids)
            .await?
            .into_iter()
            .map(|c| (c.id, c.text))
            .collect();
        let filenames: HashMap<&str, &str> = ready
            .iter()
            .map(|d| (d.id.as_str(), d.filename.as_str()))
            .collect();

        let results = hits
            .into_iter()
            .filter_map(|hit| {
                let text = texts.remove(&hit.chunk_id)?;
                let filename = filenames.get(hit.document_id.as_str())?.to_string();
                Some(RetrievedChunk {
                    chunk_id: hit.chunk_id,
                    document_id: hit.document_id,
                    filename,
                    ordinal: hit.ordinal,
                    text,
                    score: hit.score,
                })
            })
            .collect::<Vec<_>>();
        debug!(user_id, hits = results.len(), "retrieval complete");
        Ok(results)
    }
}

//! Per-document vector index.
//!
//! A [`VectorIndex`] holds every `(chunk_id, vector)` pair of one document
//! and answers exact nearest-neighbor queries with a bounded heap scan.
//! Every vector in an index shares one embedding model, one dimensionality,
//! and one [`SimilarityMetric`]; anything else is rejected as
//! [`DocChatError::IndexCorruption`].
//!
//! Indexes are append-only. Deleting or re-ingesting a document discards the
//! index and builds a new one.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use serde::Serialize;

use crate::embedding::{cosine_from_parts, dot, l2_norm, SimilarityMetric};
use crate::error::{DocChatError, Result};

/// Model, dimensionality, and metric fixed at index construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub model: String,
    pub dims: usize,
    pub metric: SimilarityMetric,
}

/// One query hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub ordinal: usize,
    pub score: f32,
}

/// Total ranking order: score descending, then ordinal, chunk id, and
/// document id ascending. `Ordering::Less` means `a` ranks first.
pub fn rank_cmp(a: &ScoredChunk, b: &ScoredChunk) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.ordinal.cmp(&b.ordinal))
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        .then_with(|| a.document_id.cmp(&b.document_id))
}

/// Heap entry whose `Ord` puts the worst-ranked hit at the top of a
/// max-heap, so the heap can be trimmed to `k` by popping.
struct Worst(ScoredChunk);

impl PartialEq for Worst {
    fn eq(&self, other: &Self) -> bool {
        rank_cmp(&self.0, &other.0) == Ordering::Equal
    }
}

impl Eq for Worst {}

impl PartialOrd for Worst {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Worst {
    fn cmp(&self, other: &Self) -> Ordering {
        rank_cmp(&self.0, &other.0)
    }
}

struct Entry {
    chunk_id: String,
    ordinal: usize,
    vector: Vec<f32>,
    norm: f32,
}

pub struct VectorIndex {
    document_id: String,
    spec: IndexSpec,
    entries: Vec<Entry>,
}

impl VectorIndex {
    pub fn new(document_id: &str, spec: IndexSpec) -> Self {
        Self {
            document_id: document_id.to_string(),
            spec,
            entries: Vec::new(),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn spec(&self) -> &IndexSpec {
        &self.spec
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add one chunk vector. `model` must match the index's model and the
    /// vector must have the index's dimensionality.
    pub fn insert(&mut self, chunk_id: &str, ordinal: usize, vector: Vec<f32>, model: &str) -> Result<()> {
        if model != self.spec.model {
            return Err(DocChatError::IndexCorruption(format!(
                "document {}: chunk {} embedded with model '{}', index uses '{}'",
                self.document_id, chunk_id, model, self.spec.model
            )));
        }
        if vector.len() != self.spec.dims {
            return Err(DocChatError::IndexCorruption(format!(
                "document {}: chunk {} has {} dims, index expects {}",
                self.document_id,
                chunk_id,
                vector.len(),
                self.spec.dims
            )));
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(DocChatError::IndexCorruption(format!(
                "document {}: chunk {} has non-finite values",
                self.document_id, chunk_id
            )));
        }
        let norm = l2_norm(&vector);
        self.entries.push(Entry {
            chunk_id: chunk_id.to_string(),
            ordinal,
            vector,
            norm,
        });
        Ok(())
    }

    /// Return at most `k` hits ordered by [`rank_cmp`].
    pub fn query(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredChunk>> {
        if k == 0 || self.entries.is_empty() {
            return Ok(Vec::new());
        }
        if vector.len() != self.spec.dims {
            return Err(DocChatError::IndexCorruption(format!(
                "document {}: query has {} dims, index expects {}",
                self.document_id,
                vector.len(),
                self.spec.dims
            )));
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(DocChatError::Validation(
                "query vector has non-finite values".to_string(),
            ));
        }

        let query_norm = l2_norm(vector);
        let mut heap: BinaryHeap<Worst> = BinaryHeap::with_capacity(k.min(self.entries.len()) + 1);

        for entry in &self.entries {
            let raw = dot(vector, &entry.vector);
            let score = match self.spec.metric {
                SimilarityMetric::InnerProduct => raw,
                SimilarityMetric::Cosine => cosine_from_parts(raw, query_norm, entry.norm),
            };
            // Finite inputs can still overflow to infinity or NaN.
            if !score.is_finite() {
                continue;
            }
            heap.push(Worst(ScoredChunk {
                chunk_id: entry.chunk_id.clone(),
                document_id: self.document_id.clone(),
                ordinal: entry.ordinal,
                score,
            }));
            if heap.len() > k {
                heap.pop();
            }
        }

        // Ascending by Worst's order == best first.
        Ok(heap.into_sorted_vec().into_iter().map(|w| w.0).collect())
    }
}

//! Embedding trait, batching, and vector utilities.
//!
//! Defines the [`Embedder`] trait that all embedding backends implement,
//! the batched [`embed_texts`] driver that enforces all-or-nothing batches,
//! and pure helpers for vector serialization and similarity.
//!
//! Network-backed providers (OpenAI, Ollama, fastembed) live in the `docchat`
//! application crate. [`HashEmbedder`] is here because it needs no I/O.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{DocChatError, Result};

/// Similarity function used by a [`VectorIndex`](crate::index::VectorIndex).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMetric {
    Cosine,
    InnerProduct,
}

/// Whether an embedder's output vectors are already unit length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    Raw,
    UnitLength,
}

/// An embedding backend.
///
/// Implementations return one raw vector per input text, in input order.
/// `embed_batch` is called with at most [`batch_size`](Embedder::batch_size)
/// texts at a time by [`embed_texts`].
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Vector dimensionality.
    fn dims(&self) -> usize;

    fn normalization(&self) -> Normalization {
        Normalization::Raw
    }

    /// Metric an index must use for this embedder's vectors. Unit-length
    /// vectors make inner product equal to cosine, so it is preferred.
    fn metric(&self) -> SimilarityMetric {
        match self.normalization() {
            Normalization::UnitLength => SimilarityMetric::InnerProduct,
            Normalization::Raw => SimilarityMetric::Cosine,
        }
    }

    fn batch_size(&self) -> usize {
        64
    }

    /// Embed one batch. Any failure fails the entire batch.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed `texts` in batches, returning one vector per text in order.
///
/// If any batch fails, or returns the wrong number of vectors or a vector of
/// the wrong dimensionality, the whole call fails with
/// [`DocChatError::EmbeddingService`] and no vectors are returned. A batch
/// the backend refused stays [`DocChatError::EmbeddingRejected`] so callers
/// do not retry it.
pub async fn embed_texts(embedder: &dyn Embedder, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let batch_size = embedder.batch_size().max(1);
    let dims = embedder.dims();
    let mut out = Vec::with_capacity(texts.len());

    for batch in texts.chunks(batch_size) {
        let vectors = embedder.embed_batch(batch).await.map_err(|e| match e {
            DocChatError::EmbeddingService(_) | DocChatError::EmbeddingRejected(_) => e,
            DocChatError::ServiceUnavailable(msg) => DocChatError::EmbeddingService(msg),
            other => DocChatError::EmbeddingRejected(other.to_string()),
        })?;
        if vectors.len() != batch.len() {
            return Err(DocChatError::EmbeddingService(format!(
                "{} returned {} vectors for a batch of {}",
                embedder.model_name(),
                vectors.len(),
                batch.len()
            )));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
            return Err(DocChatError::EmbeddingService(format!(
                "{} returned a {}-dimensional vector, expected {}",
                embedder.model_name(),
                bad.len(),
                dims
            )));
        }
        if vectors.iter().flatten().any(|x| !x.is_finite()) {
            return Err(DocChatError::EmbeddingService(format!(
                "{} returned a vector with non-finite values",
                embedder.model_name()
            )));
        }
        out.extend(vectors);
    }

    Ok(out)
}

/// Embed a single query string.
pub async fn embed_query(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
    let mut vectors = embed_texts(embedder, &[text.to_string()]).await?;
    vectors
        .pop()
        .ok_or_else(|| DocChatError::EmbeddingService("empty embedding response".to_string()))
}

/// Deterministic offline embedder based on feature hashing.
///
/// Each lowercase alphanumeric token is hashed with SHA-256 into one of
/// `dims` buckets with a ±1 sign; the result is L2-normalized. Texts that
/// share words get similar vectors, which is enough for demos, tests, and
/// air-gapped installs without an embedding service.
pub struct HashEmbedder {
    dims: usize,
    model: String,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            model: format!("hash-{}", dims),
        }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        if self.dims == 0 {
            return v;
        }
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        l2_normalize(&mut v);
        v
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn normalization(&self) -> Normalization {
        Normalization::UnitLength
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// ```rust
/// use docchat_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB produced by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Scale `v` to unit length in place. Zero vectors are left unchanged.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = l2_norm(v);
    if norm >= f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cosine similarity from a dot product and the two vectors' L2 norms.
/// Returns `0.0` when either vector is zero.
pub fn cosine_from_parts(raw_dot: f32, norm_a: f32, norm_b: f32) -> f32 {
    let denom = norm_a * norm_b;
    if denom < f32::EPSILON {
        return 0.0;
    }
    raw_dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyEmbedder {
        calls: AtomicUsize,
        fail_on_call: usize,
        short_batch: bool,
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        fn model_name(&self) -> &str {
            "flaky"
        }
        fn dims(&self) -> usize {
            2
        }
        fn batch_size(&self) -> usize {
            2
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == self.fail_on_call {
                return Err(DocChatError::ServiceUnavailable("boom".into()));
            }
            let n = if self.short_batch { texts.len() - 1 } else { texts.len() };
            Ok((0..n).map(|i| vec![i as f32, 1.0]).collect())
        }
    }

    fn texts(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("text {}", i)).collect()
    }

    #[tokio::test]
    async fn test_embed_texts_batches_in_order() {
        let e = FlakyEmbedder {
            calls: AtomicUsize::new(0),
            fail_on_call: usize::MAX,
            short_batch: false,
        };
        let out = embed_texts(&e, &texts(5)).await.unwrap();
        assert_eq!(out.len(), 5);
        assert_eq!(e.calls.load(Ordering::SeqCst), 3);
        assert_eq!(out[2], vec![0.0, 1.0]);
        assert_eq!(out[3], vec![1.0, 1.0]);
    }

    #[tokio::test]
    async fn test_embed_texts_fails_whole_call() {
        let e = FlakyEmbedder {
            calls: AtomicUsize::new(0),
            fail_on_call: 1,
            short_batch: false,
        };
        let err = embed_texts(&e, &texts(5)).await.unwrap_err();
        assert!(matches!(err, DocChatError::EmbeddingService(_)));
    }

    #[tokio::test]
    async fn test_embed_texts_rejects_short_batch() {
        let e = FlakyEmbedder {
            calls: AtomicUsize::new(0),
            fail_on_call: usize::MAX,
            short_batch: true,
        };
        let err = embed_texts(&e, &texts(2)).await.unwrap_err();
        assert!(matches!(err, DocChatError::EmbeddingService(_)));
    }

    struct Scripted(Result<Vec<Vec<f32>>>);

    #[async_trait]
    impl Embedder for Scripted {
        fn model_name(&self) -> &str {
            "scripted"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn test_embed_texts_keeps_rejections_and_refuses_nan() {
        let rejected = Scripted(Err(DocChatError::EmbeddingRejected("401".into())));
        let err = embed_texts(&rejected, &texts(1)).await.unwrap_err();
        assert!(!err.is_retryable());

        let invalid = Scripted(Err(DocChatError::Validation("bad model".into())));
        let err = embed_texts(&invalid, &texts(1)).await.unwrap_err();
        assert!(matches!(err, DocChatError::EmbeddingRejected(_)));

        let nan = Scripted(Ok(vec![vec![f32::NAN, 1.0]]));
        let err = embed_query(&nan, "q").await.unwrap_err();
        assert!(matches!(err, DocChatError::EmbeddingService(_)));
    }

    #[tokio::test]
    async fn test_hash_embedder_is_deterministic_and_unit_length() {
        let e = HashEmbedder::new(64);
        let a = embed_query(&e, "Refund policy for orders").await.unwrap();
        let b = embed_query(&e, "refund POLICY for orders!").await.unwrap();
        assert_eq!(a, b);
        assert!((l2_norm(&a) - 1.0).abs() < 1e-5);
        assert_eq!(e.metric(), SimilarityMetric::InnerProduct);
    }

    #[test]
    fn test_hash_embedder_overlap_scores_higher() {
        let e = HashEmbedder::new(256);
        let q = e.embed_one("refund policy");
        let close = e.embed_one("our refund policy explained");
        let far = e.embed_one("shipping times to europe");
        assert!(dot(&q, &close) > dot(&q, &far));
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_cases() {
        let cosine = |a: &[f32], b: &[f32]| cosine_from_parts(dot(a, b), l2_norm(a), l2_norm(b));
        let v = [1.0, 2.0, 3.0];
        assert!((cosine(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine(&[], &[]), 0.0);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_l2_normalize() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        let mut z = vec![0.0, 0.0];
        l2_normalize(&mut z);
        assert_eq!(z, vec![0.0, 0.0]);
    }
}

//! Overlapping, boundary-aware text chunker.
//!
//! Splits document text into [`Chunk`]s of at most `target_size` characters
//! where every pair of consecutive chunks shares exactly `overlap`
//! characters. Concatenating the chunks while dropping each chunk's leading
//! `overlap` characters reproduces the source text exactly.
//!
//! # Algorithm
//!
//! 1. If the rest of the text fits in `target_size`, emit it and stop.
//! 2. Otherwise look for a cut point in the window
//!    `[start + max(overlap + 1, target_size / 2), start + target_size]`,
//!    preferring (latest first) a paragraph break (`\n\n`), then a sentence
//!    end (`.`, `!`, `?` followed by whitespace, or a newline), then any
//!    whitespace.
//! 3. If the window has no boundary, hard-cut at `start + target_size`.
//! 4. The next chunk starts `overlap` characters before the cut.
//!
//! Sizes and offsets are counted in Unicode scalar values, never bytes, so
//! multi-byte text cannot be split inside a character.
//!
//! # Example
//!
//! ```rust
//! use docchat_core::chunk::{chunk_text, ChunkParams};
//!
//! let params = ChunkParams::new(20, 5).unwrap();
//! let chunks = chunk_text("doc-1", "Hello world.\n\nSecond paragraph here.", &params).unwrap();
//! assert_eq!(chunks[0].ordinal, 0);
//! assert_eq!(chunks[1].overlap, 5);
//! ```

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{DocChatError, Result};
use crate::models::Chunk;

/// Validated chunk size and overlap, both in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    pub target_size: usize,
    pub overlap: usize,
}

impl ChunkParams {
    /// Requires `0 < overlap < target_size`.
    pub fn new(target_size: usize, overlap: usize) -> Result<Self> {
        let params = Self {
            target_size,
            overlap,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if self.overlap == 0 {
            return Err(DocChatError::Validation(
                "chunk overlap must be > 0".to_string(),
            ));
        }
        if self.overlap >= self.target_size {
            return Err(DocChatError::Validation(format!(
                "chunk overlap ({}) must be smaller than target size ({})",
                self.overlap, self.target_size
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Boundary {
    Paragraph,
    Sentence,
    Word,
}

impl Boundary {
    /// Whether cutting before index `p` lands on this kind of boundary.
    fn matches(self, chars: &[char], p: usize) -> bool {
        let prev = chars[p - 1];
        match self {
            Boundary::Paragraph => prev == '\n' && chars[p - 2] == '\n',
            Boundary::Sentence => {
                prev == '\n' || (prev.is_whitespace() && matches!(chars[p - 2], '.' | '!' | '?'))
            }
            Boundary::Word => prev.is_whitespace(),
        }
    }
}

/// Split `text` into overlapping chunks.
///
/// Empty text yields an empty vector. Ordinals are contiguous from 0.
/// Chunk ids are UUID v5 values derived from `document_id` and the ordinal,
/// so re-chunking a document reproduces the same ids.
pub fn chunk_text(document_id: &str, text: &str, params: &ChunkParams) -> Result<Vec<Chunk>> {
    params.validate()?;

    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();
    let mut chunks = Vec::new();
    if n == 0 {
        return Ok(chunks);
    }

    let mut start = 0;
    loop {
        let end = if n - start <= params.target_size {
            n
        } else {
            find_cut(&chars, start, params)
        };
        let overlap = if chunks.is_empty() { 0 } else { params.overlap };
        chunks.push(make_chunk(
            document_id,
            chunks.len(),
            &chars[start..end],
            start,
            end,
            overlap,
        ));
        if end == n {
            break;
        }
        start = end - params.overlap;
    }

    Ok(chunks)
}

/// Rebuild the source text from an ordered chunk sequence.
pub fn reassemble(chunks: &[Chunk]) -> String {
    let mut out = String::new();
    for c in chunks {
        out.extend(c.text.chars().skip(c.overlap));
    }
    out
}

fn find_cut(chars: &[char], start: usize, params: &ChunkParams) -> usize {
    let max_end = start + params.target_size;
    let min_end = start + (params.overlap + 1).max(params.target_size / 2);

    for boundary in [Boundary::Paragraph, Boundary::Sentence, Boundary::Word] {
        if let Some(cut) = (min_end..=max_end)
            .rev()
            .find(|&p| boundary.matches(chars, p))
        {
            return cut;
        }
    }
    max_end
}

fn make_chunk(
    document_id: &str,
    ordinal: usize,
    span: &[char],
    start: usize,
    end: usize,
    overlap: usize,
) -> Chunk {
    let text: String = span.iter().collect();
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: chunk_id(document_id, ordinal),
        document_id: document_id.to_string(),
        ordinal,
        text,
        start,
        end,
        overlap,
        hash,
    }
}

fn chunk_id(document_id: &str, ordinal: usize) -> String {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{}:{}", document_id, ordinal).as_bytes(),
    )
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(target: usize, overlap: usize) -> ChunkParams {
        ChunkParams::new(target, overlap).unwrap()
    }

    fn paragraphs(count: usize, len: usize) -> String {
        (0..count)
            .map(|i| {
                let word = format!("p{} ", i);
                word.repeat(len / word.len() + 1)[..len].to_string()
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    #[test]
    fn test_empty_text() {
        let chunks = chunk_text("doc1", "", &params(100, 10)).unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_invalid_params() {
        assert!(matches!(
            ChunkParams::new(100, 0),
            Err(DocChatError::Validation(_))
        ));
        assert!(ChunkParams::new(100, 100).is_err());
        assert!(ChunkParams::new(10, 50).is_err());
        let raw = ChunkParams {
            target_size: 5,
            overlap: 0,
        };
        assert!(chunk_text("doc1", "abc", &raw).is_err());
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_text("doc1", "Hello, world!", &params(100, 10)).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].ordinal, 0);
        assert_eq!(chunks[0].overlap, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!((chunks[0].start, chunks[0].end), (0, 13));
    }

    #[test]
    fn test_reassembles_exactly() {
        let texts = [
            paragraphs(7, 130),
            "no boundaries at all ".repeat(40).replace(' ', ""),
            "One. Two! Three? Four.\nFive six seven.\n\nEight nine ten. ".repeat(25),
            "┌──────────────────┐\n│ Hello wörld      │\n└──────────────────┘ ".repeat(12),
        ];
        for text in &texts {
            for (target, overlap) in [(50, 10), (97, 13), (200, 199), (2, 1)] {
                let chunks = chunk_text("doc1", text, &params(target, overlap)).unwrap();
                assert_eq!(&reassemble(&chunks), text, "target={} overlap={}", target, overlap);
            }
        }
    }

    #[test]
    fn test_consecutive_chunks_share_overlap() {
        let text = paragraphs(6, 90);
        let p = params(120, 15);
        let chunks = chunk_text("doc1", &text, &p).unwrap();
        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            assert_eq!(b.overlap, 15);
            assert_eq!(b.start, a.end - 15);
            let tail: String = a.text.chars().skip(a.text.chars().count() - 15).collect();
            let head: String = b.text.chars().take(15).collect();
            assert_eq!(tail, head);
        }
        for c in &chunks {
            assert!(c.text.chars().count() <= 120);
            assert_eq!(c.end - c.start, c.text.chars().count());
        }
    }

    #[test]
    fn test_ordinals_contiguous() {
        let text = paragraphs(40, 33);
        let chunks = chunk_text("doc1", &text, &params(64, 8)).unwrap();
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.ordinal, i, "ordinal mismatch at position {}", i);
        }
    }

    #[test]
    fn test_prefers_paragraph_boundary() {
        let text = format!("{}\n\n{}", "a".repeat(70), "b".repeat(70));
        let chunks = chunk_text("doc1", &text, &params(100, 5)).unwrap();
        assert_eq!(chunks[0].end, 72);
        assert!(chunks[0].text.ends_with("\n\n"));
    }

    #[test]
    fn test_prefers_sentence_over_word() {
        let text = format!("{}. {} {}", "x".repeat(55), "y".repeat(30), "z".repeat(60));
        let chunks = chunk_text("doc1", &text, &params(100, 5)).unwrap();
        assert_eq!(chunks[0].end, 57);
    }

    #[test]
    fn test_hard_cut_when_no_boundary() {
        let text = "x".repeat(250);
        let chunks = chunk_text("doc1", &text, &params(100, 10)).unwrap();
        assert_eq!(chunks[0].end, 100);
        assert_eq!(chunks[1].start, 90);
        assert_eq!(reassemble(&chunks), text);
    }

    #[test]
    fn test_four_paragraphs_make_four_chunks() {
        let text = paragraphs(4, 440);
        let chunks = chunk_text("policy", &text, &params(500, 50)).unwrap();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[3].end, text.chars().count());
    }

    #[test]
    fn test_multibyte_offsets_are_chars() {
        let text = "日本語のテキスト。".repeat(30);
        let chunks = chunk_text("doc1", &text, &params(40, 4)).unwrap();
        for c in &chunks {
            assert!(c.text.chars().count() <= 40);
        }
        assert_eq!(reassemble(&chunks), text);
    }

    #[test]
    fn test_deterministic_ids() {
        let text = paragraphs(5, 60);
        let c1 = chunk_text("doc1", &text, &params(80, 8)).unwrap();
        let c2 = chunk_text("doc1", &text, &params(80, 8)).unwrap();
        assert_eq!(c1, c2);
        let other = chunk_text("doc2", &text, &params(80, 8)).unwrap();
        assert_ne!(c1[0].id, other[0].id);
    }
}

//! Cross-index result merging.
//!
//! Each per-document [`VectorIndex`](crate::index::VectorIndex) query returns
//! a list already sorted by [`rank_cmp`]. [`merge_top_k`] combines those
//! lists with a k-way heap merge that keeps only one head per list in the
//! heap and stops after `k` pops, so the cost is `O(k log L)` for `L` lists
//! instead of sorting every candidate.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::index::{rank_cmp, ScoredChunk};

struct Head {
    list: usize,
    hit: ScoredChunk,
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Head {}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Head {
    // Reversed so the best-ranked head sits at the top of the max-heap.
    fn cmp(&self, other: &Self) -> Ordering {
        rank_cmp(&other.hit, &self.hit)
    }
}

/// Merge sorted per-index hit lists into the global top `k`.
pub fn merge_top_k(lists: Vec<Vec<ScoredChunk>>, k: usize) -> Vec<ScoredChunk> {
    let mut out = Vec::new();
    if k == 0 {
        return out;
    }

    let mut cursors: Vec<_> = lists.into_iter().map(Vec::into_iter).collect();
    let mut heap = BinaryHeap::with_capacity(cursors.len());
    for (list, cursor) in cursors.iter_mut().enumerate() {
        if let Some(hit) = cursor.next() {
            heap.push(Head { list, hit });
        }
    }

    while let Some(Head { list, hit }) = heap.pop() {
        out.push(hit);
        if out.len() == k {
            break;
        }
        if let Some(hit) = cursors[list].next() {
            heap.push(Head { list, hit });
        }
    }

    out
}

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::storage::SearchHit;

/// Which rankings a fused candidate appeared in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HybridSource {
    Vector,
    TextSearch,
    Both,
}

/// Candidate after fusing the dense and lexical rankings.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedCandidate {
    pub chunk_id: String,
    /// RRF score normalized to [0, 1].
    pub score: f32,
    /// 1-based rank in the dense ranking.
    pub dense_rank: Option<usize>,
    /// 1-based rank in the lexical ranking.
    pub sparse_rank: Option<usize>,
    pub source: HybridSource,
}

impl FusedCandidate {
    pub fn rank_key(&self) -> RankKey<'_> {
        RankKey {
            score: self.score,
            dense_rank: self.dense_rank,
            sparse_rank: self.sparse_rank,
            chunk_id: &self.chunk_id,
        }
    }
}

/// Sort key giving a total, deterministic order over ranked chunks:
/// score descending, then dense rank, then lexical rank (absent ranks last),
/// then chunk id.
#[derive(Debug, Clone, Copy)]
pub struct RankKey<'a> {
    pub score: f32,
    pub dense_rank: Option<usize>,
    pub sparse_rank: Option<usize>,
    pub chunk_id: &'a str,
}

impl RankKey<'_> {
    pub fn compare(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| rank_or_last(self.dense_rank).cmp(&rank_or_last(other.dense_rank)))
            .then_with(|| rank_or_last(self.sparse_rank).cmp(&rank_or_last(other.sparse_rank)))
            .then_with(|| self.chunk_id.cmp(other.chunk_id))
    }
}

fn rank_or_last(rank: Option<usize>) -> usize {
    rank.unwrap_or(usize::MAX)
}

/// Highest fused score a chunk can reach: rank 1 in both rankings.
pub fn max_fused_score(c: usize) -> f32 {
    2.0 / (c as f32 + 1.0)
}

/// Reciprocal Rank Fusion: merges ranked lists by rank, ignoring raw scores.
/// Formula: rrf_score(doc) = Σ 1/(c + rank_i) for each list containing doc,
/// with 1-based ranks. The result is divided by [`max_fused_score`] so it
/// lands in [0, 1], and returned in [`RankKey`] order.
///
/// A chunk listed twice in one ranking keeps its best rank.
pub fn reciprocal_rank_fusion(dense: &[SearchHit], sparse: &[SearchHit], c: usize) -> Vec<FusedCandidate> {
    let mut fused: HashMap<&str, FusedCandidate> = HashMap::new();

    for (idx, hit) in dense.iter().enumerate() {
        let rank = idx + 1;
        fused
            .entry(hit.chunk_id.as_str())
            .or_insert_with(|| FusedCandidate {
                chunk_id: hit.chunk_id.clone(),
                score: 0.0,
                dense_rank: Some(rank),
                sparse_rank: None,
                source: HybridSource::Vector,
            });
    }

    for (idx, hit) in sparse.iter().enumerate() {
        let rank = idx + 1;
        fused
            .entry(hit.chunk_id.as_str())
            .and_modify(|candidate| {
                if candidate.sparse_rank.is_none() {
                    candidate.sparse_rank = Some(rank);
                    candidate.source = HybridSource::Both;
                }
            })
            .or_insert_with(|| FusedCandidate {
                chunk_id: hit.chunk_id.clone(),
                score: 0.0,
                dense_rank: None,
                sparse_rank: Some(rank),
                source: HybridSource::TextSearch,
            });
    }

    let norm = max_fused_score(c);
    let mut merged: Vec<FusedCandidate> = fused
        .into_values()
        .map(|mut candidate| {
            let rrf = |rank: Option<usize>| rank.map_or(0.0, |r| 1.0 / (c as f32 + r as f32));
            let raw = rrf(candidate.dense_rank) + rrf(candidate.sparse_rank);
            candidate.score = (raw / norm).clamp(0.0, 1.0);
            candidate
        })
        .collect();

    merged.sort_by(|a, b| a.rank_key().compare(&b.rank_key()));
    merged
}

//! Hybrid Ranker - 어휘/벡터 결과 통합
//!
//! - `weighted`: 소스별 min-max 정규화 후 가중합 (없는 소스는 0)
//! - `rrf`: Reciprocal Rank Fusion `Σ 1/(k + rank)`
//!
//! 하이브리드 모드는 점수가 0 이하인 후보를 근거로 보지 않습니다.
//! 어휘 일치도 없고 벡터 유사도도 없는 쿼리는 빈 결과가 됩니다.
//!
//! ref: https://www.elastic.co/blog/hybrid-search-rrf

use std::collections::BTreeMap;

use crate::config::{FusionPolicy, SearchConfig};
use crate::index::{ChunkId, ScoredChunk};

use super::{RankedResult, SearchMode, SourceScores};

/// 두 결과 목록 통합
///
/// 단일 소스 모드는 해당 목록을 그대로 통과시킵니다.
/// 결과 길이는 `top_k` 이하이며 부족해도 채우지 않습니다.
pub fn fuse(
    lexical: &[ScoredChunk],
    vector: &[ScoredChunk],
    top_k: usize,
    mode: SearchMode,
    config: &SearchConfig,
) -> Vec<RankedResult> {
    if top_k == 0 {
        return Vec::new();
    }

    match mode {
        SearchMode::Lexical => pass_through(lexical, top_k, |s| SourceScores {
            lexical: Some(s),
            vector: None,
        }),
        SearchMode::Vector => pass_through(vector, top_k, |s| SourceScores {
            lexical: None,
            vector: Some(s),
        }),
        SearchMode::Hybrid => {
            let lexical = with_evidence(lexical);
            let vector = with_evidence(vector);
            let mut fused = match config.fusion {
                FusionPolicy::Weighted => weighted(&lexical, &vector, config),
                FusionPolicy::Rrf => reciprocal_rank(&lexical, &vector, config.rrf_k),
            };
            fused.sort_by(|a, b| {
                b.score
                    .total_cmp(&a.score)
                    .then_with(|| a.chunk_id.cmp(&b.chunk_id))
            });
            fused.truncate(top_k);
            fused
        }
    }
}

fn pass_through(
    results: &[ScoredChunk],
    top_k: usize,
    scores: impl Fn(f32) -> SourceScores,
) -> Vec<RankedResult> {
    results
        .iter()
        .take(top_k)
        .map(|r| RankedResult {
            chunk_id: r.chunk_id,
            score: r.score,
            scores: scores(r.score),
            rerank_score: None,
        })
        .collect()
}

/// 양수 점수만 남김 (순서 유지)
fn with_evidence(results: &[ScoredChunk]) -> Vec<ScoredChunk> {
    results.iter().copied().filter(|r| r.score > 0.0).collect()
}

/// 청크별 원 점수 모음 (ID 오름차순)
fn collect_sources(
    lexical: &[ScoredChunk],
    vector: &[ScoredChunk],
) -> BTreeMap<ChunkId, SourceScores> {
    let mut merged: BTreeMap<ChunkId, SourceScores> = BTreeMap::new();
    for r in lexical {
        merged.entry(r.chunk_id).or_default().lexical = Some(r.score);
    }
    for r in vector {
        merged.entry(r.chunk_id).or_default().vector = Some(r.score);
    }
    merged
}

fn weighted(lexical: &[ScoredChunk], vector: &[ScoredChunk], config: &SearchConfig) -> Vec<RankedResult> {
    let lexical_range = score_range(lexical);
    let vector_range = score_range(vector);

    collect_sources(lexical, vector)
        .into_iter()
        .map(|(chunk_id, scores)| {
            let l = scores
                .lexical
                .zip(lexical_range)
                .map(|(s, range)| min_max(s, range))
                .unwrap_or(0.0);
            let v = scores
                .vector
                .zip(vector_range)
                .map(|(s, range)| min_max(s, range))
                .unwrap_or(0.0);

            RankedResult {
                chunk_id,
                score: config.lexical_weight * l + config.vector_weight * v,
                scores,
                rerank_score: None,
            }
        })
        .collect()
}

fn reciprocal_rank(lexical: &[ScoredChunk], vector: &[ScoredChunk], k: f32) -> Vec<RankedResult> {
    let rank_of = |list: &[ScoredChunk], id: ChunkId| -> Option<usize> {
        list.iter().position(|r| r.chunk_id == id).map(|p| p + 1)
    };

    collect_sources(lexical, vector)
        .into_iter()
        .map(|(chunk_id, scores)| {
            let score: f32 = [rank_of(lexical, chunk_id), rank_of(vector, chunk_id)]
                .into_iter()
                .flatten()
                .map(|rank| 1.0 / (k + rank as f32))
                .sum();

            RankedResult {
                chunk_id,
                score,
                scores,
                rerank_score: None,
            }
        })
        .collect()
}

/// (min, max), 빈 목록은 None
fn score_range(results: &[ScoredChunk]) -> Option<(f32, f32)> {
    results.iter().fold(None, |acc, r| match acc {
        None => Some((r.score, r.score)),
        Some((lo, hi)) => Some((lo.min(r.score), hi.max(r.score))),
    })
}

/// [0, 1] 정규화
///
/// 모든 점수가 같으면 그 점수가 양수일 때만 1.0, 아니면 0.0
fn min_max(score: f32, (lo, hi): (f32, f32)) -> f32 {
    if hi - lo <= f32::EPSILON {
        if hi > 0.0 {
            1.0
        } else {
            0.0
        }
    } else {
        (score - lo) / (hi - lo)
    }
}

// ============================================================================
// Tests
// ============================================================================

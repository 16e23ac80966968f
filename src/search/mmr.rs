//! MMR - Maximal Marginal Relevance 재순위
//!
//! 통합 결과 상위 `pool`개를 후보로 두고 한 건씩 고릅니다.
//! `mmr = λ·rel − (1−λ)·max sim(후보, 선택됨)`
//!
//! - `rel`: 후보 풀 최고 점수로 나눈 검색 점수
//! - `sim`: 캡슐 벡터 인덱스 메트릭으로 잰 청크 간 유사도 (벡터 없으면 0)
//!
//! ref: https://www.cs.cmu.edu/~jgc/publication/The_Use_MMR_Diversity_Based_LTMIR_1998.pdf

use crate::error::{RagcapError, Result};
use crate::index::ChunkId;

use super::RankedResult;

/// `pool` 미지정 시 후보 수 = top_k × 이 값
pub const DEFAULT_POOL_FACTOR: usize = 4;

/// MMR 재순위 설정
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MmrOptions {
    /// 관련도 가중치 [0, 1]
    pub lambda: f32,
    /// 후보 풀 크기 (None이면 top_k × 4, top_k보다 작으면 top_k)
    pub pool: Option<usize>,
}

impl MmrOptions {
    pub fn new(lambda: f32, pool: Option<usize>) -> Result<Self> {
        if !(0.0..=1.0).contains(&lambda) {
            return Err(RagcapError::invalid(format!(
                "mmr lambda must be within [0, 1], got {}",
                lambda
            )));
        }
        Ok(Self { lambda, pool })
    }

    /// 재순위 전에 통합할 결과 수
    pub fn pool_size(&self, top_k: usize) -> usize {
        self.pool
            .unwrap_or_else(|| top_k.saturating_mul(DEFAULT_POOL_FACTOR))
            .max(top_k)
    }
}

/// 후보를 MMR 순서로 `top_k`개 선택
///
/// 동점이면 검색 점수가 높은 쪽, 그다음 낮은 청크 ID가 먼저입니다.
/// 선택된 결과의 `score`는 검색 점수 그대로이고 `rerank_score`가 채워집니다.
pub fn rerank(
    candidates: Vec<RankedResult>,
    top_k: usize,
    lambda: f32,
    similarity: impl Fn(ChunkId, ChunkId) -> f32,
) -> Vec<RankedResult> {
    let max_score = candidates
        .iter()
        .map(|c| c.score)
        .fold(f32::NEG_INFINITY, f32::max);
    let relevance = |score: f32| {
        if max_score > 0.0 {
            score / max_score
        } else {
            0.0
        }
    };

    let mut remaining = candidates;
    let mut selected: Vec<RankedResult> = Vec::with_capacity(top_k.min(remaining.len()));

    while selected.len() < top_k && !remaining.is_empty() {
        let mut best: Option<(usize, f32)> = None;

        for (i, candidate) in remaining.iter().enumerate() {
            let redundancy = selected
                .iter()
                .map(|s| similarity(candidate.chunk_id, s.chunk_id))
                .fold(None, |acc: Option<f32>, sim| Some(acc.map_or(sim, |a| a.max(sim))))
                .unwrap_or(0.0);
            let value = lambda * relevance(candidate.score) - (1.0 - lambda) * redundancy;

            let better = match best {
                None => true,
                Some((j, best_value)) => {
                    let current = &remaining[j];
                    value
                        .total_cmp(&best_value)
                        .then_with(|| candidate.score.total_cmp(&current.score))
                        .then_with(|| current.chunk_id.cmp(&candidate.chunk_id))
                        .is_gt()
                }
            };
            if better {
                best = Some((i, value));
            }
        }

        let Some((index, value)) = best else {
            break;
        };
        let mut chosen = remaining.remove(index);
        chosen.rerank_score = Some(value);
        selected.push(chosen);
    }

    selected
}

// ============================================================================
// Tests
// ============================================================================

//! Index - 캡슐 로드 시 한 번 구축되는 읽기 전용 검색 인덱스
//!
//! - `lexical`: BM25 역색인
//! - `vector`: HNSW 그래프 + 전수 검색
//!
//! 두 인덱스 모두 구축 후에는 불변이며 `&self` 만으로 조회합니다.

pub mod lexical;
pub mod vector;

use std::cmp::Ordering;
use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{RagcapError, Result};

pub use lexical::LexicalIndex;
pub use vector::VectorIndex;

/// 청크 ID (chunks.id)
pub type ChunkId = i64;

// ============================================================================
// Types
// ============================================================================

/// 인덱스 조회 결과 한 건
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredChunk {
    pub chunk_id: ChunkId,
    pub score: f32,
}

impl ScoredChunk {
    pub fn new(chunk_id: ChunkId, score: f32) -> Self {
        Self { chunk_id, score }
    }
}

/// 벡터 유사도 메트릭
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// 코사인 유사도 (저장 시 정규화 후 내적)
    Cosine,
    /// 내적
    Dot,
    /// 유클리드 거리 기반 유사도 `1 / (1 + d)`
    Euclidean,
}

impl Metric {
    /// 인덱스에 넣기 전 벡터 전처리
    pub fn prepare(&self, vector: &mut [f32]) {
        if *self == Metric::Cosine {
            normalize(vector);
        }
    }

    /// 전처리된 두 벡터의 유사도 (클수록 가까움)
    pub fn similarity(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Cosine | Metric::Dot => dot(a, b),
            Metric::Euclidean => {
                let d: f32 = a
                    .iter()
                    .zip(b.iter())
                    .map(|(x, y)| (x - y) * (x - y))
                    .sum::<f32>()
                    .sqrt();
                1.0 / (1.0 + d)
            }
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Metric::Cosine => "cosine",
            Metric::Dot => "dot",
            Metric::Euclidean => "euclidean",
        };
        f.write_str(s)
    }
}

/// 검색 대상 청크 제한 (경로 필터 결과)
#[derive(Debug, Clone, Default)]
pub struct ChunkFilter {
    allowed: HashSet<ChunkId>,
}

impl ChunkFilter {
    pub fn new(allowed: impl IntoIterator<Item = ChunkId>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }

    pub fn allows(&self, chunk_id: ChunkId) -> bool {
        self.allowed.contains(&chunk_id)
    }

    pub fn len(&self) -> usize {
        self.allowed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 점수 내림차순, 동점이면 낮은 청크 ID 우선
pub fn compare_ranked(a: &ScoredChunk, b: &ScoredChunk) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

/// 정렬 후 상위 `top_k`만 남김
pub fn rank_desc(mut results: Vec<ScoredChunk>, top_k: usize) -> Vec<ScoredChunk> {
    results.sort_by(compare_ranked);
    results.truncate(top_k);
    results
}

/// 협력적 취소 확인
pub fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(RagcapError::Cancelled)
    } else {
        Ok(())
    }
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// L2 정규화 (영벡터는 그대로)
pub fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

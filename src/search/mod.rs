//! Search - 하이브리드 검색 파이프라인
//!
//! ## 모듈 구조
//! - `hybrid`: 점수 통합 (weighted / RRF)
//! - `filter`: 경로 include/exclude 필터
//! - `retriever`: 어휘/벡터 동시 조회 + 통합
//! - `mmr`: Maximal Marginal Relevance 재순위 (선택)

pub mod filter;
pub mod hybrid;
pub mod mmr;
pub mod retriever;

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RagcapError;
use crate::index::ChunkId;

pub use filter::PathFilter;
pub use hybrid::fuse;
pub use mmr::MmrOptions;
pub use retriever::{retrieve, RetrievalQuery};

// ============================================================================
// Types
// ============================================================================

/// 검색 모드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// 어휘 + 벡터 통합 (기본)
    #[default]
    Hybrid,
    /// BM25만 사용
    #[serde(alias = "bm25")]
    Lexical,
    /// 벡터만 사용
    Vector,
}

impl SearchMode {
    pub fn uses_lexical(&self) -> bool {
        matches!(self, SearchMode::Hybrid | SearchMode::Lexical)
    }

    pub fn uses_vector(&self) -> bool {
        matches!(self, SearchMode::Hybrid | SearchMode::Vector)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Hybrid => "hybrid",
            SearchMode::Lexical => "lexical",
            SearchMode::Vector => "vector",
        }
    }
}

impl FromStr for SearchMode {
    type Err = RagcapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hybrid" => Ok(SearchMode::Hybrid),
            "lexical" | "bm25" => Ok(SearchMode::Lexical),
            "vector" => Ok(SearchMode::Vector),
            other => Err(RagcapError::invalid(format!(
                "unknown search mode '{}' (expected hybrid, lexical or vector)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for SearchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 소스별 원 점수 (해당 소스 후보에 없으면 None)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceScores {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lexical: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector: Option<f32>,
}

/// 쿼리별 순위 결과 (저장되지 않음)
#[derive(Debug, Clone, PartialEq)]
pub struct RankedResult {
    pub chunk_id: ChunkId,
    /// 통합 점수
    pub score: f32,
    pub scores: SourceScores,
    /// MMR 재순위 점수 (재순위하지 않았으면 None)
    pub rerank_score: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("hybrid".parse::<SearchMode>().unwrap(), SearchMode::Hybrid);
        assert_eq!("BM25".parse::<SearchMode>().unwrap(), SearchMode::Lexical);
        assert_eq!("vector".parse::<SearchMode>().unwrap(), SearchMode::Vector);

        let err = "fuzzy".parse::<SearchMode>().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidRequest);
    }

    #[test]
    fn test_mode_serde() {
        let mode: SearchMode = serde_json::from_str("\"bm25\"").unwrap();
        assert_eq!(mode, SearchMode::Lexical);
        assert_eq!(serde_json::to_string(&SearchMode::Vector).unwrap(), "\"vector\"");
    }
}

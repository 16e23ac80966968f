//! 임베딩 모듈 - 텍스트 벡터화 프로바이더
//!
//! 캡슐 메타데이터의 `embedding_model_id`로 프로바이더를 결정합니다.
//! - `ragcap-hash-v1`: 로컬 feature hashing (키 불필요, 결정적)
//! - `gemini-embedding-001`: Gemini API
//!
//! ## 사용법
//! ```rust,ignore
//! let embedder = resolve_embedder("ragcap-hash-v1", 256, &config.embedding)?;
//! let query_vector = embedder.embed("cats").await?;
//! ```

pub mod gemini;
pub mod hash;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::EmbeddingConfig;
use crate::error::{RagcapError, Result};

pub use gemini::GeminiEmbedding;
pub use hash::HashEmbedder;

// ============================================================================
// EmbeddingProvider Trait
// ============================================================================

/// 임베딩 프로바이더 트레이트
///
/// `embed`는 검색 쿼리용, `embed_batch`는 문서 청크용입니다.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 단일 텍스트 임베딩
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// 배치 임베딩 (기본 구현: 순차 호출)
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// 임베딩 차원 수
    fn dimension(&self) -> usize;

    /// 모델 ID
    fn name(&self) -> &str;
}

// ============================================================================
// Factory Function
// ============================================================================

/// 모델 ID로 프로바이더 생성
///
/// 알 수 없는 모델이나 모델이 지원하지 않는 차원은 `IncompatibleCapsule`.
pub fn resolve_embedder(
    model_id: &str,
    dimension: usize,
    config: &EmbeddingConfig,
) -> Result<Arc<dyn EmbeddingProvider>> {
    let embedder: Arc<dyn EmbeddingProvider> = match model_id {
        hash::MODEL_ID => Arc::new(
            HashEmbedder::new(dimension).map_err(|e| RagcapError::incompatible(e.to_string()))?,
        ),
        gemini::MODEL_ID => Arc::new(
            GeminiEmbedding::with_dimension(
                config.gemini_api_key.clone(),
                dimension,
                config,
            )
            .map_err(|e| RagcapError::incompatible(e.to_string()))?,
        ),
        other => {
            return Err(RagcapError::incompatible(format!(
                "unknown embedding model '{}'",
                other
            )))
        }
    };

    tracing::debug!("Resolved embedder {} (dimension: {})", model_id, dimension);
    Ok(embedder)
}

/// 지원하는 모델 ID 목록
pub fn known_models() -> &'static [&'static str] {
    &[hash::MODEL_ID, gemini::MODEL_ID]
}

// ============================================================================
// API Key Management
// ============================================================================

/// Gemini API 키 로드 (환경변수에서)
///
/// 우선순위:
/// 1. `GEMINI_API_KEY` 환경변수
/// 2. `GOOGLE_AI_API_KEY` 환경변수
pub fn get_api_key() -> Option<String> {
    for var in ["GEMINI_API_KEY", "GOOGLE_AI_API_KEY"] {
        if let Ok(key) = std::env::var(var) {
            if !key.is_empty() {
                tracing::debug!("Using API key from {}", var);
                return Some(key);
            }
        }
    }
    None
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_resolve_hash_model() {
        let embedder = resolve_embedder("ragcap-hash-v1", 64, &EmbeddingConfig::default()).unwrap();
        assert_eq!(embedder.dimension(), 64);
        assert_eq!(embedder.name(), "ragcap-hash-v1");
    }

    #[test]
    fn test_resolve_gemini_without_key_succeeds() {
        // 키 검사는 실제 호출 시점에 수행
        let config = EmbeddingConfig::default();
        let embedder = resolve_embedder("gemini-embedding-001", 768, &config).unwrap();
        assert_eq!(embedder.dimension(), 768);
    }

    #[test]
    fn test_resolve_unknown_model() {
        let err = resolve_embedder("word2vec", 300, &EmbeddingConfig::default())
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::IncompatibleCapsule);
    }

    #[test]
    fn test_resolve_unsupported_dimension() {
        let err = resolve_embedder("gemini-embedding-001", 128, &EmbeddingConfig::default())
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::IncompatibleCapsule);
    }
}

//! 로컬 feature hashing 임베딩
//!
//! 토큰마다 SHA-256 해시로 버킷과 부호를 정해 누적한 뒤 L2 정규화합니다.
//! 같은 입력은 항상 같은 벡터가 되며 네트워크를 쓰지 않습니다.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::{RagcapError, Result};
use crate::index::lexical::tokenize;
use crate::index::normalize;

use super::EmbeddingProvider;

/// 모델 ID
pub const MODEL_ID: &str = "ragcap-hash-v1";

/// feature hashing 임베더
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(RagcapError::invalid("hash embedding dimension must be positive"));
        }
        Ok(Self { dimension })
    }

    /// 동기 임베딩
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];

        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);

            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimension as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_text(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        MODEL_ID
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::dot;

    #[test]
    fn test_deterministic_and_normalized() {
        let embedder = HashEmbedder::new(64).unwrap();
        let a = embedder.embed_text("cats are mammals");
        let b = embedder.embed_text("cats are mammals");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_case_insensitive_tokens() {
        let embedder = HashEmbedder::new(32).unwrap();
        assert_eq!(embedder.embed_text("Mammals"), embedder.embed_text("mammals"));
    }

    #[test]
    fn test_shared_terms_are_closer() {
        let embedder = HashEmbedder::new(256).unwrap();
        let query = embedder.embed_text("mammals");
        let cats = embedder.embed_text("cats are mammals");
        let rockets = embedder.embed_text("rockets use fuel");
        assert!(dot(&query, &cats) > dot(&query, &rockets));
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let embedder = HashEmbedder::new(8).unwrap();
        assert!(embedder.embed_text("   ").iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_zero_dimension_rejected() {
        assert!(HashEmbedder::new(0).is_err());
    }

    #[tokio::test]
    async fn test_batch_matches_single() {
        let embedder = HashEmbedder::new(16).unwrap();
        let texts = vec!["alpha".to_string(), "beta gamma".to_string()];
        let batch = embedder.embed_batch(&texts).await.unwrap();
        assert_eq!(batch[1], embedder.embed("beta gamma").await.unwrap());
    }
}

//! Google Gemini 임베딩
//!
//! source: https://ai.google.dev/gemini-api/docs/embeddings
//!
//! 실패 시 재시도하지 않고 `ProviderError`로 돌려줍니다.
//! 호출 간격만 `requests_per_minute`에 맞춰 조절합니다.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::EmbeddingConfig;
use crate::error::{RagcapError, Result};

use super::EmbeddingProvider;

/// 모델 ID
pub const MODEL_ID: &str = "gemini-embedding-001";

/// Gemini 임베딩 API 엔드포인트 (gemini-embedding-001 - MRL 지원)
const GEMINI_EMBED_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-embedding-001:embedContent";

/// 지원 차원
pub const SUPPORTED_DIMENSIONS: [usize; 3] = [768, 1536, 3072];

/// 검색 쿼리용 / 문서용 task type
const TASK_QUERY: &str = "RETRIEVAL_QUERY";
const TASK_DOCUMENT: &str = "RETRIEVAL_DOCUMENT";

// ============================================================================
// Types
// ============================================================================

/// Google Gemini 임베딩 구현체
#[derive(Debug)]
pub struct GeminiEmbedding {
    api_key: Option<String>,
    client: reqwest::Client,
    endpoint: String,
    dimension: usize,
    pacer: Arc<Mutex<RequestPacer>>,
}

/// 호출 간 최소 간격 유지
#[derive(Debug)]
struct RequestPacer {
    min_delay: Duration,
    last_request: Option<Instant>,
}

impl RequestPacer {
    fn new(requests_per_minute: u32) -> Self {
        let min_delay = if requests_per_minute == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(60) / requests_per_minute
        };
        Self {
            min_delay,
            last_request: None,
        }
    }

    async fn acquire(&mut self) {
        if let Some(last) = self.last_request {
            let elapsed = last.elapsed();
            if elapsed < self.min_delay {
                let wait_time = self.min_delay - elapsed;
                tracing::debug!("Embedding pacer: waiting {:?}", wait_time);
                tokio::time::sleep(wait_time).await;
            }
        }
        self.last_request = Some(Instant::now());
    }
}

/// Gemini API 요청 본문
#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'static str,
    content: EmbedContent<'a>,
    #[serde(rename = "taskType")]
    task_type: &'static str,
    #[serde(rename = "outputDimensionality")]
    output_dimensionality: usize,
}

#[derive(Debug, Serialize)]
struct EmbedContent<'a> {
    parts: Vec<EmbedPart<'a>>,
}

#[derive(Debug, Serialize)]
struct EmbedPart<'a> {
    text: &'a str,
}

/// Gemini API 응답
#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: EmbeddingValues,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

/// Gemini API 에러 응답
#[derive(Debug, Deserialize)]
struct GeminiError {
    error: GeminiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorDetail {
    message: String,
    #[serde(default)]
    status: String,
}

// ============================================================================
// GeminiEmbedding
// ============================================================================

impl GeminiEmbedding {
    /// 차원을 지정하여 생성
    ///
    /// API 키가 없어도 생성은 되며, 실제 호출 시 `ProviderError`가 납니다.
    pub fn with_dimension(
        api_key: Option<String>,
        dimension: usize,
        config: &EmbeddingConfig,
    ) -> Result<Self> {
        if !SUPPORTED_DIMENSIONS.contains(&dimension) {
            return Err(RagcapError::invalid(format!(
                "invalid dimension for {}: {}. Must be 768, 1536, or 3072",
                MODEL_ID, dimension
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RagcapError::provider_with("failed to create HTTP client", e))?;

        Ok(Self {
            api_key,
            client,
            endpoint: GEMINI_EMBED_URL.to_string(),
            dimension,
            pacer: Arc::new(Mutex::new(RequestPacer::new(config.requests_per_minute))),
        })
    }

    /// 엔드포인트 교체 (프록시/테스트용)
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    async fn embed_with_task(&self, text: &str, task_type: &'static str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Ok(vec![0.0; self.dimension]);
        }

        let api_key = self.api_key.as_deref().ok_or_else(|| {
            RagcapError::provider(
                "Gemini API key not found. Set GEMINI_API_KEY or GOOGLE_AI_API_KEY",
            )
        })?;

        let request = EmbedRequest {
            model: "models/gemini-embedding-001",
            content: EmbedContent {
                parts: vec![EmbedPart { text }],
            },
            task_type,
            output_dimensionality: self.dimension,
        };

        self.pacer.lock().await.acquire().await;

        // API 키는 URL이 아닌 헤더로 전송
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-goog-api-key", api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| RagcapError::provider_with("failed to send embedding request", e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RagcapError::provider_with("failed to read embedding response", e))?;

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<GeminiError>(&body) {
                return Err(RagcapError::provider(format!(
                    "Gemini API error ({} {}): {}",
                    status.as_u16(),
                    error.error.status,
                    error.error.message
                )));
            }
            return Err(RagcapError::provider(format!(
                "Gemini API error ({}): {}",
                status, body
            )));
        }

        let parsed: EmbedResponse = serde_json::from_str(&body)
            .map_err(|e| RagcapError::provider_with("failed to parse embedding response", e))?;

        if parsed.embedding.values.len() != self.dimension {
            return Err(RagcapError::DimensionMismatch {
                expected: self.dimension,
                actual: parsed.embedding.values.len(),
            });
        }

        Ok(parsed.embedding.values)
    }
}

#[async_trait]
impl EmbeddingProvider for GeminiEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_with_task(text, TASK_QUERY).await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        // 배치 API 대신 순차 처리, 간격은 pacer가 조절
        let mut results = Vec::with_capacity(texts.len());

        for (i, text) in texts.iter().enumerate() {
            tracing::debug!("Embedding batch {}/{}", i + 1, texts.len());
            results.push(self.embed_with_task(text, TASK_DOCUMENT).await?);
        }

        Ok(results)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        MODEL_ID
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> EmbeddingConfig {
        EmbeddingConfig {
            requests_per_minute: 0,
            timeout_secs: 5,
            ..Default::default()
        }
    }

    #[test]
    fn test_invalid_dimension() {
        let err = GeminiEmbedding::with_dimension(Some("k".into()), 999, &test_config())
            .err()
            .unwrap();
        assert!(err.to_string().contains("invalid dimension"));
    }

    #[test]
    fn test_valid_dimensions() {
        for dim in SUPPORTED_DIMENSIONS {
            assert!(GeminiEmbedding::with_dimension(None, dim, &test_config()).is_ok());
        }
    }

    #[tokio::test]
    async fn test_missing_key_is_provider_error() {
        let embedder = GeminiEmbedding::with_dimension(None, 768, &test_config()).unwrap();
        let err = embedder.embed("hello").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProviderError);
    }

    #[tokio::test]
    async fn test_embed_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embed"))
            .and(header("x-goog-api-key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embedding": { "values": vec![0.5f32; 768] }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let embedder = GeminiEmbedding::with_dimension(Some("test-key".into()), 768, &test_config())
            .unwrap()
            .with_endpoint(format!("{}/embed", server.uri()));

        let vector = embedder.embed("cats").await.unwrap();
        assert_eq!(vector.len(), 768);
        assert_eq!(vector[0], 0.5);
    }

    #[tokio::test]
    async fn test_api_error_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "error": { "message": "quota exceeded", "status": "RESOURCE_EXHAUSTED" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let embedder = GeminiEmbedding::with_dimension(Some("k".into()), 768, &test_config())
            .unwrap()
            .with_endpoint(server.uri());

        let err = embedder.embed("cats").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProviderError);
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[tokio::test]
    async fn test_wrong_length_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embedding": { "values": [0.1, 0.2] }
            })))
            .mount(&server)
            .await;

        let embedder = GeminiEmbedding::with_dimension(Some("k".into()), 768, &test_config())
            .unwrap()
            .with_endpoint(server.uri());

        let err = embedder.embed("cats").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DimensionMismatch);
    }
}

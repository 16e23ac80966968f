//! 로컬 모델 프로바이더 (Ollama)
//!
//! source: https://github.com/ollama/ollama/blob/main/docs/api.md#generate-a-completion

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::LocalProviderConfig;
use crate::error::{RagcapError, Result};

use super::{AnswerProvider, LOCAL_PROVIDER_ID, SYSTEM_INSTRUCTION};

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Debug, Deserialize)]
struct OllamaError {
    error: String,
}

/// Ollama `/api/generate` 프로바이더
#[derive(Debug, Clone)]
pub struct LocalProvider {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl LocalProvider {
    pub fn new(config: &LocalProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| RagcapError::provider_with("failed to create HTTP client", e))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

/// 문맥 구절을 하나의 프롬프트로 합침
pub fn build_prompt(query: &str, context: &[String]) -> String {
    let passages = context
        .iter()
        .map(|c| format!("--- Context: ---\n{}", c))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "{}\n\n---\n\n{}\n\n---\n\nQuery: {}\n\nAnswer:",
        SYSTEM_INSTRUCTION, passages, query
    )
}

#[async_trait]
impl AnswerProvider for LocalProvider {
    async fn generate(&self, prompt: &str, context: &[String]) -> Result<String> {
        let full_prompt = build_prompt(prompt, context);
        let url = format!("{}/api/generate", self.endpoint);

        let response = self
            .client
            .post(&url)
            .json(&GenerateRequest {
                model: &self.model,
                prompt: &full_prompt,
                stream: false,
            })
            .send()
            .await
            .map_err(|e| {
                RagcapError::provider_with(format!("failed to reach local model at {}", url), e)
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RagcapError::provider_with("failed to read local model response", e))?;

        if !status.is_success() {
            let detail = serde_json::from_str::<OllamaError>(&body)
                .map(|e| e.error)
                .unwrap_or(body);
            return Err(RagcapError::provider(format!(
                "local model error ({}): {}",
                status.as_u16(),
                detail
            )));
        }

        let parsed: GenerateResponse = serde_json::from_str(&body)
            .map_err(|e| RagcapError::provider_with("failed to parse local model response", e))?;

        Ok(parsed.response.trim().to_string())
    }

    fn name(&self) -> &str {
        LOCAL_PROVIDER_ID
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider_for(server: &MockServer) -> LocalProvider {
        LocalProvider::new(&LocalProviderConfig {
            endpoint: format!("{}/", server.uri()),
            model: "llama2".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_prompt_layout() {
        let prompt = build_prompt("why?", &["alpha".to_string(), "beta".to_string()]);
        assert!(prompt.starts_with(SYSTEM_INSTRUCTION));
        assert!(prompt.contains(&format!("{}\n\n---\n\n--- Context: ---", SYSTEM_INSTRUCTION)));
        assert!(prompt.contains("--- Context: ---\nalpha\n\n--- Context: ---\nbeta"));
        assert!(prompt.ends_with("Query: why?\n\nAnswer:"));
    }

    #[tokio::test]
    async fn test_generate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(serde_json::json!({
                "model": "llama2",
                "stream": false
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "llama2",
                "response": "  Cats are mammals.\n",
                "done": true
            })))
            .expect(1)
            .mount(&server)
            .await;

        let answer = provider_for(&server)
            .generate("what are cats?", &["cats are mammals".to_string()])
            .await
            .unwrap();
        assert_eq!(answer, "Cats are mammals.");
    }

    #[tokio::test]
    async fn test_model_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "error": "model 'llama2' not found"
            })))
            .mount(&server)
            .await;

        let err = provider_for(&server)
            .generate("q", &["c".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProviderError);
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        let provider = LocalProvider::new(&LocalProviderConfig {
            endpoint: "http://127.0.0.1:1".to_string(),
            model: "llama2".to_string(),
        })
        .unwrap();

        let err = provider.generate("q", &["c".to_string()]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProviderError);
        assert!(std::error::Error::source(&err).is_some());
    }
}

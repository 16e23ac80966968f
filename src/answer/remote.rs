//! 원격 API 프로바이더 (OpenAI 호환 / Azure OpenAI)
//!
//! 엔드포인트가 없거나 `openai.com`을 포함하면 OpenAI 방식,
//! 그 외에는 Azure 배포(deployment) 방식으로 호출합니다.
//!
//! source: https://platform.openai.com/docs/api-reference/chat/create

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::RemoteProviderConfig;
use crate::error::{RagcapError, Result};

use super::{AnswerProvider, REMOTE_PROVIDER_ID, SYSTEM_INSTRUCTION};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1/";
const DEFAULT_AZURE_API_VERSION: &str = "2024-02-15-preview";

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Flavor {
    OpenAi,
    Azure { api_version: String },
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

/// 채팅 완성 API 프로바이더
#[derive(Debug, Clone)]
pub struct RemoteProvider {
    client: reqwest::Client,
    base: Url,
    flavor: Flavor,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

// ============================================================================
// RemoteProvider
// ============================================================================

impl RemoteProvider {
    /// API 키가 없어도 생성은 되며, 호출 시 `ProviderError`가 납니다.
    pub fn new(config: &RemoteProviderConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty());

        let (base, flavor) = match endpoint {
            Some(e) if !e.contains("openai.com") => (
                parse_base(e)?,
                Flavor::Azure {
                    api_version: config
                        .api_version
                        .clone()
                        .unwrap_or_else(|| DEFAULT_AZURE_API_VERSION.to_string()),
                },
            ),
            Some(e) => (parse_base(e)?, Flavor::OpenAi),
            None => (parse_base(OPENAI_BASE_URL)?, Flavor::OpenAi),
        };

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| RagcapError::provider_with("failed to create HTTP client", e))?;

        Ok(Self {
            client,
            base,
            flavor,
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    /// OpenAI 방식 베이스 URL 교체 (프록시/테스트용)
    pub fn with_openai_base(mut self, base: &str) -> Result<Self> {
        self.base = parse_base(base)?;
        self.flavor = Flavor::OpenAi;
        Ok(self)
    }

    pub fn is_azure(&self) -> bool {
        matches!(self.flavor, Flavor::Azure { .. })
    }

    /// 요청 URL
    pub fn request_url(&self) -> Result<Url> {
        let url = match &self.flavor {
            Flavor::OpenAi => self.base.join("chat/completions"),
            Flavor::Azure { api_version } => self
                .base
                .join(&format!("openai/deployments/{}/chat/completions", self.model))
                .map(|mut url| {
                    url.query_pairs_mut().append_pair("api-version", api_version);
                    url
                }),
        };
        url.map_err(|e| RagcapError::invalid(format!("invalid remote endpoint: {}", e)))
    }

    fn messages(prompt: &str, context: &[String]) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(context.len() + 2);
        messages.push(ChatMessage {
            role: "system",
            content: SYSTEM_INSTRUCTION.to_string(),
        });
        for c in context {
            messages.push(ChatMessage {
                role: "user",
                content: format!("---\n{}", c),
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: format!("---\n{}", prompt),
        });
        messages
    }
}

/// 끝에 `/`를 붙여 `join`이 경로를 덮어쓰지 않게 함
fn parse_base(endpoint: &str) -> Result<Url> {
    let normalized = if endpoint.ends_with('/') {
        endpoint.to_string()
    } else {
        format!("{}/", endpoint)
    };
    Url::parse(&normalized)
        .map_err(|e| RagcapError::invalid(format!("invalid remote endpoint '{}': {}", endpoint, e)))
}

#[async_trait]
impl AnswerProvider for RemoteProvider {
    async fn generate(&self, prompt: &str, context: &[String]) -> Result<String> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            RagcapError::provider("remote API key not found. Set RAGCAP_API_KEY")
        })?;

        let url = self.request_url()?;
        let request = ChatRequest {
            model: match self.flavor {
                Flavor::OpenAi => Some(&self.model),
                Flavor::Azure { .. } => None,
            },
            messages: Self::messages(prompt, context),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let builder = self.client.post(url.clone()).json(&request);
        let builder = match self.flavor {
            Flavor::OpenAi => builder.bearer_auth(api_key),
            Flavor::Azure { .. } => builder.header("api-key", api_key),
        };

        let response = builder.send().await.map_err(|e| {
            RagcapError::provider_with(format!("failed to reach remote service at {}", url), e)
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RagcapError::provider_with("failed to read remote response", e))?;

        let parsed: ChatResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(e) if status.is_success() => {
                return Err(RagcapError::provider_with("failed to parse remote response", e))
            }
            Err(_) => {
                return Err(RagcapError::provider(format!(
                    "remote service error ({}): {}",
                    status.as_u16(),
                    body
                )))
            }
        };

        if let Some(error) = parsed.error {
            return Err(RagcapError::provider(format!(
                "remote service error ({}): {}",
                status.as_u16(),
                error.message
            )));
        }

        if !status.is_success() {
            return Err(RagcapError::provider(format!(
                "remote service error ({})",
                status.as_u16()
            )));
        }

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|text| text.trim().to_string())
            .ok_or_else(|| RagcapError::provider("remote response contained no answer"))
    }

    fn name(&self) -> &str {
        REMOTE_PROVIDER_ID
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Answer Synthesizer - 검색된 문맥으로 답변 생성
//!
//! 프로바이더는 ID로 선택합니다.
//! - `local-model` (`local`, `ollama`): Ollama
//! - `remote-service` (`remote`, `api`): OpenAI 호환 / Azure OpenAI
//!
//! 프로바이더 실패는 원인을 붙인 `ProviderError`로 돌려주며 재시도하지 않습니다.
//! 인용(citation)은 프로바이더에 실제로 전달한 구절에서만 만듭니다.

pub mod local;
pub mod remote;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::{AskConfig, ProvidersConfig};
use crate::error::{RagcapError, Result};
use crate::index::ChunkId;

pub use local::LocalProvider;
pub use remote::RemoteProvider;

/// 검색 결과가 없을 때의 답변
pub const NO_CONTEXT_ANSWER: &str = "No relevant context found.";

/// 기본 프로바이더 ID
pub const LOCAL_PROVIDER_ID: &str = "local-model";
pub const REMOTE_PROVIDER_ID: &str = "remote-service";

const LOCAL_ALIASES: [&str; 2] = ["local", "ollama"];
const REMOTE_ALIASES: [&str; 2] = ["remote", "api"];

/// 시스템 지시문
pub(crate) const SYSTEM_INSTRUCTION: &str = "You are a helpful assistant. Answer the user's query based on the provided context. Keep your answer concise and directly related to the query.";

// ============================================================================
// AnswerProvider Trait
// ============================================================================

/// 답변 생성 프로바이더
#[async_trait]
pub trait AnswerProvider: Send + Sync {
    /// 질의와 문맥 구절로 답변 생성
    async fn generate(&self, prompt: &str, context: &[String]) -> Result<String>;

    /// 프로바이더 이름
    fn name(&self) -> &str;
}

// ============================================================================
// Types
// ============================================================================

/// 프로바이더에 전달되는 구절
#[derive(Debug, Clone, PartialEq)]
pub struct Passage {
    pub chunk_id: ChunkId,
    pub document_source_uri: String,
    pub text: String,
    pub score: f32,
}

/// 인용
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    pub chunk_id: ChunkId,
    pub document_source_uri: String,
}

/// 생성된 답변
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub text: String,
    pub citations: Vec<Citation>,
}

// ============================================================================
// ProviderRegistry
// ============================================================================

/// ID → 프로바이더 매핑
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn AnswerProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 설정으로 기본 프로바이더 등록
    pub fn from_config(config: &ProvidersConfig) -> Result<Self> {
        let mut registry = Self::new();

        let local: Arc<dyn AnswerProvider> = Arc::new(LocalProvider::new(&config.local)?);
        registry.register_with_aliases(LOCAL_PROVIDER_ID, &LOCAL_ALIASES, local);

        let remote: Arc<dyn AnswerProvider> = Arc::new(RemoteProvider::new(&config.remote)?);
        registry.register_with_aliases(REMOTE_PROVIDER_ID, &REMOTE_ALIASES, remote);

        Ok(registry)
    }

    /// 프로바이더 등록 (같은 ID는 교체)
    pub fn register(&mut self, id: &str, provider: Arc<dyn AnswerProvider>) {
        self.providers.insert(id.trim().to_ascii_lowercase(), provider);
    }

    fn register_with_aliases(&mut self, id: &str, aliases: &[&str], provider: Arc<dyn AnswerProvider>) {
        for alias in aliases {
            self.register(alias, Arc::clone(&provider));
        }
        self.register(id, provider);
    }

    /// ID로 조회 (대소문자 무시)
    pub fn resolve(&self, id: &str) -> Result<Arc<dyn AnswerProvider>> {
        self.providers
            .get(&id.trim().to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| RagcapError::UnknownProvider(id.to_string()))
    }

    /// 등록된 ID 목록 (정렬)
    pub fn ids(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }
}

// ============================================================================
// AnswerSynthesizer
// ============================================================================

/// 답변 합성기
#[derive(Clone)]
pub struct AnswerSynthesizer {
    registry: ProviderRegistry,
    timeout: Duration,
}

impl AnswerSynthesizer {
    pub fn new(registry: ProviderRegistry, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn from_config(ask: &AskConfig, providers: &ProvidersConfig) -> Result<Self> {
        Ok(Self::new(
            ProviderRegistry::from_config(providers)?,
            Duration::from_secs(ask.timeout_secs),
        ))
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ProviderRegistry {
        &mut self.registry
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn resolve(&self, provider_id: &str) -> Result<Arc<dyn AnswerProvider>> {
        self.registry.resolve(provider_id)
    }

    /// 프로바이더 ID로 답변 생성
    pub async fn answer(
        &self,
        query: &str,
        passages: &[Passage],
        provider_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Answer> {
        let provider = self.resolve(provider_id)?;
        self.answer_with(query, passages, provider.as_ref(), None, cancel)
            .await
    }

    /// 이미 선택된 프로바이더로 답변 생성
    ///
    /// `timeout`이 None이면 설정값을 씁니다.
    pub async fn answer_with(
        &self,
        query: &str,
        passages: &[Passage],
        provider: &dyn AnswerProvider,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Answer> {
        if passages.is_empty() {
            return Ok(Answer {
                text: NO_CONTEXT_ANSWER.to_string(),
                citations: Vec::new(),
            });
        }

        let context: Vec<String> = passages.iter().map(|p| p.text.clone()).collect();
        let timeout = timeout.unwrap_or(self.timeout);

        tracing::debug!(
            "Generating answer with {} ({} passages, timeout {:?})",
            provider.name(),
            passages.len(),
            timeout
        );

        let text = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RagcapError::Cancelled),
            result = tokio::time::timeout(timeout, provider.generate(query, &context)) => {
                match result {
                    Ok(text) => text?,
                    Err(elapsed) => {
                        return Err(RagcapError::provider_with(
                            format!("provider '{}' timed out after {:?}", provider.name(), timeout),
                            elapsed,
                        ))
                    }
                }
            }
        };

        Ok(Answer {
            text,
            citations: citations(passages),
        })
    }
}

/// 순위 순서 유지, 청크 ID 중복 제거
fn citations(passages: &[Passage]) -> Vec<Citation> {
    let mut seen = HashSet::new();
    passages
        .iter()
        .filter(|p| seen.insert(p.chunk_id))
        .map(|p| Citation {
            chunk_id: p.chunk_id,
            document_source_uri: p.document_source_uri.clone(),
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 문맥 수를 세어 돌려주는 프로바이더
    #[derive(Default)]
    struct EchoProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AnswerProvider for EchoProvider {
        async fn generate(&self, prompt: &str, context: &[String]) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{} ({} passages)", prompt, context.len()))
        }
        fn name(&self) -> &str {
            "echo"
        }
    }

    struct SlowProvider;

    #[async_trait]
    impl AnswerProvider for SlowProvider {
        async fn generate(&self, _prompt: &str, _context: &[String]) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(String::new())
        }
        fn name(&self) -> &str {
            "slow"
        }
    }

    fn passage(id: ChunkId, uri: &str) -> Passage {
        Passage {
            chunk_id: id,
            document_source_uri: uri.to_string(),
            text: format!("text {}", id),
            score: 1.0,
        }
    }

    fn synthesizer_with(id: &str, provider: Arc<dyn AnswerProvider>) -> AnswerSynthesizer {
        let mut registry = ProviderRegistry::new();
        registry.register(id, provider);
        AnswerSynthesizer::new(registry, Duration::from_secs(5))
    }

    #[test]
    fn test_default_registry_ids() {
        let registry = ProviderRegistry::from_config(&ProvidersConfig::default()).unwrap();
        for id in ["local-model", "LOCAL", "ollama", "remote-service", "api", "remote"] {
            assert!(registry.resolve(id).is_ok(), "{} should resolve", id);
        }
        assert_eq!(registry.resolve("local").unwrap().name(), "local-model");
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let synthesizer = synthesizer_with("echo", Arc::new(EchoProvider::default()));
        let err = synthesizer
            .answer("q", &[passage(1, "a")], "nonexistent", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownProvider);
    }

    #[tokio::test]
    async fn test_citations_deduplicated_in_rank_order() {
        let provider = Arc::new(EchoProvider::default());
        let synthesizer = synthesizer_with("echo", provider.clone());
        let passages = vec![passage(3, "c.md"), passage(1, "a.txt"), passage(3, "c.md")];

        let answer = synthesizer
            .answer("why", &passages, "echo", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(answer.text, "why (3 passages)");
        let ids: Vec<_> = answer.citations.iter().map(|c| c.chunk_id).collect();
        assert_eq!(ids, vec![3, 1]);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_retrieval_skips_provider() {
        let provider = Arc::new(EchoProvider::default());
        let synthesizer = synthesizer_with("echo", provider.clone());

        let answer = synthesizer
            .answer("why", &[], "echo", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(answer.text, NO_CONTEXT_ANSWER);
        assert!(answer.citations.is_empty());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_timeout_is_provider_error() {
        let synthesizer = synthesizer_with("slow", Arc::new(SlowProvider));
        let err = synthesizer
            .answer_with(
                "q",
                &[passage(1, "a")],
                &SlowProvider,
                Some(Duration::from_millis(20)),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ProviderError);
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancellation_reaches_provider_call() {
        let synthesizer = synthesizer_with("slow", Arc::new(SlowProvider));
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = synthesizer
            .answer("q", &[passage(1, "a")], "slow", &token)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }
}

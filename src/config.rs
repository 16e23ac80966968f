//! 설정 모듈
//!
//! 기본값 → `~/.ragcap/config.toml` → `RAGCAP_*` 환경변수 순으로 병합합니다.
//! 섹션 구분자는 `__` 입니다. (예: `RAGCAP_SEARCH__LEXICAL_WEIGHT=0.7`)

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{RagcapError, Result};
use crate::index::Metric;

/// 환경변수 접두사
const ENV_PREFIX: &str = "RAGCAP_";

// ============================================================================
// Config Directory
// ============================================================================

/// 설정 디렉토리 경로 (~/.ragcap/)
pub fn get_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ragcap")
}

/// 기본 설정 파일 경로
///
/// 우선순위: `RAGCAP_CONFIG` > `~/.ragcap/config.toml`
pub fn default_config_path() -> PathBuf {
    match std::env::var("RAGCAP_CONFIG") {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => get_config_dir().join("config.toml"),
    }
}

// ============================================================================
// Sections
// ============================================================================

/// 하이브리드 점수 통합 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FusionPolicy {
    /// min-max 정규화 후 가중합
    Weighted,
    /// Reciprocal Rank Fusion
    Rrf,
}

/// `[search]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub fusion: FusionPolicy,
    pub lexical_weight: f32,
    pub vector_weight: f32,
    /// RRF 상수 k
    pub rrf_k: f32,
    /// 하이브리드 모드에서 소스별 후보 수 = top_k × multiplier
    pub candidate_multiplier: usize,
    pub default_top_k: usize,
    /// MMR 재순위 기본 λ (1이면 관련도만, 0이면 다양성만)
    pub mmr_lambda: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            fusion: FusionPolicy::Weighted,
            lexical_weight: 0.5,
            vector_weight: 0.5,
            rrf_k: 60.0,
            candidate_multiplier: 2,
            default_top_k: 5,
            mmr_lambda: 0.5,
        }
    }
}

/// `[lexical]` - BM25 상수
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct LexicalConfig {
    pub k1: f64,
    pub b: f64,
}

impl Default for LexicalConfig {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

/// `[vector]` - HNSW 파라미터
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorConfig {
    pub metric: Metric,
    /// 노드당 최대 이웃 수 (레이어 0은 2배)
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    /// 이 개수 이하면 그래프 없이 전수 검색
    pub exact_threshold: usize,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            metric: Metric::Cosine,
            m: 16,
            ef_construction: 100,
            ef_search: 64,
            exact_threshold: 256,
        }
    }
}

/// `[ask]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AskConfig {
    pub default_provider: String,
    pub timeout_secs: u64,
}

impl Default for AskConfig {
    fn default() -> Self {
        Self {
            default_provider: "local-model".to_string(),
            timeout_secs: 120,
        }
    }
}

/// `[providers.local]` - Ollama
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalProviderConfig {
    pub endpoint: String,
    pub model: String,
}

impl Default for LocalProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434".to_string(),
            model: "llama2".to_string(),
        }
    }
}

/// `[providers.remote]` - OpenAI 호환 / Azure OpenAI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteProviderConfig {
    /// None 이면 `https://api.openai.com/v1/`
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
    /// Azure 전용
    pub api_version: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for RemoteProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            api_version: None,
            temperature: 0.7,
            max_tokens: 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub local: LocalProviderConfig,
    pub remote: RemoteProviderConfig,
}

/// `[embedding]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub gemini_api_key: Option<String>,
    pub timeout_secs: u64,
    /// 원격 임베딩 호출 한도 (0 = 무제한)
    pub requests_per_minute: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            gemini_api_key: None,
            timeout_secs: 30,
            requests_per_minute: 60,
        }
    }
}

// ============================================================================
// Config
// ============================================================================

/// 전체 설정
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub search: SearchConfig,
    pub lexical: LexicalConfig,
    pub vector: VectorConfig,
    pub ask: AskConfig,
    pub providers: ProvidersConfig,
    pub embedding: EmbeddingConfig,
}

impl Config {
    /// 설정 로드
    ///
    /// `path`가 주어지면 해당 파일이 반드시 존재해야 합니다.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => {
                if !p.exists() {
                    return Err(RagcapError::io(
                        format!("config file not found: {}", p.display()),
                        std::io::Error::from(std::io::ErrorKind::NotFound),
                    ));
                }
                p.to_path_buf()
            }
            None => default_config_path(),
        };

        let figment = Self::figment()
            .merge(Toml::file(&file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config = Self::from_figment(figment)?;
        config.apply_env_keys();

        tracing::debug!("Loaded configuration from {:?}", file);
        Ok(config)
    }

    /// TOML 문자열에서 로드 (환경변수 미적용)
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        Self::from_figment(Self::figment().merge(Toml::string(toml)))
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        let config: Config = figment
            .extract()
            .map_err(|e| RagcapError::invalid(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 파일에 없는 API 키를 기존 환경변수에서 보충
    fn apply_env_keys(&mut self) {
        let remote = &mut self.providers.remote;
        if remote.api_key.is_none() {
            remote.api_key = non_empty_env("RAGCAP_API_KEY");
        }
        if remote.endpoint.is_none() {
            remote.endpoint = non_empty_env("RAGCAP_AZURE_ENDPOINT");
        }
        if remote.api_version.is_none() {
            remote.api_version = non_empty_env("RAGCAP_AZURE_API_VERSION");
        }

        if self.embedding.gemini_api_key.is_none() {
            self.embedding.gemini_api_key = crate::embedding::get_api_key();
        }
    }

    /// 값 범위 검증
    pub fn validate(&self) -> Result<()> {
        let s = &self.search;
        if !s.lexical_weight.is_finite() || !s.vector_weight.is_finite() {
            return Err(RagcapError::invalid("fusion weights must be finite numbers"));
        }
        if s.lexical_weight < 0.0 || s.vector_weight < 0.0 {
            return Err(RagcapError::invalid("fusion weights must be non-negative"));
        }
        if s.lexical_weight + s.vector_weight <= 0.0 {
            return Err(RagcapError::invalid("fusion weights must not both be zero"));
        }
        if !s.rrf_k.is_finite() || s.rrf_k <= 0.0 {
            return Err(RagcapError::invalid("rrf_k must be positive"));
        }
        if s.candidate_multiplier == 0 {
            return Err(RagcapError::invalid("candidate_multiplier must be at least 1"));
        }
        if !(0.0..=1.0).contains(&s.mmr_lambda) {
            return Err(RagcapError::invalid("mmr_lambda must be within [0, 1]"));
        }

        let l = &self.lexical;
        if !l.k1.is_finite() || l.k1 < 0.0 {
            return Err(RagcapError::invalid("BM25 k1 must be non-negative"));
        }
        if !(0.0..=1.0).contains(&l.b) {
            return Err(RagcapError::invalid("BM25 b must be within [0, 1]"));
        }

        let v = &self.vector;
        if v.m < 2 {
            return Err(RagcapError::invalid("HNSW m must be at least 2"));
        }
        if v.ef_construction == 0 || v.ef_search == 0 {
            return Err(RagcapError::invalid("HNSW ef values must be positive"));
        }

        if self.ask.timeout_secs == 0 {
            return Err(RagcapError::invalid("ask timeout must be positive"));
        }
        if self.embedding.timeout_secs == 0 {
            return Err(RagcapError::invalid("embedding timeout must be positive"));
        }

        Ok(())
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

// ============================================================================
// Tests
// ============================================================================

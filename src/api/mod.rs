//! API - `search` / `ask` / `export` 요청·응답 타입과 엔진 파사드
//!
//! 모든 요청/응답은 camelCase JSON으로 직렬화됩니다.
//! 실패는 `ErrorResponse { kind, message, cause }`로 표현합니다.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::answer::{AnswerProvider, AnswerSynthesizer, Citation, Passage, ProviderRegistry};
use crate::capsule::{Capsule, CapsuleHandle, CapsuleInfo, IndexParams};
use crate::config::Config;
use crate::embedding::{resolve_embedder, EmbeddingProvider};
use crate::error::Result;
use crate::export::{self, ExportFormat};
use crate::index::ChunkId;
use crate::search::{
    retrieve, MmrOptions, PathFilter, RankedResult, RetrievalQuery, SearchMode, SourceScores,
};

// ============================================================================
// Request / Response Types
// ============================================================================

/// `search` 요청
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub query: String,
    /// None이면 `[search] default_top_k`
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub mode: SearchMode,
    #[serde(default)]
    pub include: Option<String>,
    #[serde(default)]
    pub exclude: Option<String>,
    /// MMR 재순위
    #[serde(default)]
    pub mmr: bool,
    /// None이면 `[search] mmr_lambda`
    #[serde(default)]
    pub mmr_lambda: Option<f32>,
    /// 재순위 후보 수 (None이면 top_k × 4)
    #[serde(default)]
    pub mmr_pool: Option<usize>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }
}

/// 검색 결과 한 건
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub chunk_id: ChunkId,
    pub score: f32,
    pub document_source_uri: String,
    pub text: String,
    pub offset_start: i64,
    pub offset_end: i64,
    pub scores: SourceScores,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
}

/// `ask` 요청
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AskRequest {
    pub query: String,
    #[serde(default)]
    pub top_k: Option<usize>,
    /// None이면 `[ask] default_provider`
    #[serde(default)]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub mode: SearchMode,
    /// None이면 `[ask] timeout_secs`
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub include: Option<String>,
    #[serde(default)]
    pub exclude: Option<String>,
    #[serde(default)]
    pub mmr: bool,
    #[serde(default)]
    pub mmr_lambda: Option<f32>,
    #[serde(default)]
    pub mmr_pool: Option<usize>,
}

impl AskRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskResponse {
    pub answer: String,
    pub citations: Vec<Citation>,
}

/// `export` 요청
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRequest {
    pub destination_path: PathBuf,
    /// 형식 ID (알 수 없으면 `UnsupportedFormat`)
    #[serde(default = "default_export_format")]
    pub format: String,
}

fn default_export_format() -> String {
    ExportFormat::Parquet.as_str().to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportResponse {
    pub path: PathBuf,
}

// ============================================================================
// Engine
// ============================================================================

/// 캡슐 하나에 대한 검색/답변/내보내기 엔진
///
/// 설정 프로바이더는 첫 `ask`에서 만듭니다. 프로바이더 설정 오류는 검색에 영향을 주지 않습니다.
pub struct Engine {
    handle: Arc<CapsuleHandle>,
    embedder: Arc<dyn EmbeddingProvider>,
    /// `with_provider`로 등록한 프로바이더 (설정 프로바이더보다 우선)
    synthesizer: AnswerSynthesizer,
    configured: OnceLock<ProviderRegistry>,
    config: Config,
}

impl Engine {
    /// 캡슐을 열고 인덱스를 구축
    pub async fn open(path: &Path, config: Config) -> Result<Self> {
        config.validate()?;

        let params = IndexParams {
            lexical: config.lexical,
            vector: config.vector,
        };
        let owned = path.to_path_buf();
        let handle =
            tokio::task::spawn_blocking(move || CapsuleHandle::open(&owned, params)).await??;

        let meta = handle.snapshot()?.meta().clone();
        let embedder = resolve_embedder(
            &meta.embedding_model_id,
            meta.embedding_dimension,
            &config.embedding,
        )?;
        let synthesizer = AnswerSynthesizer::new(
            ProviderRegistry::new(),
            Duration::from_secs(config.ask.timeout_secs),
        );

        Ok(Self {
            handle: Arc::new(handle),
            embedder,
            synthesizer,
            configured: OnceLock::new(),
            config,
        })
    }

    /// 쿼리 임베더 교체
    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = embedder;
        self
    }

    /// 답변 프로바이더 등록 (같은 ID는 교체)
    pub fn with_provider(mut self, id: &str, provider: Arc<dyn AnswerProvider>) -> Self {
        self.synthesizer.registry_mut().register(id, provider);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn path(&self) -> &Path {
        self.handle.path()
    }

    /// 사용 가능한 프로바이더 ID (설정 프로바이더 생성 포함)
    pub fn provider_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .configured_providers()?
            .ids()
            .into_iter()
            .chain(self.synthesizer.registry().ids())
            .map(str::to_string)
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// 하이브리드/단일 소스 검색
    pub async fn search(
        &self,
        request: &SearchRequest,
        cancel: &CancellationToken,
    ) -> Result<SearchResponse> {
        let capsule = self.handle.snapshot()?;
        let query = self
            .retrieval_query(
                &request.query,
                request.top_k,
                request.mode,
                request.include.as_deref(),
                request.exclude.as_deref(),
            )?
            .with_mmr(self.mmr_options(request.mmr, request.mmr_lambda, request.mmr_pool)?);

        let ranked = retrieve(
            Arc::clone(&capsule),
            Arc::clone(&self.embedder),
            &self.config.search,
            &query,
            cancel,
        )
        .await?;

        let results = hydrate(capsule, ranked).await?;
        Ok(SearchResponse { results })
    }

    /// 검색 후 답변 생성
    ///
    /// 프로바이더는 검색 전에 확인하므로 알 수 없는 ID는 검색 없이 실패합니다.
    pub async fn ask(&self, request: &AskRequest, cancel: &CancellationToken) -> Result<AskResponse> {
        let provider_id = request
            .provider_id
            .as_deref()
            .unwrap_or(&self.config.ask.default_provider);
        let provider = self.resolve_provider(provider_id)?;

        let capsule = self.handle.snapshot()?;
        let query = self
            .retrieval_query(
                &request.query,
                request.top_k,
                request.mode,
                request.include.as_deref(),
                request.exclude.as_deref(),
            )?
            .with_mmr(self.mmr_options(request.mmr, request.mmr_lambda, request.mmr_pool)?);

        let ranked = retrieve(
            Arc::clone(&capsule),
            Arc::clone(&self.embedder),
            &self.config.search,
            &query,
            cancel,
        )
        .await?;

        let passages: Vec<Passage> = hydrate(capsule, ranked)
            .await?
            .into_iter()
            .map(|hit| Passage {
                chunk_id: hit.chunk_id,
                document_source_uri: hit.document_source_uri,
                text: hit.text,
                score: hit.score,
            })
            .collect();

        let timeout = request.timeout_secs.map(Duration::from_secs);
        let answer = self
            .synthesizer
            .answer_with(&request.query, &passages, provider.as_ref(), timeout, cancel)
            .await?;

        Ok(AskResponse {
            answer: answer.text,
            citations: answer.citations,
        })
    }

    /// 현재 스냅샷 내보내기
    pub async fn export(
        &self,
        request: &ExportRequest,
        cancel: &CancellationToken,
    ) -> Result<ExportResponse> {
        let format: ExportFormat = request.format.parse()?;
        let capsule = self.handle.snapshot()?;
        let path = export::export(capsule, &request.destination_path, format, cancel).await?;
        Ok(ExportResponse { path })
    }

    pub fn inspect(&self) -> Result<CapsuleInfo> {
        self.handle.snapshot()?.info()
    }

    /// 캡슐을 다시 읽어 스냅샷 교체
    pub async fn reload(&self) -> Result<CapsuleInfo> {
        let handle = Arc::clone(&self.handle);
        let capsule = tokio::task::spawn_blocking(move || handle.reload()).await??;

        let meta = capsule.meta();
        if meta.embedding_dimension != self.embedder.dimension() {
            tracing::warn!(
                "Reloaded capsule dimension {} differs from query embedder ({}); reopen the engine",
                meta.embedding_dimension,
                self.embedder.dimension()
            );
        }
        capsule.info()
    }

    fn retrieval_query(
        &self,
        text: &str,
        top_k: Option<usize>,
        mode: SearchMode,
        include: Option<&str>,
        exclude: Option<&str>,
    ) -> Result<RetrievalQuery> {
        let top_k = top_k.unwrap_or(self.config.search.default_top_k);
        let filter = PathFilter::parse(include, exclude)?;
        Ok(RetrievalQuery::new(text, top_k, mode).with_filter(filter))
    }

    fn mmr_options(
        &self,
        enabled: bool,
        lambda: Option<f32>,
        pool: Option<usize>,
    ) -> Result<Option<MmrOptions>> {
        if !enabled {
            return Ok(None);
        }
        let lambda = lambda.unwrap_or(self.config.search.mmr_lambda);
        MmrOptions::new(lambda, pool).map(Some)
    }

    /// 등록된 프로바이더 우선, 없으면 설정 프로바이더
    fn resolve_provider(&self, id: &str) -> Result<Arc<dyn AnswerProvider>> {
        if let Ok(provider) = self.synthesizer.resolve(id) {
            return Ok(provider);
        }
        self.configured_providers()?.resolve(id)
    }

    fn configured_providers(&self) -> Result<&ProviderRegistry> {
        if let Some(registry) = self.configured.get() {
            return Ok(registry);
        }
        let registry = ProviderRegistry::from_config(&self.config.providers)?;
        Ok(self.configured.get_or_init(|| registry))
    }
}

/// 순위 결과에 청크 본문과 source URI 채우기
async fn hydrate(capsule: Arc<Capsule>, ranked: Vec<RankedResult>) -> Result<Vec<SearchHit>> {
    if ranked.is_empty() {
        return Ok(Vec::new());
    }

    tokio::task::spawn_blocking(move || {
        ranked
            .into_iter()
            .map(|r| {
                let chunk = capsule.store().get(r.chunk_id)?;
                let uri = match source_of(&capsule, r.chunk_id) {
                    Some(uri) => uri,
                    None => capsule.store().document_source(chunk.document_id)?,
                };

                Ok(SearchHit {
                    chunk_id: r.chunk_id,
                    score: r.score,
                    document_source_uri: uri,
                    text: chunk.text,
                    offset_start: chunk.offset_start,
                    offset_end: chunk.offset_end,
                    scores: r.scores,
                    rerank_score: r.rerank_score,
                })
            })
            .collect::<Result<Vec<_>>>()
    })
    .await?
}

/// 로드 시 만든 (청크 ID, URI) 목록에서 조회
fn source_of(capsule: &Capsule, chunk_id: ChunkId) -> Option<String> {
    let sources = capsule.chunk_sources();
    sources
        .binary_search_by_key(&chunk_id, |(id, _)| *id)
        .ok()
        .map(|i| sources[i].1.clone())
}

// ============================================================================
// Tests
// ============================================================================

//! Retriever - 어휘/벡터 동시 조회 후 통합
//!
//! 두 갈래는 독립 태스크로 실행되며 `try_join`으로 합류합니다.
//! 한쪽이 실패하면 자식 토큰을 취소해 다른 쪽을 멈추고 첫 에러를 돌려줍니다.
//! 하이브리드 모드에서 벡터 쪽이 실패해도 어휘 결과만으로 대체하지 않습니다.
//! MMR을 켜면 통합 결과 후보 풀을 만든 뒤 재순위합니다.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::capsule::Capsule;
use crate::config::SearchConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{RagcapError, Result};
use crate::index::{check_cancelled, ChunkFilter, ScoredChunk};

use super::filter::PathFilter;
use super::hybrid::fuse;
use super::mmr::{rerank, MmrOptions};
use super::{RankedResult, SearchMode};

/// 검색 요청
#[derive(Debug, Clone)]
pub struct RetrievalQuery {
    pub text: String,
    pub top_k: usize,
    pub mode: SearchMode,
    pub filter: Option<PathFilter>,
    /// None이면 재순위 없음
    pub mmr: Option<MmrOptions>,
}

impl RetrievalQuery {
    pub fn new(text: impl Into<String>, top_k: usize, mode: SearchMode) -> Self {
        Self {
            text: text.into(),
            top_k,
            mode,
            filter: None,
            mmr: None,
        }
    }

    pub fn with_filter(mut self, filter: Option<PathFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_mmr(mut self, mmr: Option<MmrOptions>) -> Self {
        self.mmr = mmr;
        self
    }

    /// 통합 단계에서 남길 결과 수
    fn fused_k(&self) -> usize {
        self.mmr
            .map(|m| m.pool_size(self.top_k))
            .unwrap_or(self.top_k)
    }
}

/// 검색 실행
pub async fn retrieve(
    capsule: Arc<Capsule>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: &SearchConfig,
    query: &RetrievalQuery,
    cancel: &CancellationToken,
) -> Result<Vec<RankedResult>> {
    check_cancelled(cancel)?;

    if query.top_k == 0 {
        return Ok(Vec::new());
    }

    let fused_k = query.fused_k();
    let candidates = match query.mode {
        SearchMode::Hybrid => fused_k.saturating_mul(config.candidate_multiplier),
        _ => fused_k,
    };

    let chunk_filter: Option<Arc<ChunkFilter>> = query
        .filter
        .as_ref()
        .map(|f| Arc::new(f.chunk_filter(capsule.chunk_sources())));

    let branch_token = cancel.child_token();

    let lexical = guarded(
        lexical_branch(
            Arc::clone(&capsule),
            query,
            candidates,
            chunk_filter.clone(),
            branch_token.clone(),
        ),
        &branch_token,
    );
    let vector = guarded(
        vector_branch(
            Arc::clone(&capsule),
            embedder,
            query,
            candidates,
            chunk_filter,
            branch_token.clone(),
        ),
        &branch_token,
    );

    let joined = tokio::try_join!(lexical, vector);

    // 호출자 취소가 다른 에러보다 우선
    check_cancelled(cancel)?;
    let (lexical, vector) = joined?;

    let fused = fuse(&lexical, &vector, fused_k, query.mode, config);
    let results = match query.mmr {
        Some(mmr) => {
            let index = capsule.vector();
            let metric = index.metric();
            rerank(fused, query.top_k, mmr.lambda, |a, b| {
                match (index.vector_of(a), index.vector_of(b)) {
                    (Some(x), Some(y)) => metric.similarity(x, y),
                    _ => 0.0,
                }
            })
        }
        None => fused,
    };

    tracing::debug!(
        "Retrieved {} results (mode={}, lexical={}, vector={}, top_k={}, mmr={})",
        results.len(),
        query.mode,
        lexical.len(),
        vector.len(),
        query.top_k,
        query.mmr.is_some()
    );

    Ok(results)
}

/// 실패 시 형제 갈래 취소
async fn guarded<T>(
    branch: impl Future<Output = Result<T>>,
    token: &CancellationToken,
) -> Result<T> {
    let result = branch.await;
    if result.is_err() {
        token.cancel();
    }
    result
}

async fn lexical_branch(
    capsule: Arc<Capsule>,
    query: &RetrievalQuery,
    candidates: usize,
    filter: Option<Arc<ChunkFilter>>,
    cancel: CancellationToken,
) -> Result<Vec<ScoredChunk>> {
    if !query.mode.uses_lexical() {
        return Ok(Vec::new());
    }

    let text = query.text.clone();
    tokio::task::spawn_blocking(move || {
        capsule
            .lexical()
            .query(&text, candidates, filter.as_deref(), &cancel)
    })
    .await?
}

async fn vector_branch(
    capsule: Arc<Capsule>,
    embedder: Arc<dyn EmbeddingProvider>,
    query: &RetrievalQuery,
    candidates: usize,
    filter: Option<Arc<ChunkFilter>>,
    cancel: CancellationToken,
) -> Result<Vec<ScoredChunk>> {
    if !query.mode.uses_vector() || query.text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let embedding = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(RagcapError::Cancelled),
        embedding = embedder.embed(&query.text) => embedding?,
    };

    tokio::task::spawn_blocking(move || {
        capsule
            .vector()
            .query(&embedding, candidates, filter.as_deref(), &cancel)
    })
    .await?
}

// ============================================================================
// Tests
// ============================================================================

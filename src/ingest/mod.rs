//! Ingest - 파일을 읽어 캡슐을 만드는 파이프라인
//!
//! ## 모듈 구조
//! - `collector`: 파일/폴더 수집 (.gitignore 존중)
//! - `loader`: 형식별 본문 추출
//! - `chunker`: 단어 윈도우 청킹
//!
//! 검색 엔진은 캡슐을 읽기만 하며, 쓰기는 이 파이프라인에서만 합니다.

pub mod chunker;
pub mod collector;
pub mod loader;

use std::path::Path;

use serde::Serialize;

use crate::capsule::CapsuleBuilder;
use crate::config::EmbeddingConfig;
use crate::embedding::resolve_embedder;
use crate::error::Result;

pub use chunker::{ChunkConfig, ChunkSpan, Chunker, WordChunker};
pub use collector::{CollectedFile, CollectorConfig, FileCollector, FileType};

/// 빌드 요청
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub model_id: String,
    pub dimension: usize,
    pub chunk: ChunkConfig,
    pub collector: CollectorConfig,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            model_id: crate::embedding::hash::MODEL_ID.to_string(),
            dimension: 256,
            chunk: ChunkConfig::default(),
            collector: CollectorConfig::default(),
        }
    }
}

/// 빌드 결과 요약
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSummary {
    pub sources: usize,
    pub chunks: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

/// `input`(파일 또는 폴더)을 수집해 캡슐에 추가
///
/// 캡슐이 없으면 새로 만들고, 있으면 이어서 씁니다 (같은 URI는 새 버전).
/// 개별 파일의 읽기 실패는 경고 후 건너뛰고, 임베딩/저장 실패는 전체 실패입니다.
pub async fn build_capsule(
    capsule_path: &Path,
    input: &Path,
    options: &BuildOptions,
    embedding: &EmbeddingConfig,
) -> Result<BuildSummary> {
    let chunker = WordChunker::new(options.chunk)?;
    let files = FileCollector::new(options.collector.clone()).collect(input)?;

    let mut builder = if capsule_path.exists() {
        CapsuleBuilder::open(capsule_path)?
    } else {
        CapsuleBuilder::create(capsule_path, &options.model_id, options.dimension)?
    };

    let meta = builder.meta().clone();
    let embedder = resolve_embedder(&meta.embedding_model_id, meta.embedding_dimension, embedding)?;

    let mut summary = BuildSummary::default();

    for (i, file) in files.iter().enumerate() {
        tracing::debug!("[{}/{}] {}", i + 1, files.len(), file.source_uri);

        let content = match loader::load(file).await {
            Ok(content) if content.is_empty() => {
                tracing::warn!("Skipping empty document: {}", file.source_uri);
                summary.skipped += 1;
                continue;
            }
            Ok(content) => content,
            Err(e) => {
                tracing::warn!("Skipping {}: {}", file.source_uri, e);
                summary.skipped += 1;
                continue;
            }
        };

        let outcome = builder
            .add_document(&file.source_uri, &content, &chunker, embedder.as_ref())
            .await?;

        if outcome.unchanged {
            summary.unchanged += 1;
        } else {
            summary.sources += 1;
            summary.chunks += outcome.chunk_count;
        }
    }

    tracing::info!(
        "Built capsule {}: {} sources, {} chunks, {} unchanged, {} skipped",
        capsule_path.display(),
        summary.sources,
        summary.chunks,
        summary.unchanged,
        summary.skipped
    );

    Ok(summary)
}

// ============================================================================
// Tests
// ============================================================================

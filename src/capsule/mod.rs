//! Capsule - 문서 저장소와 검색 인덱스를 묶은 영속 단위
//!
//! ## 모듈 구조
//! - `schema`: SQLite 스키마와 메타데이터
//! - `store`: Document Store (읽기 전용)
//! - `builder`: 캡슐 생성/문서 수집
//! - `diff`: 두 캡슐 비교
//!
//! 캡슐을 열 때 메타데이터와 임베딩 차원을 검증하고 인덱스를 한 번 구축합니다.
//! 이후 `Capsule`은 불변이며, 갱신은 `CapsuleHandle::reload`로 새 스냅샷을 만들어
//! 참조를 교체하는 방식으로만 이루어집니다.

pub mod builder;
pub mod diff;
pub mod schema;
pub mod store;

#[cfg(test)]
pub(crate) mod fixtures;

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{LexicalConfig, VectorConfig};
use crate::embedding;
use crate::error::{RagcapError, Result};
use crate::index::{ChunkId, LexicalIndex, Metric, VectorIndex};

pub use builder::{CapsuleBuilder, IngestOutcome};
pub use diff::{diff, CapsuleDiff};
pub use schema::{CapsuleMeta, SCHEMA_VERSION};
pub use store::{Chunk, ChunkIter, Document, DocumentStore, StoreStats};

// ============================================================================
// Types
// ============================================================================

/// 로드된 캡슐 스냅샷
pub struct Capsule {
    path: PathBuf,
    meta: CapsuleMeta,
    store: DocumentStore,
    lexical: LexicalIndex,
    vector: VectorIndex,
    /// 최신 버전 청크의 source URI (청크 ID 오름차순)
    sources: Vec<(ChunkId, String)>,
}

/// 인덱스 파라미터
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexParams {
    pub lexical: LexicalConfig,
    pub vector: VectorConfig,
}

/// `inspect` 결과
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapsuleInfo {
    pub path: PathBuf,
    pub schema_version: u32,
    pub embedding_model_id: String,
    pub embedding_dimension: usize,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub stats: StoreStats,
}

/// `verify` 결과
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyReport {
    pub info: CapsuleInfo,
    pub indexed_chunks: usize,
    pub indexed_vectors: usize,
    pub vocabulary_size: usize,
    pub metric: Metric,
    pub ann_graph: bool,
}

// ============================================================================
// Capsule
// ============================================================================

impl Capsule {
    /// 캡슐 열기 + 검증 + 인덱스 구축
    pub fn open(path: &Path, params: IndexParams) -> Result<Self> {
        let started = Instant::now();
        let store = DocumentStore::open_read_only(path)?;
        let meta = read_meta(&store)?;

        if !embedding::known_models().contains(&meta.embedding_model_id.as_str()) {
            return Err(RagcapError::incompatible(format!(
                "unknown embedding model '{}'",
                meta.embedding_model_id
            )));
        }

        store.validate(meta.embedding_dimension)?;

        let mut lexical = LexicalIndex::builder(params.lexical);
        let mut vectors = Vec::new();

        for chunk in store.iterate_chunks() {
            let chunk = chunk?;
            lexical.add(chunk.id, &chunk.text);
            if let Some(embedding) = chunk.embedding {
                vectors.push((chunk.id, embedding));
            }
        }

        let lexical = lexical.finish();
        let vector = VectorIndex::build(meta.embedding_dimension, params.vector, vectors)
            .map_err(|e| match e {
                RagcapError::DimensionMismatch { expected, actual } => RagcapError::incompatible(
                    format!("vector index dimension {} does not match capsule dimension {}", actual, expected),
                ),
                other => other,
            })?;

        let sources = store.live_chunk_sources()?;

        tracing::info!(
            "Loaded capsule {} ({} chunks, {} vectors, {} terms) in {:?}",
            path.display(),
            lexical.len(),
            vector.len(),
            lexical.term_count(),
            started.elapsed()
        );

        Ok(Self {
            path: path.to_path_buf(),
            meta,
            store,
            lexical,
            vector,
            sources,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn meta(&self) -> &CapsuleMeta {
        &self.meta
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    pub fn lexical(&self) -> &LexicalIndex {
        &self.lexical
    }

    pub fn vector(&self) -> &VectorIndex {
        &self.vector
    }

    pub fn chunk_sources(&self) -> &[(ChunkId, String)] {
        &self.sources
    }

    pub fn info(&self) -> Result<CapsuleInfo> {
        Ok(CapsuleInfo {
            path: self.path.clone(),
            schema_version: self.meta.schema_version,
            embedding_model_id: self.meta.embedding_model_id.clone(),
            embedding_dimension: self.meta.embedding_dimension,
            created_at: self.meta.created_at,
            stats: self.store.stats()?,
        })
    }
}

/// 메타데이터 읽기 + 스키마 버전 확인
fn read_meta(store: &DocumentStore) -> Result<CapsuleMeta> {
    let meta = {
        let conn = store.lock()?;
        CapsuleMeta::read(&conn)?
    };

    if meta.schema_version != SCHEMA_VERSION {
        return Err(RagcapError::incompatible(format!(
            "schema version {} is not supported (expected {})",
            meta.schema_version, SCHEMA_VERSION
        )));
    }

    Ok(meta)
}

/// 인덱스 구축 없이 캡슐 정보 조회
pub fn inspect(path: &Path) -> Result<CapsuleInfo> {
    let store = DocumentStore::open_read_only(path)?;
    let meta = read_meta(&store)?;

    Ok(CapsuleInfo {
        path: path.to_path_buf(),
        schema_version: meta.schema_version,
        embedding_model_id: meta.embedding_model_id,
        embedding_dimension: meta.embedding_dimension,
        created_at: meta.created_at,
        stats: store.stats()?,
    })
}

/// 전체 검증 (로드와 동일한 검사 + 인덱스 구축)
pub fn verify(path: &Path, params: IndexParams) -> Result<VerifyReport> {
    let capsule = Capsule::open(path, params)?;

    Ok(VerifyReport {
        info: capsule.info()?,
        indexed_chunks: capsule.lexical.len(),
        indexed_vectors: capsule.vector.len(),
        vocabulary_size: capsule.lexical.term_count(),
        metric: capsule.vector.metric(),
        ann_graph: capsule.vector.uses_graph(),
    })
}

// ============================================================================
// CapsuleHandle
// ============================================================================

/// 현재 캡슐 스냅샷 참조
///
/// 조회는 `snapshot()`으로 `Arc`를 복제해 진행 중인 쿼리가 시작 시점의
/// 스냅샷으로 끝나도록 합니다.
pub struct CapsuleHandle {
    path: PathBuf,
    params: IndexParams,
    current: RwLock<Arc<Capsule>>,
}

impl CapsuleHandle {
    pub fn open(path: &Path, params: IndexParams) -> Result<Self> {
        let capsule = Capsule::open(path, params)?;
        Ok(Self {
            path: path.to_path_buf(),
            params,
            current: RwLock::new(Arc::new(capsule)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Result<Arc<Capsule>> {
        self.current
            .read()
            .map(|guard| Arc::clone(&guard))
            .map_err(|e| RagcapError::Internal(format!("capsule handle lock poisoned: {}", e)))
    }

    /// 새 스냅샷을 만들어 교체
    ///
    /// 로드에 실패하면 기존 스냅샷을 유지합니다.
    pub fn reload(&self) -> Result<Arc<Capsule>> {
        let fresh = Arc::new(Capsule::open(&self.path, self.params)?);

        let mut guard = self
            .current
            .write()
            .map_err(|e| RagcapError::Internal(format!("capsule handle lock poisoned: {}", e)))?;
        *guard = Arc::clone(&fresh);

        tracing::info!("Reloaded capsule {}", self.path.display());
        Ok(fresh)
    }
}

// ============================================================================
// Tests
// ============================================================================

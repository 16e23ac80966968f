//! ragcap - RAG 캡슐 엔진
//!
//! 단일 파일 캡슐(SQLite)에 저장된 문서/청크/임베딩 위에
//! BM25 어휘 검색 + HNSW 벡터 검색을 결합한 하이브리드 검색,
//! 검색 기반 답변 생성, 컬럼형 내보내기를 제공합니다.
//!
//! ## 사용법
//! ```rust,ignore
//! let engine = Engine::open(Path::new("kb.ragcap"), Config::load(None)?).await?;
//! let response = engine.search(&SearchRequest::new("cats"), &CancellationToken::new()).await?;
//! ```

pub mod answer;
pub mod api;
pub mod capsule;
pub mod cli;
pub mod config;
pub mod embedding;
pub mod error;
pub mod export;
pub mod index;
pub mod ingest;
pub mod search;

// Re-exports
pub use answer::{Answer, AnswerProvider, AnswerSynthesizer, Citation, Passage, ProviderRegistry};
pub use api::{
    AskRequest, AskResponse, Engine, ExportRequest, ExportResponse, SearchHit, SearchRequest,
    SearchResponse,
};
pub use capsule::{Capsule, CapsuleDiff, CapsuleHandle, CapsuleInfo, CapsuleMeta, DocumentStore, IndexParams};
pub use config::Config;
pub use embedding::{resolve_embedder, EmbeddingProvider, GeminiEmbedding, HashEmbedder};
pub use error::{ErrorKind, ErrorResponse, RagcapError, Result};
pub use export::{export, ExportFormat, Exporter};
pub use index::{ChunkId, LexicalIndex, Metric, VectorIndex};
pub use ingest::{build_capsule, BuildOptions, BuildSummary};
pub use search::{retrieve, MmrOptions, PathFilter, RankedResult, RetrievalQuery, SearchMode};

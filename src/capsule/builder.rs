//! Capsule Builder - 캡슐 생성 및 문서 수집
//!
//! 문서, 청크, 임베딩을 한 트랜잭션으로 저장합니다.
//! 같은 source URI를 다시 넣으면 기존 행을 바꾸지 않고 `version + 1`로 추가합니다.

use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::embedding::EmbeddingProvider;
use crate::error::{RagcapError, Result};
use crate::ingest::chunker::{ChunkSpan, Chunker};

use super::schema::{self, CapsuleMeta, SCHEMA_VERSION};
use super::store::encode_vector;

// ============================================================================
// Types
// ============================================================================

/// 문서 추가 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub document_id: i64,
    pub version: i64,
    pub chunk_count: usize,
    /// 최신 버전과 내용이 같아 건너뜀
    pub unchanged: bool,
}

/// 캡슐 쓰기 핸들
pub struct CapsuleBuilder {
    conn: Connection,
    path: PathBuf,
    meta: CapsuleMeta,
}

// ============================================================================
// CapsuleBuilder
// ============================================================================

impl CapsuleBuilder {
    /// 새 캡슐 생성 (파일이 이미 있으면 실패)
    pub fn create(path: &Path, model_id: &str, dimension: usize) -> Result<Self> {
        if path.exists() {
            return Err(RagcapError::io(
                format!("capsule already exists: {}", path.display()),
                std::io::Error::from(std::io::ErrorKind::AlreadyExists),
            ));
        }
        if dimension == 0 {
            return Err(RagcapError::invalid("embedding dimension must be positive"));
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    RagcapError::io(format!("failed to create {}", parent.display()), e)
                })?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| RagcapError::io(format!("failed to create capsule {}", path.display()), e))?;

        schema::initialize(&conn)?;
        let meta = CapsuleMeta::new(model_id, dimension);
        meta.write(&conn)?;

        tracing::info!(
            "Created capsule {} (model={}, dimension={})",
            path.display(),
            model_id,
            dimension
        );

        Ok(Self {
            conn,
            path: path.to_path_buf(),
            meta,
        })
    }

    /// 기존 캡슐에 이어서 쓰기
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(RagcapError::io(
                format!("capsule not found: {}", path.display()),
                std::io::Error::from(std::io::ErrorKind::NotFound),
            ));
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| RagcapError::io(format!("failed to open capsule {}", path.display()), e))?;

        let meta = CapsuleMeta::read(&conn)?;
        if meta.schema_version != SCHEMA_VERSION {
            return Err(RagcapError::incompatible(format!(
                "schema version {} is not supported (expected {})",
                meta.schema_version, SCHEMA_VERSION
            )));
        }

        Ok(Self {
            conn,
            path: path.to_path_buf(),
            meta,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn meta(&self) -> &CapsuleMeta {
        &self.meta
    }

    /// 문서 청킹 → 임베딩 → 저장
    pub async fn add_document(
        &mut self,
        source_uri: &str,
        content: &str,
        chunker: &dyn Chunker,
        embedder: &dyn EmbeddingProvider,
    ) -> Result<IngestOutcome> {
        if let Some(outcome) = self.unchanged(source_uri, content)? {
            tracing::debug!("Skipping unchanged document: {}", source_uri);
            return Ok(outcome);
        }

        let spans = chunker.split(content);
        let texts: Vec<String> = spans.iter().map(|s| s.text(content).to_string()).collect();

        let embeddings = if texts.is_empty() {
            Vec::new()
        } else {
            embedder.embed_batch(&texts).await?
        };

        self.insert_document(source_uri, content, &spans, Some(&embeddings))
    }

    /// 청크 구간과 임베딩을 직접 지정하여 저장
    ///
    /// `embeddings`가 `Some`이면 청크 수와 같아야 하고 각 길이는 캡슐 차원과 같아야 합니다.
    pub fn insert_document(
        &mut self,
        source_uri: &str,
        content: &str,
        spans: &[ChunkSpan],
        embeddings: Option<&[Vec<f32>]>,
    ) -> Result<IngestOutcome> {
        for span in spans {
            if span.start > span.end
                || span.end > content.len()
                || !content.is_char_boundary(span.start)
                || !content.is_char_boundary(span.end)
            {
                return Err(RagcapError::invalid(format!(
                    "chunk span {}..{} is outside the document",
                    span.start, span.end
                )));
            }
        }

        if let Some(vectors) = embeddings {
            if vectors.len() != spans.len() {
                return Err(RagcapError::invalid(format!(
                    "{} embeddings for {} chunks",
                    vectors.len(),
                    spans.len()
                )));
            }
            let dimension = self.meta.embedding_dimension;
            if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
                return Err(RagcapError::DimensionMismatch {
                    expected: dimension,
                    actual: bad.len(),
                });
            }
        }

        let tx = self.conn.transaction()?;

        let version: i64 = tx.query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM documents WHERE source_uri = ?1",
            params![source_uri],
            |row| row.get(0),
        )?;

        tx.execute(
            "INSERT INTO documents (source_uri, content, content_hash, version, ingested_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                source_uri,
                content,
                content_hash(content),
                version,
                Utc::now().to_rfc3339()
            ],
        )?;
        let document_id = tx.last_insert_rowid();

        {
            let mut insert_chunk = tx.prepare(
                "INSERT INTO chunks (document_id, ordinal, offset_start, offset_end, text)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            let mut insert_embedding = tx.prepare(
                "INSERT INTO embeddings (chunk_id, vector, dimension) VALUES (?1, ?2, ?3)",
            )?;

            for (ordinal, span) in spans.iter().enumerate() {
                insert_chunk.execute(params![
                    document_id,
                    ordinal as i64,
                    span.start as i64,
                    span.end as i64,
                    span.text(content)
                ])?;
                let chunk_id = tx.last_insert_rowid();

                if let Some(vectors) = embeddings {
                    let vector = &vectors[ordinal];
                    insert_embedding.execute(params![
                        chunk_id,
                        encode_vector(vector),
                        vector.len() as i64
                    ])?;
                }
            }
        }

        tx.commit()?;

        tracing::info!(
            "Added document: {} (id={}, version={}, chunks={})",
            source_uri,
            document_id,
            version,
            spans.len()
        );

        Ok(IngestOutcome {
            document_id,
            version,
            chunk_count: spans.len(),
            unchanged: false,
        })
    }

    /// 최신 버전과 해시가 같으면 기존 결과
    fn unchanged(&self, source_uri: &str, content: &str) -> Result<Option<IngestOutcome>> {
        let latest: Option<(i64, i64, String)> = self
            .conn
            .query_row(
                "SELECT id, version, content_hash FROM documents
                 WHERE source_uri = ?1 ORDER BY version DESC LIMIT 1",
                params![source_uri],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((document_id, version, hash)) = latest else {
            return Ok(None);
        };
        if hash != content_hash(content) {
            return Ok(None);
        }

        let chunk_count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM chunks WHERE document_id = ?1",
            params![document_id],
            |row| row.get(0),
        )?;

        Ok(Some(IngestOutcome {
            document_id,
            version,
            chunk_count: chunk_count as usize,
            unchanged: true,
        }))
    }
}

/// SHA-256 hex
pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

// ============================================================================
// Tests
// ============================================================================

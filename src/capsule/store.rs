//! Document Store - 캡슐의 문서/청크 읽기 전용 접근
//!
//! 이 엔진은 캡슐을 읽기만 합니다. 쓰기는 `CapsuleBuilder`에서만 합니다.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::Serialize;

use crate::error::{RagcapError, Result};
use crate::index::ChunkId;

/// 청크 순회 페이지 크기
pub const PAGE_SIZE: usize = 256;

const REQUIRED_TABLES: [&str; 4] = ["meta", "documents", "chunks", "embeddings"];

// ============================================================================
// Types
// ============================================================================

/// 원본 문서 (불변, 재수집 시 새 버전으로 대체)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: i64,
    pub source_uri: String,
    pub content: String,
    pub content_hash: String,
    pub version: i64,
    pub ingested_at: DateTime<Utc>,
}

/// 검색 단위 청크
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: ChunkId,
    pub document_id: i64,
    /// 문서 내 순서 (0-based)
    pub ordinal: i64,
    /// 문서 content의 UTF-8 바이트 오프셋
    pub offset_start: i64,
    pub offset_end: i64,
    pub text: String,
    pub embedding: Option<Vec<f32>>,
}

/// 저장소 통계
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub document_count: usize,
    pub live_document_count: usize,
    pub chunk_count: usize,
    pub live_chunk_count: usize,
    pub embedding_count: usize,
    pub avg_chunk_bytes: f64,
}

// ============================================================================
// DocumentStore
// ============================================================================

/// 캡슐 문서 저장소
#[derive(Clone)]
pub struct DocumentStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

const CHUNK_COLUMNS: &str = "c.id, c.document_id, c.ordinal, c.offset_start, c.offset_end, c.text, e.vector";

impl DocumentStore {
    /// 읽기 전용으로 열기
    ///
    /// 파일이 없으면 `IOError`.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(RagcapError::io(
                format!("capsule not found: {}", path.display()),
                std::io::Error::from(std::io::ErrorKind::NotFound),
            ));
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| RagcapError::io(format!("failed to open capsule {}", path.display()), e))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RagcapError::Internal(format!("capsule connection lock poisoned: {}", e)))
    }

    /// 청크 조회 (버전과 무관하게 모든 청크)
    pub fn get(&self, chunk_id: ChunkId) -> Result<Chunk> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM chunks c LEFT JOIN embeddings e ON e.chunk_id = c.id WHERE c.id = ?1",
            CHUNK_COLUMNS
        );

        conn.query_row(&sql, params![chunk_id], read_chunk_row)
            .optional()?
            .ok_or_else(|| RagcapError::not_found(format!("chunk {}", chunk_id)))?
    }

    /// 문서 조회
    pub fn get_document(&self, doc_id: i64) -> Result<Document> {
        let conn = self.lock()?;

        let row = conn
            .query_row(
                "SELECT id, source_uri, content, content_hash, version, ingested_at
                 FROM documents WHERE id = ?1",
                params![doc_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| RagcapError::not_found(format!("document {}", doc_id)))?;

        let (id, source_uri, content, content_hash, version, ingested_at) = row;
        Ok(Document {
            id,
            source_uri,
            content,
            content_hash,
            version,
            ingested_at: parse_datetime(&ingested_at)?,
        })
    }

    /// 문서의 source URI만 조회
    pub fn document_source(&self, doc_id: i64) -> Result<String> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT source_uri FROM documents WHERE id = ?1",
            params![doc_id],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .ok_or_else(|| RagcapError::not_found(format!("document {}", doc_id)))
    }

    /// 최신 버전 청크 순회 (ID 오름차순, 호출할 때마다 처음부터)
    pub fn iterate_chunks(&self) -> ChunkIter {
        ChunkIter {
            conn: Arc::clone(&self.conn),
            after: None,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    /// 최신 버전 청크의 (청크 ID, source URI) 목록
    pub fn live_chunk_sources(&self) -> Result<Vec<(ChunkId, String)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT c.id, d.source_uri FROM live_chunks c
             JOIN documents d ON d.id = c.document_id
             ORDER BY c.id",
        )?;

        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// 최신 버전 문서의 (source URI, content hash) 목록 (URI 오름차순)
    pub fn live_documents(&self) -> Result<Vec<(String, String)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT d.source_uri, d.content_hash FROM documents d
             WHERE d.version = (
                 SELECT MAX(d2.version) FROM documents d2 WHERE d2.source_uri = d.source_uri
             )
             ORDER BY d.source_uri",
        )?;

        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// meta 테이블 전체 (키 오름차순)
    pub fn meta_entries(&self) -> Result<Vec<(String, String)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT key, value FROM meta ORDER BY key")?;

        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// 저장소 통계
    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.lock()?;
        let count = |sql: &str| -> Result<usize> {
            Ok(conn.query_row(sql, [], |row| row.get::<_, i64>(0))? as usize)
        };

        let avg_chunk_bytes: f64 = conn.query_row(
            "SELECT COALESCE(AVG(LENGTH(CAST(text AS BLOB))), 0.0) FROM live_chunks",
            [],
            |row| row.get(0),
        )?;

        Ok(StoreStats {
            document_count: count("SELECT COUNT(*) FROM documents")?,
            live_document_count: count("SELECT COUNT(DISTINCT source_uri) FROM documents")?,
            chunk_count: count("SELECT COUNT(*) FROM chunks")?,
            live_chunk_count: count("SELECT COUNT(*) FROM live_chunks")?,
            embedding_count: count("SELECT COUNT(*) FROM embeddings")?,
            avg_chunk_bytes,
        })
    }

    /// 구조 검증
    ///
    /// 필수 테이블 누락, 차원이 다른 임베딩, 청크 없는 임베딩, 문서 없는 청크는
    /// 모두 `IncompatibleCapsule`.
    pub fn validate(&self, dimension: usize) -> Result<()> {
        let conn = self.lock()?;

        for table in REQUIRED_TABLES {
            let exists: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1",
                params![table],
                |row| row.get(0),
            )?;
            if exists == 0 {
                return Err(RagcapError::incompatible(format!("table '{}' is missing", table)));
            }
        }

        let live_view: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'view' AND name = 'live_chunks'",
            [],
            |row| row.get(0),
        )?;
        if live_view == 0 {
            return Err(RagcapError::incompatible("view 'live_chunks' is missing"));
        }

        let bad_dimension: Option<(i64, i64, i64)> = conn
            .query_row(
                "SELECT chunk_id, dimension, LENGTH(vector) FROM embeddings
                 WHERE dimension != ?1 OR LENGTH(vector) != ?1 * 4
                 ORDER BY chunk_id LIMIT 1",
                params![dimension as i64],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        if let Some((chunk_id, dim, bytes)) = bad_dimension {
            return Err(RagcapError::incompatible(format!(
                "embedding for chunk {} has dimension {} ({} bytes), capsule declares {}",
                chunk_id, dim, bytes, dimension
            )));
        }

        let orphan: Option<i64> = conn
            .query_row(
                "SELECT e.chunk_id FROM embeddings e
                 LEFT JOIN chunks c ON c.id = e.chunk_id
                 WHERE c.id IS NULL ORDER BY e.chunk_id LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(chunk_id) = orphan {
            return Err(RagcapError::incompatible(format!(
                "embedding references missing chunk {}",
                chunk_id
            )));
        }

        let dangling: Option<i64> = conn
            .query_row(
                "SELECT c.id FROM chunks c
                 LEFT JOIN documents d ON d.id = c.document_id
                 WHERE d.id IS NULL ORDER BY c.id LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(chunk_id) = dangling {
            return Err(RagcapError::incompatible(format!(
                "chunk {} references a missing document",
                chunk_id
            )));
        }

        Ok(())
    }
}

// ============================================================================
// ChunkIter
// ============================================================================

/// 청크 지연 순회기
///
/// `PAGE_SIZE` 단위로 `id > 마지막 ID` 조건 조회를 반복합니다.
/// 에러가 나면 한 번 돌려준 뒤 종료합니다.
pub struct ChunkIter {
    conn: Arc<Mutex<Connection>>,
    after: Option<ChunkId>,
    buffer: VecDeque<Chunk>,
    done: bool,
}

impl ChunkIter {
    fn fetch_page(&mut self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| RagcapError::Internal(format!("capsule connection lock poisoned: {}", e)))?;

        let sql = format!(
            "SELECT {} FROM live_chunks c LEFT JOIN embeddings e ON e.chunk_id = c.id
             WHERE c.id > ?1 ORDER BY c.id LIMIT ?2",
            CHUNK_COLUMNS
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let after = self.after.unwrap_or(i64::MIN);

        let rows = stmt.query_map(params![after, PAGE_SIZE as i64], read_chunk_row)?;
        for row in rows {
            self.buffer.push_back(row??);
        }

        if self.buffer.len() < PAGE_SIZE {
            self.done = true;
        }
        if let Some(last) = self.buffer.back() {
            self.after = Some(last.id);
        }

        Ok(())
    }
}

impl Iterator for ChunkIter {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.done {
            if let Err(e) = self.fetch_page() {
                self.done = true;
                self.buffer.clear();
                return Some(Err(e));
            }
        }

        self.buffer.pop_front().map(Ok)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 청크 행 파싱 (`CHUNK_COLUMNS` 순서)
///
/// 벡터 디코딩 실패는 행 단위 `Result`로 돌려줍니다.
fn read_chunk_row(row: &Row<'_>) -> rusqlite::Result<Result<Chunk>> {
    let id: ChunkId = row.get(0)?;
    let blob: Option<Vec<u8>> = row.get(6)?;

    let embedding = match blob {
        Some(bytes) => match decode_vector(&bytes) {
            Some(v) => Some(v),
            None => {
                return Ok(Err(RagcapError::incompatible(format!(
                    "embedding blob for chunk {} has invalid length {}",
                    id,
                    bytes.len()
                ))))
            }
        },
        None => None,
    };

    Ok(Ok(Chunk {
        id,
        document_id: row.get(1)?,
        ordinal: row.get(2)?,
        offset_start: row.get(3)?,
        offset_end: row.get(4)?,
        text: row.get(5)?,
        embedding,
    }))
}

/// little-endian f32 BLOB → 벡터
pub fn decode_vector(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

/// 벡터 → little-endian f32 BLOB
pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RagcapError::incompatible(format!("invalid timestamp '{}': {}", s, e)))
}

// ============================================================================
// Tests
// ============================================================================

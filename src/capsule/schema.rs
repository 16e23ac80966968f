//! 캡슐 스키마 및 메타데이터
//!
//! 캡슐은 단일 SQLite 파일입니다.
//! - meta: 스키마 버전, 임베딩 차원, 임베딩 모델 ID
//! - documents / chunks / embeddings: 원본 문서와 검색 단위
//! - live_chunks: 소스별 최신 버전 문서의 청크만 노출하는 뷰

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::error::{RagcapError, Result};

/// 현재 스키마 버전
pub const SCHEMA_VERSION: u32 = 1;

const KEY_SCHEMA_VERSION: &str = "schema_version";
const KEY_EMBEDDING_DIMENSION: &str = "embedding_dimension";
const KEY_EMBEDDING_MODEL: &str = "embedding_model_id";
const KEY_CREATED_AT: &str = "created_at";

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS documents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_uri TEXT NOT NULL,
    content TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    ingested_at TEXT NOT NULL,
    UNIQUE (source_uri, version)
);

CREATE TABLE IF NOT EXISTS chunks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    document_id INTEGER NOT NULL REFERENCES documents(id),
    ordinal INTEGER NOT NULL,
    offset_start INTEGER NOT NULL,
    offset_end INTEGER NOT NULL,
    text TEXT NOT NULL,
    UNIQUE (document_id, ordinal)
);

CREATE TABLE IF NOT EXISTS embeddings (
    chunk_id INTEGER PRIMARY KEY REFERENCES chunks(id),
    vector BLOB NOT NULL,
    dimension INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_documents_source ON documents(source_uri, version);
CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id);

CREATE VIEW IF NOT EXISTS live_chunks AS
    SELECT c.* FROM chunks c
    JOIN documents d ON d.id = c.document_id
    WHERE d.version = (
        SELECT MAX(d2.version) FROM documents d2 WHERE d2.source_uri = d.source_uri
    );
"#;

// ============================================================================
// CapsuleMeta
// ============================================================================

/// 캡슐 메타데이터 레코드
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapsuleMeta {
    pub schema_version: u32,
    pub embedding_dimension: usize,
    pub embedding_model_id: String,
    pub created_at: DateTime<Utc>,
}

impl CapsuleMeta {
    pub fn new(embedding_model_id: impl Into<String>, embedding_dimension: usize) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            embedding_dimension,
            embedding_model_id: embedding_model_id.into(),
            created_at: Utc::now(),
        }
    }

    /// meta 테이블에서 읽기
    ///
    /// 테이블이나 키가 없거나 값이 잘못되면 `IncompatibleCapsule`
    pub fn read(conn: &Connection) -> Result<Self> {
        let has_meta: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'meta'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n > 0)?;

        if !has_meta {
            return Err(RagcapError::incompatible("metadata table is missing"));
        }

        let schema_version: u32 = parse_value(conn, KEY_SCHEMA_VERSION)?;
        let embedding_dimension: usize = parse_value(conn, KEY_EMBEDDING_DIMENSION)?;
        let embedding_model_id = read_value(conn, KEY_EMBEDDING_MODEL)?;
        let created_at = read_value(conn, KEY_CREATED_AT)?;

        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                RagcapError::incompatible(format!("invalid created_at '{}': {}", created_at, e))
            })?;

        if embedding_dimension == 0 {
            return Err(RagcapError::incompatible("embedding dimension must be positive"));
        }

        Ok(Self {
            schema_version,
            embedding_dimension,
            embedding_model_id,
            created_at,
        })
    }

    /// meta 테이블에 쓰기
    pub fn write(&self, conn: &Connection) -> Result<()> {
        let entries = [
            (KEY_SCHEMA_VERSION, self.schema_version.to_string()),
            (KEY_EMBEDDING_DIMENSION, self.embedding_dimension.to_string()),
            (KEY_EMBEDDING_MODEL, self.embedding_model_id.clone()),
            (KEY_CREATED_AT, self.created_at.to_rfc3339()),
        ];

        for (key, value) in entries {
            conn.execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
        }

        Ok(())
    }
}

/// 스키마 생성
pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    tracing::debug!("Capsule schema v{} initialized", SCHEMA_VERSION);
    Ok(())
}

fn read_value(conn: &Connection, key: &str) -> Result<String> {
    conn.query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| {
        row.get::<_, String>(0)
    })
    .optional()?
    .ok_or_else(|| RagcapError::incompatible(format!("metadata key '{}' is missing", key)))
}

fn parse_value<T: std::str::FromStr>(conn: &Connection, key: &str) -> Result<T> {
    let raw = read_value(conn, key)?;
    raw.trim().parse().map_err(|_| {
        RagcapError::incompatible(format!("metadata key '{}' has invalid value '{}'", key, raw))
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_meta_roundtrip() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();

        let meta = CapsuleMeta::new("ragcap-hash-v1", 256);
        meta.write(&conn).unwrap();

        let read = CapsuleMeta::read(&conn).unwrap();
        assert_eq!(read.schema_version, SCHEMA_VERSION);
        assert_eq!(read.embedding_dimension, 256);
        assert_eq!(read.embedding_model_id, "ragcap-hash-v1");
    }

    #[test]
    fn test_missing_meta_table() {
        let conn = Connection::open_in_memory().unwrap();
        let err = CapsuleMeta::read(&conn).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IncompatibleCapsule);
    }

    #[test]
    fn test_missing_key() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        conn.execute(
            "INSERT INTO meta (key, value) VALUES ('schema_version', '1')",
            [],
        )
        .unwrap();

        let err = CapsuleMeta::read(&conn).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IncompatibleCapsule);
        assert!(err.to_string().contains("embedding_dimension"));
    }

    #[test]
    fn test_invalid_dimension_value() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        CapsuleMeta::new("ragcap-hash-v1", 8).write(&conn).unwrap();
        conn.execute(
            "UPDATE meta SET value = 'wide' WHERE key = 'embedding_dimension'",
            [],
        )
        .unwrap();

        let err = CapsuleMeta::read(&conn).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IncompatibleCapsule);
    }
}

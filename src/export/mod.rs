//! Capsule Exporter - 청크 스냅샷을 컬럼형 파일로 내보내기
//!
//! ## 모듈 구조
//! - `parquet`: Apache Parquet 단일 파일
//! - `lance`: LanceDB 디렉토리 (`chunks` 테이블)
//! - `faiss`: 원시 벡터 파일 (`i32` 차원, `i64` 개수, `f32` 값, little-endian)
//!
//! 출력은 숨김 임시 경로에 쓴 뒤 이름을 바꿔 목적지에 둡니다.
//! 실패하면 임시 경로를 지우고 기존 목적지는 건드리지 않습니다.

pub mod faiss;
pub mod lance;
pub mod parquet;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use arrow_array::builder::{FixedSizeListBuilder, Float32Builder};
use arrow_array::{ArrayRef, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::capsule::{Capsule, Chunk, ChunkIter, DocumentStore};
use crate::error::{RagcapError, Result};
use crate::index::check_cancelled;

pub use self::faiss::FaissExporter;
pub use self::lance::LanceExporter;
pub use self::parquet::ParquetExporter;

/// RecordBatch 당 행 수
pub const BATCH_ROWS: usize = 1024;

// ============================================================================
// ExportFormat
// ============================================================================

/// 내보내기 형식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Parquet,
    Lance,
    Faiss,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Parquet => "parquet",
            ExportFormat::Lance => "lance",
            ExportFormat::Faiss => "faiss",
        }
    }

    /// 형식별 내보내기 구현
    pub fn exporter(&self) -> Box<dyn Exporter> {
        match self {
            ExportFormat::Parquet => Box::new(ParquetExporter),
            ExportFormat::Lance => Box::new(LanceExporter),
            ExportFormat::Faiss => Box::new(FaissExporter),
        }
    }
}

impl FromStr for ExportFormat {
    type Err = RagcapError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "parquet" => Ok(ExportFormat::Parquet),
            "lance" | "lancedb" => Ok(ExportFormat::Lance),
            "faiss" => Ok(ExportFormat::Faiss),
            _ => Err(RagcapError::UnsupportedFormat(s.to_string())),
        }
    }
}

impl std::fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Exporter Trait
// ============================================================================

/// 형식별 쓰기 구현
///
/// `path`는 항상 아직 존재하지 않는 임시 경로입니다. 쓴 행 수를 돌려줍니다.
#[async_trait]
pub trait Exporter: Send + Sync {
    async fn write(
        &self,
        capsule: Arc<Capsule>,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<usize>;
}

// ============================================================================
// export
// ============================================================================

/// 캡슐을 `destination`에 내보내기
pub async fn export(
    capsule: Arc<Capsule>,
    destination: &Path,
    format: ExportFormat,
    cancel: &CancellationToken,
) -> Result<PathBuf> {
    let exporter = format.exporter();
    export_with(capsule, destination, format, exporter.as_ref(), cancel).await
}

async fn export_with(
    capsule: Arc<Capsule>,
    destination: &Path,
    format: ExportFormat,
    exporter: &dyn Exporter,
    cancel: &CancellationToken,
) -> Result<PathBuf> {
    check_cancelled(cancel)?;

    if destination.as_os_str().is_empty() {
        return Err(RagcapError::invalid("export destination path is empty"));
    }

    let parent = destination
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| RagcapError::io(format!("failed to create {}", parent.display()), e))?;

    let temp = temp_sibling(destination)?;

    tracing::info!(
        "Exporting {} to {} ({})",
        capsule.path().display(),
        destination.display(),
        format
    );

    let written = match exporter.write(Arc::clone(&capsule), &temp, cancel).await {
        Ok(rows) => rows,
        Err(e) => {
            remove_path(&temp).await;
            return Err(e);
        }
    };

    if let Err(e) = replace(&temp, destination).await {
        remove_path(&temp).await;
        return Err(e);
    }

    tracing::info!("Exported {} rows to {}", written, destination.display());

    if let Err(e) = record_export(capsule.path(), format, destination).await {
        tracing::warn!("Failed to update export history: {}", e);
    }

    Ok(destination.to_path_buf())
}

/// `.{name}.{uuid}.tmp` (같은 디렉토리)
fn temp_sibling(destination: &Path) -> Result<PathBuf> {
    let name = destination
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            RagcapError::invalid(format!(
                "invalid export destination: {}",
                destination.display()
            ))
        })?;

    Ok(destination.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4())))
}

/// 임시 출력을 목적지로 이동
///
/// 디렉토리 목적지는 rename으로 덮어쓸 수 없으므로 기존 것을 먼저 옮겨 둡니다.
async fn replace(temp: &Path, destination: &Path) -> Result<()> {
    let backup = if tokio::fs::metadata(destination)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
    {
        let backup = temp_sibling(destination)?;
        tokio::fs::rename(destination, &backup).await.map_err(|e| {
            RagcapError::io(format!("failed to replace {}", destination.display()), e)
        })?;
        Some(backup)
    } else {
        None
    };

    match tokio::fs::rename(temp, destination).await {
        Ok(()) => {
            if let Some(backup) = backup {
                remove_path(&backup).await;
            }
            Ok(())
        }
        Err(e) => match backup {
            Some(backup) => Err(restore_backup(&backup, destination, e).await),
            None => Err(RagcapError::io(
                format!("failed to move export into {}", destination.display()),
                e,
            )),
        },
    }
}

/// 이동 실패 후 기존 목적지 복원
///
/// 복원도 실패하면 기존 내보내기가 남은 백업 경로를 에러 메시지에 포함합니다.
async fn restore_backup(backup: &Path, destination: &Path, cause: std::io::Error) -> RagcapError {
    match tokio::fs::rename(backup, destination).await {
        Ok(()) => RagcapError::io(
            format!("failed to move export into {}", destination.display()),
            cause,
        ),
        Err(restore) => {
            tracing::error!(
                "Failed to restore {} from backup {}: {}",
                destination.display(),
                backup.display(),
                restore
            );
            RagcapError::io(
                format!(
                    "failed to move export into {}; previous export left at {} (restore failed: {})",
                    destination.display(),
                    backup.display(),
                    restore
                ),
                cause,
            )
        }
    }
}

/// 이동 전에 파일 내용을 디스크에 반영
pub(crate) fn sync_file(file: &std::fs::File, path: &Path) -> Result<()> {
    file.sync_all()
        .map_err(|e| RagcapError::io(format!("failed to sync {}", path.display()), e))
}

/// 파일/디렉토리 삭제 (없으면 무시)
async fn remove_path(path: &Path) {
    let result = match tokio::fs::metadata(path).await {
        Ok(m) if m.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(_) => return,
    };
    if let Err(e) = result {
        tracing::warn!("Failed to remove {}: {}", path.display(), e);
    }
}

// ============================================================================
// Arrow rows
// ============================================================================

/// 청크 테이블 스키마
pub fn chunk_schema(dimension: usize) -> Result<SchemaRef> {
    let width = i32::try_from(dimension).map_err(|_| {
        RagcapError::incompatible(format!("embedding dimension {} is too large", dimension))
    })?;

    Ok(Arc::new(Schema::new(vec![
        Field::new("chunk_id", DataType::Int64, false),
        Field::new("document_id", DataType::Int64, false),
        Field::new("text", DataType::Utf8, false),
        Field::new("offset_start", DataType::Int64, false),
        Field::new("offset_end", DataType::Int64, false),
        Field::new(
            "embedding",
            DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), width),
            true,
        ),
        Field::new("document_source_uri", DataType::Utf8, false),
    ])))
}

/// 최신 청크를 `BATCH_ROWS` 단위 RecordBatch로 변환하는 순회기
pub struct ChunkBatches<'a> {
    store: &'a DocumentStore,
    chunks: ChunkIter,
    schema: SchemaRef,
    dimension: usize,
    /// document_id → source URI
    sources: HashMap<i64, String>,
    cancel: CancellationToken,
}

impl<'a> ChunkBatches<'a> {
    pub fn new(capsule: &'a Capsule, cancel: &CancellationToken) -> Result<Self> {
        let dimension = capsule.meta().embedding_dimension;
        Ok(Self {
            store: capsule.store(),
            chunks: capsule.store().iterate_chunks(),
            schema: chunk_schema(dimension)?,
            dimension,
            sources: HashMap::new(),
            cancel: cancel.clone(),
        })
    }

    pub fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn source_of(&mut self, document_id: i64) -> Result<String> {
        if let Some(uri) = self.sources.get(&document_id) {
            return Ok(uri.clone());
        }
        let uri = self.store.document_source(document_id)?;
        self.sources.insert(document_id, uri.clone());
        Ok(uri)
    }

    fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        check_cancelled(&self.cancel)?;

        let mut rows: Vec<Chunk> = Vec::with_capacity(BATCH_ROWS);
        while rows.len() < BATCH_ROWS {
            match self.chunks.next() {
                Some(chunk) => rows.push(chunk?),
                None => break,
            }
        }
        if rows.is_empty() {
            return Ok(None);
        }

        let mut uris = Vec::with_capacity(rows.len());
        for chunk in &rows {
            uris.push(self.source_of(chunk.document_id)?);
        }

        let width = self.dimension as i32;
        let mut embeddings = FixedSizeListBuilder::with_capacity(
            Float32Builder::with_capacity(rows.len() * self.dimension),
            width,
            rows.len(),
        );
        for chunk in &rows {
            match &chunk.embedding {
                Some(vector) if vector.len() == self.dimension => {
                    embeddings.values().append_slice(vector);
                    embeddings.append(true);
                }
                Some(vector) => {
                    return Err(RagcapError::DimensionMismatch {
                        expected: self.dimension,
                        actual: vector.len(),
                    })
                }
                None => {
                    embeddings.values().append_nulls(self.dimension);
                    embeddings.append(false);
                }
            }
        }

        let columns: Vec<ArrayRef> = vec![
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|c| c.id))),
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|c| c.document_id))),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|c| c.text.as_str()))),
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|c| c.offset_start))),
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|c| c.offset_end))),
            Arc::new(embeddings.finish()),
            Arc::new(StringArray::from_iter_values(uris.iter())),
        ];

        RecordBatch::try_new(self.schema(), columns)
            .map(Some)
            .map_err(|e| RagcapError::Internal(format!("failed to build record batch: {}", e)))
    }
}

impl Iterator for ChunkBatches<'_> {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().transpose()
    }
}

// ============================================================================
// Export history
// ============================================================================

/// 내보내기 기록
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRecord {
    pub format: ExportFormat,
    pub file_path: PathBuf,
    pub timestamp: DateTime<Utc>,
}

/// `<capsule>.manifest.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportManifest {
    #[serde(default)]
    pub exports: Vec<ExportRecord>,
}

/// 캡슐 옆 매니페스트 경로
pub fn manifest_path(capsule_path: &Path) -> PathBuf {
    let mut name = capsule_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".manifest.json");
    capsule_path.with_file_name(name)
}

/// 내보내기 기록 읽기 (없으면 빈 목록)
pub async fn read_history(capsule_path: &Path) -> Result<Vec<ExportRecord>> {
    let path = manifest_path(capsule_path);
    match tokio::fs::read_to_string(&path).await {
        Ok(text) => serde_json::from_str::<ExportManifest>(&text)
            .map(|m| m.exports)
            .map_err(|e| RagcapError::io(format!("invalid export manifest {}", path.display()), e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(RagcapError::io(format!("failed to read {}", path.display()), e)),
    }
}

async fn record_export(capsule_path: &Path, format: ExportFormat, destination: &Path) -> Result<()> {
    let mut exports = read_history(capsule_path).await?;
    let file_path = std::path::absolute(destination).unwrap_or_else(|_| destination.to_path_buf());
    exports.push(ExportRecord {
        format,
        file_path,
        timestamp: Utc::now(),
    });

    let json = serde_json::to_string_pretty(&ExportManifest { exports })
        .map_err(|e| RagcapError::Internal(format!("failed to serialize export manifest: {}", e)))?;

    let path = manifest_path(capsule_path);
    let temp = temp_sibling(&path)?;
    tokio::fs::write(&temp, json)
        .await
        .map_err(|e| RagcapError::io(format!("failed to write {}", temp.display()), e))?;
    if let Err(e) = tokio::fs::rename(&temp, &path).await {
        remove_path(&temp).await;
        return Err(RagcapError::io(format!("failed to write {}", path.display()), e));
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

//! 원시 벡터 내보내기
//!
//! 레이아웃 (little-endian):
//! `i32 dimension` | `i64 count` | `f32 × dimension × count`
//!
//! 임베딩이 있는 최신 청크만 청크 ID 오름차순으로 씁니다.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::capsule::Capsule;
use crate::error::{RagcapError, Result};
use crate::index::check_cancelled;

use super::{sync_file, Exporter, BATCH_ROWS};

/// 헤더 중 개수 필드 위치
const COUNT_OFFSET: u64 = 4;

#[derive(Debug, Clone, Copy, Default)]
pub struct FaissExporter;

impl FaissExporter {
    fn write_blocking(capsule: &Capsule, path: &Path, cancel: &CancellationToken) -> Result<usize> {
        let dimension = capsule.meta().embedding_dimension;
        let header = i32::try_from(dimension).map_err(|_| {
            RagcapError::incompatible(format!("embedding dimension {} is too large", dimension))
        })?;

        let file = File::create_new(path)
            .map_err(|e| RagcapError::io(format!("failed to create {}", path.display()), e))?;
        let mut out = BufWriter::new(file);

        out.write_all(&header.to_le_bytes())?;
        out.write_all(&0i64.to_le_bytes())?;

        let mut count: i64 = 0;
        for (i, chunk) in capsule.store().iterate_chunks().enumerate() {
            if i % BATCH_ROWS == 0 {
                check_cancelled(cancel)?;
            }

            let chunk = chunk?;
            let Some(vector) = chunk.embedding else {
                continue;
            };
            if vector.len() != dimension {
                return Err(RagcapError::DimensionMismatch {
                    expected: dimension,
                    actual: vector.len(),
                });
            }

            for value in &vector {
                out.write_all(&value.to_le_bytes())?;
            }
            count += 1;
        }

        out.seek(SeekFrom::Start(COUNT_OFFSET))?;
        out.write_all(&count.to_le_bytes())?;
        let file = out.into_inner().map_err(|e| {
            RagcapError::io(format!("failed to flush {}", path.display()), e.into_error())
        })?;
        sync_file(&file, path)?;

        tracing::debug!("Wrote {} raw vectors to {}", count, path.display());
        Ok(count as usize)
    }
}

#[async_trait]
impl Exporter for FaissExporter {
    async fn write(
        &self,
        capsule: Arc<Capsule>,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let path = path.to_path_buf();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || Self::write_blocking(&capsule, &path, &cancel)).await?
    }
}

// ============================================================================
// Tests
// ============================================================================

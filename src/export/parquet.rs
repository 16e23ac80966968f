//! Parquet 내보내기
//!
//! 같은 캡슐을 두 번 내보내면 바이트 단위로 같은 파일이 나옵니다.
//! (타임스탬프 등 가변 메타데이터를 쓰지 않음)

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use ::parquet::arrow::ArrowWriter;
use ::parquet::basic::Compression;
use ::parquet::file::properties::WriterProperties;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::capsule::Capsule;
use crate::error::{RagcapError, Result};

use super::{sync_file, ChunkBatches, Exporter, BATCH_ROWS};

/// Apache Parquet 단일 파일
#[derive(Debug, Clone, Copy, Default)]
pub struct ParquetExporter;

impl ParquetExporter {
    fn properties() -> WriterProperties {
        WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .set_max_row_group_size(BATCH_ROWS * 64)
            .build()
    }

    /// 동기 쓰기 (blocking 풀에서 실행)
    fn write_blocking(capsule: &Capsule, path: &Path, cancel: &CancellationToken) -> Result<usize> {
        let batches = ChunkBatches::new(capsule, cancel)?;
        let file = File::create_new(path)
            .map_err(|e| RagcapError::io(format!("failed to create {}", path.display()), e))?;

        let mut writer = ArrowWriter::try_new(file, batches.schema(), Some(Self::properties()))
            .map_err(|e| RagcapError::io("failed to start parquet writer", e))?;

        let mut rows = 0;
        for batch in batches {
            let batch = batch?;
            rows += batch.num_rows();
            writer
                .write(&batch)
                .map_err(|e| RagcapError::io("failed to write parquet row group", e))?;
        }

        let file = writer
            .into_inner()
            .map_err(|e| RagcapError::io("failed to finish parquet file", e))?;
        sync_file(&file, path)?;

        tracing::debug!("Wrote {} parquet rows to {}", rows, path.display());
        Ok(rows)
    }
}

#[async_trait]
impl Exporter for ParquetExporter {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capsule::{fixtures, IndexParams};
    use crate::export::{export, ExportFormat};
    use ::parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use arrow_array::{Array, FixedSizeListArray, Int64Array, StringArray};
    use std::collections::BTreeSet;

    fn read_back(path: &Path) -> Vec<arrow_array::RecordBatch> {
        let file = File::open(path).unwrap();
        ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap()
    }

    #[tokio::test]
    async fn test_round_trip_chunk_ids() {
        let (dir, path) = fixtures::scenario_capsule();
        let capsule = Arc::new(Capsule::open(&path, IndexParams::default()).unwrap());
        let destination = dir.path().join("snapshot.parquet");

        export(Arc::clone(&capsule), &destination, ExportFormat::Parquet, &CancellationToken::new())
            .await
            .unwrap();

        let batches = read_back(&destination);
        let mut ids = BTreeSet::new();
        let mut uris = Vec::new();
        for batch in &batches {
            let chunk_ids = batch
                .column_by_name("chunk_id")
                .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
                .unwrap();
            ids.extend(chunk_ids.values().iter().copied());

            let sources = batch
                .column_by_name("document_source_uri")
                .and_then(|c| c.as_any().downcast_ref::<StringArray>())
                .unwrap();
            uris.extend((0..sources.len()).map(|i| sources.value(i).to_string()));

            let embeddings = batch
                .column_by_name("embedding")
                .and_then(|c| c.as_any().downcast_ref::<FixedSizeListArray>())
                .unwrap();
            assert_eq!(embeddings.value_length(), fixtures::SCENARIO_DIMENSION as i32);
            assert_eq!(embeddings.null_count(), 0);
        }

        let expected: BTreeSet<i64> = capsule
            .store()
            .iterate_chunks()
            .map(|c| c.unwrap().id)
            .collect();
        assert_eq!(ids, expected);
        assert_eq!(uris, vec!["docs/a.txt", "docs/b.txt", "notes/c.md"]);
    }

    #[tokio::test]
    async fn test_reexport_is_byte_identical() {
        let (dir, path) = fixtures::scenario_capsule();
        let capsule = Arc::new(Capsule::open(&path, IndexParams::default()).unwrap());
        let first = dir.path().join("first.parquet");
        let second = dir.path().join("second.parquet");

        for destination in [&first, &second] {
            export(Arc::clone(&capsule), destination, ExportFormat::Parquet, &CancellationToken::new())
                .await
                .unwrap();
        }

        assert_eq!(std::fs::read(&first).unwrap(), std::fs::read(&second).unwrap());
    }

    #[tokio::test]
    async fn test_overwrites_existing_destination() {
        let (dir, path) = fixtures::many_chunk_capsule(30);
        let capsule = Arc::new(Capsule::open(&path, IndexParams::default()).unwrap());
        let destination = dir.path().join("snapshot.parquet");
        std::fs::write(&destination, b"stale").unwrap();

        export(capsule, &destination, ExportFormat::Parquet, &CancellationToken::new())
            .await
            .unwrap();

        let rows: usize = read_back(&destination).iter().map(|b| b.num_rows()).sum();
        assert_eq!(rows, 30);
    }

    #[test]
    fn test_blocking_write_is_readable_on_return() {
        let (dir, path) = fixtures::scenario_capsule();
        let capsule = Capsule::open(&path, IndexParams::default()).unwrap();
        let destination = dir.path().join("direct.parquet");

        let rows =
            ParquetExporter::write_blocking(&capsule, &destination, &CancellationToken::new()).unwrap();
        assert_eq!(rows, 3);

        let total: usize = read_back(&destination).iter().map(|b| b.num_rows()).sum();
        assert_eq!(total, 3);
    }
}

//! LanceDB 내보내기 - `chunks` 테이블 하나를 가진 디렉토리
//!
//! ref: https://lancedb.github.io/lancedb/

use std::path::Path;
use std::sync::Arc;

use arrow_array::{RecordBatch, RecordBatchIterator};
use async_trait::async_trait;
use lancedb::connection::Connection;
use tokio_util::sync::CancellationToken;

use crate::capsule::Capsule;
use crate::error::{RagcapError, Result};

use super::{ChunkBatches, Exporter};

/// 테이블 이름
pub const TABLE_NAME: &str = "chunks";

/// LanceDB 디렉토리
#[derive(Debug, Clone, Copy, Default)]
pub struct LanceExporter;

impl LanceExporter {
    async fn connect(path: &Path) -> Result<Connection> {
        let path_str = path
            .to_str()
            .ok_or_else(|| RagcapError::invalid(format!("invalid path encoding: {}", path.display())))?;

        lancedb::connect(path_str)
            .execute()
            .await
            .map_err(|e| RagcapError::io(format!("failed to open LanceDB at {}", path.display()), e))
    }

    async fn append(db: &Connection, created: bool, batch: RecordBatch) -> Result<()> {
        let schema = batch.schema();
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);

        if created {
            let table = db
                .open_table(TABLE_NAME)
                .execute()
                .await
                .map_err(|e| RagcapError::io("failed to open LanceDB table", e))?;
            table
                .add(batches)
                .execute()
                .await
                .map_err(|e| RagcapError::io("failed to append to LanceDB table", e))?;
        } else {
            db.create_table(TABLE_NAME, batches)
                .execute()
                .await
                .map_err(|e| RagcapError::io("failed to create LanceDB table", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Exporter for LanceExporter {
    async fn write(
        &self,
        capsule: Arc<Capsule>,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let db = Self::connect(path).await?;
        let batches = ChunkBatches::new(&capsule, cancel)?;
        let schema = batches.schema();

        let mut rows = 0;
        let mut created = false;
        for batch in batches {
            let batch = batch?;
            rows += batch.num_rows();
            Self::append(&db, created, batch).await?;
            created = true;
        }

        if !created {
            db.create_empty_table(TABLE_NAME, schema)
                .execute()
                .await
                .map_err(|e| RagcapError::io("failed to create LanceDB table", e))?;
        }

        tracing::debug!("Wrote {} rows to LanceDB table {}", rows, TABLE_NAME);
        Ok(rows)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capsule::{fixtures, IndexParams};
    use crate::export::{export, ExportFormat, BATCH_ROWS};

    #[tokio::test]
    async fn test_lance_export() {
        let (dir, path) = fixtures::many_chunk_capsule(BATCH_ROWS + 5);
        let capsule = Arc::new(Capsule::open(&path, IndexParams::default()).unwrap());
        let destination = dir.path().join("snapshot.lance");

        export(capsule, &destination, ExportFormat::Lance, &CancellationToken::new())
            .await
            .unwrap();
        assert!(destination.is_dir());

        let db = LanceExporter::connect(&destination).await.unwrap();
        let table = db.open_table(TABLE_NAME).execute().await.unwrap();
        assert_eq!(table.count_rows(None).await.unwrap(), BATCH_ROWS + 5);
    }

    #[tokio::test]
    async fn test_lance_replaces_previous_export() {
        let (dir, path) = fixtures::scenario_capsule();
        let capsule = Arc::new(Capsule::open(&path, IndexParams::default()).unwrap());
        let destination = dir.path().join("snapshot.lance");

        for _ in 0..2 {
            export(Arc::clone(&capsule), &destination, ExportFormat::Lance, &CancellationToken::new())
                .await
                .unwrap();
        }

        let db = LanceExporter::connect(&destination).await.unwrap();
        let table = db.open_table(TABLE_NAME).execute().await.unwrap();
        assert_eq!(table.count_rows(None).await.unwrap(), 3);
    }
}

//! Capsule Diff - 두 캡슐 비교
//!
//! 인덱스를 만들지 않고 저장소만 읽습니다.
//! 문서는 최신 버전끼리 source URI로 짝을 짓고 content hash로 변경을 판단합니다.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use crate::error::Result;

use super::{read_meta, DocumentStore, StoreStats};

/// (A, B) 값 쌍
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pair<T> {
    pub a: T,
    pub b: T,
}

impl<T: PartialEq> Pair<T> {
    pub fn changed(&self) -> bool {
        self.a != self.b
    }
}

/// 값이 다른 meta 키 (한쪽에만 있으면 다른 쪽은 None)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetaChange {
    pub key: String,
    pub a: Option<String>,
    pub b: Option<String>,
}

/// 비교 결과
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapsuleDiff {
    pub meta: Vec<MetaChange>,
    /// B에만 있는 source URI
    pub added_sources: Vec<String>,
    /// A에만 있는 source URI
    pub removed_sources: Vec<String>,
    /// 양쪽에 있지만 내용이 다른 source URI
    pub modified_sources: Vec<String>,
    pub chunk_count: Pair<usize>,
    pub avg_chunk_bytes: Pair<f64>,
    pub embedding_dimension: Pair<usize>,
}

impl CapsuleDiff {
    /// 내용상 차이 없음 (meta는 생성 시각이 달라도 무시)
    pub fn is_identical(&self) -> bool {
        self.added_sources.is_empty()
            && self.removed_sources.is_empty()
            && self.modified_sources.is_empty()
            && !self.chunk_count.changed()
            && !self.embedding_dimension.changed()
    }
}

/// 캡슐 한쪽 요약
struct Side {
    meta: BTreeMap<String, String>,
    sources: BTreeMap<String, String>,
    stats: StoreStats,
    dimension: usize,
}

impl Side {
    fn load(path: &Path) -> Result<Self> {
        let store = DocumentStore::open_read_only(path)?;
        let meta = read_meta(&store)?;

        Ok(Self {
            meta: store.meta_entries()?.into_iter().collect(),
            sources: store.live_documents()?.into_iter().collect(),
            stats: store.stats()?,
            dimension: meta.embedding_dimension,
        })
    }
}

/// 두 캡슐 비교
pub fn diff(a: &Path, b: &Path) -> Result<CapsuleDiff> {
    let left = Side::load(a)?;
    let right = Side::load(b)?;

    let mut keys: Vec<&String> = left.meta.keys().chain(right.meta.keys()).collect();
    keys.sort();
    keys.dedup();

    let meta = keys
        .into_iter()
        .filter_map(|key| {
            let (va, vb) = (left.meta.get(key), right.meta.get(key));
            (va != vb).then(|| MetaChange {
                key: key.clone(),
                a: va.cloned(),
                b: vb.cloned(),
            })
        })
        .collect();

    let added_sources = right
        .sources
        .keys()
        .filter(|uri| !left.sources.contains_key(*uri))
        .cloned()
        .collect();
    let removed_sources = left
        .sources
        .keys()
        .filter(|uri| !right.sources.contains_key(*uri))
        .cloned()
        .collect();
    let modified_sources = left
        .sources
        .iter()
        .filter(|(uri, hash)| right.sources.get(*uri).is_some_and(|h| h != *hash))
        .map(|(uri, _)| uri.clone())
        .collect();

    let result = CapsuleDiff {
        meta,
        added_sources,
        removed_sources,
        modified_sources,
        chunk_count: Pair {
            a: left.stats.live_chunk_count,
            b: right.stats.live_chunk_count,
        },
        avg_chunk_bytes: Pair {
            a: left.stats.avg_chunk_bytes,
            b: right.stats.avg_chunk_bytes,
        },
        embedding_dimension: Pair {
            a: left.dimension,
            b: right.dimension,
        },
    };

    tracing::debug!(
        "Diffed {} and {}: +{} -{} ~{} sources",
        a.display(),
        b.display(),
        result.added_sources.len(),
        result.removed_sources.len(),
        result.modified_sources.len()
    );

    Ok(result)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capsule::fixtures;
    use crate::error::ErrorKind;

    #[test]
    fn test_source_changes() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = dir.path().join("a.ragcap");
        let b = dir.path().join("b.ragcap");
        fixtures::write_capsule(
            &a,
            8,
            &[("keep.txt", "same text"), ("edit.txt", "old body"), ("drop.txt", "gone soon")],
        );
        fixtures::write_capsule(
            &b,
            8,
            &[("keep.txt", "same text"), ("edit.txt", "new body here"), ("new.txt", "fresh")],
        );

        let result = diff(&a, &b).unwrap();
        assert_eq!(result.added_sources, vec!["new.txt"]);
        assert_eq!(result.removed_sources, vec!["drop.txt"]);
        assert_eq!(result.modified_sources, vec!["edit.txt"]);
        assert_eq!(result.chunk_count, Pair { a: 3, b: 3 });
        assert!(result.avg_chunk_bytes.changed());
        assert!(!result.embedding_dimension.changed());
        assert!(!result.is_identical());
    }

    #[test]
    fn test_same_content_is_identical() {
        let (_dir, path) = fixtures::scenario_capsule();
        let result = diff(&path, &path).unwrap();

        assert!(result.is_identical());
        assert!(result.meta.is_empty());
        assert_eq!(result.chunk_count.a, 3);
    }

    #[test]
    fn test_meta_and_dimension_changes() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = dir.path().join("a.ragcap");
        let b = dir.path().join("b.ragcap");
        fixtures::write_capsule(&a, 8, &[("doc.txt", "body")]);
        fixtures::write_capsule(&b, 16, &[("doc.txt", "body")]);

        let result = diff(&a, &b).unwrap();
        assert_eq!(result.embedding_dimension, Pair { a: 8, b: 16 });
        assert!(result.modified_sources.is_empty());

        let change = result
            .meta
            .iter()
            .find(|m| m.key == "embedding_dimension")
            .unwrap();
        assert_eq!(change.a.as_deref(), Some("8"));
        assert_eq!(change.b.as_deref(), Some("16"));
        assert!(!result.is_identical());
    }

    #[test]
    fn test_reingested_source_is_modified() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = dir.path().join("a.ragcap");
        fixtures::write_capsule(&a, 8, &[("doc.txt", "old text")]);
        let (_versions, b) = fixtures::reingested_capsule();

        let result = diff(&a, &b).unwrap();
        assert_eq!(result.modified_sources, vec!["doc.txt"]);
        assert_eq!(result.chunk_count, Pair { a: 1, b: 1 });
    }

    #[test]
    fn test_json_shape() {
        let (_dir, path) = fixtures::scenario_capsule();
        let json = serde_json::to_value(diff(&path, &path).unwrap()).unwrap();

        assert!(json["addedSources"].as_array().unwrap().is_empty());
        assert_eq!(json["chunkCount"]["a"], 3);
        assert!(json.get("embeddingDimension").is_some());
    }

    #[test]
    fn test_missing_capsule() {
        let (_dir, path) = fixtures::scenario_capsule();
        let err = diff(&path, Path::new("/nonexistent/b.ragcap")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IoError);
    }
}

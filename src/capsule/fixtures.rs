//! 테스트용 소형 캡슐

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::embedding::HashEmbedder;
use crate::ingest::chunker::{ChunkConfig, Chunker, WordChunker};

use super::builder::CapsuleBuilder;

pub const SCENARIO_DIMENSION: usize = 256;
pub const HASH_MODEL: &str = "ragcap-hash-v1";

/// 문서 하나당 청크 하나로 캡슐 생성
pub fn write_capsule(path: &Path, dimension: usize, docs: &[(&str, &str)]) {
    let mut builder = CapsuleBuilder::create(path, HASH_MODEL, dimension).unwrap();
    let embedder = HashEmbedder::new(dimension).unwrap();

    for (uri, content) in docs {
        let chunker = WordChunker::new(ChunkConfig {
            chunk_words: 10_000,
            overlap_words: 0,
        })
        .unwrap();
        let spans = chunker.split(content);
        let vectors: Vec<Vec<f32>> = spans
            .iter()
            .map(|s| embedder.embed_text(s.text(content)))
            .collect();
        builder
            .insert_document(uri, content, &spans, Some(&vectors))
            .unwrap();
    }
}

/// 문서 하나당 청크 하나, 벡터 직접 지정
pub fn write_vectors(path: &Path, docs: &[(&str, &str, Vec<f32>)]) {
    let dimension = docs.first().map(|(_, _, v)| v.len()).unwrap_or(3);
    let mut builder = CapsuleBuilder::create(path, HASH_MODEL, dimension).unwrap();
    let chunker = WordChunker::new(ChunkConfig {
        chunk_words: 10_000,
        overlap_words: 0,
    })
    .unwrap();

    for (uri, content, vector) in docs {
        let spans = chunker.split(content);
        let vectors = vec![vector.clone(); spans.len()];
        builder
            .insert_document(uri, content, &spans, Some(&vectors))
            .unwrap();
    }
}

/// A "cats are mammals", B "dogs are mammals", C "rockets use fuel"
///
/// 청크 ID는 순서대로 1, 2, 3
pub fn scenario_capsule() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("scenario.ragcap");
    write_capsule(
        &path,
        SCENARIO_DIMENSION,
        &[
            ("docs/a.txt", "cats are mammals"),
            ("docs/b.txt", "dogs are mammals"),
            ("notes/c.md", "rockets use fuel"),
        ],
    );
    (dir, path)
}

/// 단어 하나짜리 청크 `n`개
pub fn many_chunk_capsule(n: usize) -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("many.ragcap");

    let content: String = (0..n).map(|i| format!("word{} ", i)).collect();
    let mut builder = CapsuleBuilder::create(&path, HASH_MODEL, 8).unwrap();
    let embedder = HashEmbedder::new(8).unwrap();
    let chunker = WordChunker::new(ChunkConfig {
        chunk_words: 1,
        overlap_words: 0,
    })
    .unwrap();

    let spans = chunker.split(&content);
    let vectors: Vec<Vec<f32>> = spans
        .iter()
        .map(|s| embedder.embed_text(s.text(&content)))
        .collect();
    builder
        .insert_document("bulk.txt", &content, &spans, Some(&vectors))
        .unwrap();

    (dir, path)
}

/// 같은 URI를 두 번 수집 ("old text" → "new text")
pub fn reingested_capsule() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("versions.ragcap");
    write_capsule(
        &path,
        8,
        &[("doc.txt", "old text"), ("doc.txt", "new text")],
    );
    (dir, path)
}

//! Lexical Index - 메모리 BM25 역색인
//!
//! 토큰은 유니코드 단어(`\w+`)를 소문자로 변환한 것입니다.
//! 스테밍/불용어 처리는 하지 않습니다.
//!
//! ref: https://en.wikipedia.org/wiki/Okapi_BM25

use std::collections::{HashMap, HashSet};

use tokio_util::sync::CancellationToken;

use crate::config::LexicalConfig;
use crate::error::Result;

use super::{check_cancelled, rank_desc, ChunkFilter, ChunkId, ScoredChunk};

/// 취소 확인 주기 (posting 단위)
const CANCEL_CHECK_INTERVAL: usize = 1024;

// ============================================================================
// Types
// ============================================================================

/// posting 한 건 (청크 ID, 출현 빈도)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Posting {
    pub chunk_id: ChunkId,
    pub term_frequency: u32,
}

/// BM25 역색인
#[derive(Debug)]
pub struct LexicalIndex {
    postings: HashMap<String, Vec<Posting>>,
    doc_lengths: HashMap<ChunkId, u32>,
    avg_doc_length: f64,
    params: LexicalConfig,
}

/// 역색인 빌더
#[derive(Debug)]
pub struct LexicalIndexBuilder {
    postings: HashMap<String, Vec<Posting>>,
    doc_lengths: HashMap<ChunkId, u32>,
    total_tokens: u64,
    params: LexicalConfig,
}

impl LexicalIndexBuilder {
    /// 청크 하나를 색인
    ///
    /// 같은 ID를 두 번 넣으면 두 번째는 무시됩니다.
    pub fn add(&mut self, chunk_id: ChunkId, text: &str) {
        if self.doc_lengths.contains_key(&chunk_id) {
            return;
        }

        let tokens = tokenize(text);
        self.total_tokens += tokens.len() as u64;
        self.doc_lengths.insert(chunk_id, tokens.len() as u32);

        let mut counts: HashMap<String, u32> = HashMap::new();
        for token in tokens {
            *counts.entry(token).or_insert(0) += 1;
        }

        for (term, term_frequency) in counts {
            self.postings.entry(term).or_default().push(Posting {
                chunk_id,
                term_frequency,
            });
        }
    }

    pub fn finish(mut self) -> LexicalIndex {
        for list in self.postings.values_mut() {
            list.sort_by_key(|p| p.chunk_id);
        }

        let avg_doc_length = if self.doc_lengths.is_empty() {
            0.0
        } else {
            self.total_tokens as f64 / self.doc_lengths.len() as f64
        };

        LexicalIndex {
            postings: self.postings,
            doc_lengths: self.doc_lengths,
            avg_doc_length,
            params: self.params,
        }
    }
}

// ============================================================================
// LexicalIndex
// ============================================================================

impl LexicalIndex {
    pub fn builder(params: LexicalConfig) -> LexicalIndexBuilder {
        LexicalIndexBuilder {
            postings: HashMap::new(),
            doc_lengths: HashMap::new(),
            total_tokens: 0,
            params,
        }
    }

    /// (청크 ID, 텍스트) 목록에서 바로 구축
    pub fn build<'a>(
        params: LexicalConfig,
        chunks: impl IntoIterator<Item = (ChunkId, &'a str)>,
    ) -> Self {
        let mut builder = Self::builder(params);
        for (id, text) in chunks {
            builder.add(id, text);
        }
        builder.finish()
    }

    /// 색인된 청크 수
    pub fn len(&self) -> usize {
        self.doc_lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_lengths.is_empty()
    }

    /// 고유 용어 수
    pub fn term_count(&self) -> usize {
        self.postings.len()
    }

    /// 특정 용어의 posting 목록
    pub fn postings(&self, term: &str) -> &[Posting] {
        self.postings.get(term).map(Vec::as_slice).unwrap_or(&[])
    }

    /// BM25 검색
    ///
    /// 빈 쿼리, `top_k = 0`, 일치 용어 없음은 모두 빈 결과입니다.
    pub fn query(
        &self,
        text: &str,
        top_k: usize,
        filter: Option<&ChunkFilter>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ScoredChunk>> {
        if top_k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let mut seen = HashSet::new();
        let terms: Vec<String> = tokenize(text)
            .into_iter()
            .filter(|t| seen.insert(t.clone()))
            .collect();

        let n_docs = self.doc_lengths.len() as f64;
        let LexicalConfig { k1, b } = self.params;
        let mut scores: HashMap<ChunkId, f64> = HashMap::new();

        for term in &terms {
            check_cancelled(cancel)?;

            let Some(list) = self.postings.get(term) else {
                continue;
            };

            let df = list.len() as f64;
            let idf = (1.0 + (n_docs - df + 0.5) / (df + 0.5)).ln();

            for (i, posting) in list.iter().enumerate() {
                if i > 0 && i % CANCEL_CHECK_INTERVAL == 0 {
                    check_cancelled(cancel)?;
                }

                if let Some(f) = filter {
                    if !f.allows(posting.chunk_id) {
                        continue;
                    }
                }

                let tf = posting.term_frequency as f64;
                let dl = self.doc_lengths.get(&posting.chunk_id).copied().unwrap_or(0) as f64;
                let norm = if self.avg_doc_length > 0.0 {
                    dl / self.avg_doc_length
                } else {
                    0.0
                };
                let score = idf * (tf * (k1 + 1.0)) / (tf + k1 * (1.0 - b + b * norm));

                *scores.entry(posting.chunk_id).or_insert(0.0) += score;
            }
        }

        let results: Vec<ScoredChunk> = scores
            .into_iter()
            .map(|(id, s)| ScoredChunk::new(id, s as f32))
            .collect();

        let ranked = rank_desc(results, top_k);
        tracing::debug!(
            "Lexical query: {} terms, {} results (top_k={})",
            terms.len(),
            ranked.len(),
            top_k
        );
        Ok(ranked)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 단어 토큰화 (`\w+`, 소문자)
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario_index() -> LexicalIndex {
        LexicalIndex::build(
            LexicalConfig::default(),
            [
                (1, "cats are mammals"),
                (2, "dogs are mammals"),
                (3, "rockets use fuel"),
            ],
        )
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("Hello, World! snake_case 42"),
            vec!["hello", "world", "snake_case", "42"]
        );
        assert_eq!(tokenize("한국어 텍스트"), vec!["한국어", "텍스트"]);
        assert!(tokenize("  ... !!").is_empty());
    }

    #[test]
    fn test_mammals_tie_break() {
        let index = scenario_index();
        let token = CancellationToken::new();

        let results = index.query("mammals", 2, None, &token).unwrap();
        assert_eq!(results.len(), 2);
        // 동점이므로 낮은 ID 먼저
        assert_eq!(results[0].chunk_id, 1);
        assert_eq!(results[1].chunk_id, 2);
        assert_eq!(results[0].score, results[1].score);
        assert!(results[0].score > 0.0);
    }

    #[test]
    fn test_empty_and_unmatched_queries() {
        let index = scenario_index();
        let token = CancellationToken::new();

        assert!(index.query("", 5, None, &token).unwrap().is_empty());
        assert!(index.query("submarine", 5, None, &token).unwrap().is_empty());
        assert!(index.query("mammals", 0, None, &token).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_query_terms_do_not_inflate() {
        let index = scenario_index();
        let token = CancellationToken::new();

        let once = index.query("fuel", 1, None, &token).unwrap();
        let twice = index.query("fuel FUEL fuel", 1, None, &token).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_rare_term_scores_higher() {
        let index = scenario_index();
        let token = CancellationToken::new();

        let results = index.query("cats mammals", 3, None, &token).unwrap();
        assert_eq!(results[0].chunk_id, 1);
        assert_eq!(results.len(), 2);
        assert!(results[0].score > results[1].score);
    }

    #[test]
    fn test_filter_restricts_candidates() {
        let index = scenario_index();
        let token = CancellationToken::new();
        let filter = ChunkFilter::new([2, 3]);

        let results = index.query("mammals", 5, Some(&filter), &token).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_id, 2);
    }

    #[test]
    fn test_cancelled_query() {
        let index = scenario_index();
        let token = CancellationToken::new();
        token.cancel();

        let err = index.query("mammals", 2, None, &token).unwrap_err();
        assert!(matches!(err, crate::error::RagcapError::Cancelled));
    }

    #[test]
    fn test_postings_sorted_by_chunk_id() {
        let index = LexicalIndex::build(
            LexicalConfig::default(),
            [(9, "alpha"), (4, "alpha alpha"), (6, "beta")],
        );

        let list = index.postings("alpha");
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].chunk_id, 4);
        assert_eq!(list[0].term_frequency, 2);
        assert_eq!(list[1].chunk_id, 9);
        assert_eq!(index.term_count(), 2);
    }
}

//! 텍스트 청킹
//!
//! 공백 기준 단어 윈도우로 문서를 나눕니다. 각 청크는 원문 content의
//! 바이트 구간(span)으로 표현되므로 `content[start..end]`가 곧 청크 텍스트입니다.

use crate::error::{RagcapError, Result};

// ============================================================================
// Chunk Configuration
// ============================================================================

/// 청킹 설정
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkConfig {
    /// 청크당 단어 수
    pub chunk_words: usize,
    /// 인접 청크 간 중첩 단어 수
    pub overlap_words: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_words: 200,
            overlap_words: 40,
        }
    }
}

impl ChunkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_words == 0 {
            return Err(RagcapError::invalid("chunk_words must be positive"));
        }
        if self.overlap_words >= self.chunk_words {
            return Err(RagcapError::invalid(format!(
                "overlap_words ({}) must be smaller than chunk_words ({})",
                self.overlap_words, self.chunk_words
            )));
        }
        Ok(())
    }
}

/// 원문 content 안의 청크 구간 (UTF-8 바이트)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub start: usize,
    pub end: usize,
}

impl ChunkSpan {
    pub fn text<'a>(&self, content: &'a str) -> &'a str {
        &content[self.start..self.end]
    }
}

// ============================================================================
// Chunker Trait
// ============================================================================

/// 텍스트 청킹 전략 트레이트
pub trait Chunker: Send + Sync {
    /// 텍스트를 청크 구간으로 분할 (순서 유지)
    fn split(&self, text: &str) -> Vec<ChunkSpan>;

    /// 청커 이름
    fn name(&self) -> &'static str;
}

// ============================================================================
// WordChunker
// ============================================================================

/// 단어 윈도우 청커
#[derive(Debug, Clone)]
pub struct WordChunker {
    config: ChunkConfig,
}

impl WordChunker {
    pub fn new(config: ChunkConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn with_defaults() -> Self {
        Self {
            config: ChunkConfig::default(),
        }
    }

    pub fn config(&self) -> ChunkConfig {
        self.config
    }
}

impl Chunker for WordChunker {
    fn split(&self, text: &str) -> Vec<ChunkSpan> {
        let words = word_spans(text);
        if words.is_empty() {
            return vec![];
        }

        let ChunkConfig {
            chunk_words,
            overlap_words,
        } = self.config;
        let step = chunk_words - overlap_words;

        let mut spans = Vec::new();
        let mut start = 0;

        while start < words.len() {
            let end = (start + chunk_words).min(words.len());
            spans.push(ChunkSpan {
                start: words[start].start,
                end: words[end - 1].end,
            });

            if end >= words.len() {
                break;
            }
            start += step;
        }

        spans
    }

    fn name(&self) -> &'static str {
        "WordChunker"
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 공백으로 구분된 단어들의 바이트 구간
fn word_spans(text: &str) -> Vec<ChunkSpan> {
    let mut spans = Vec::new();
    let mut current: Option<usize> = None;

    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if let Some(start) = current.take() {
                spans.push(ChunkSpan { start, end: i });
            }
        } else if current.is_none() {
            current = Some(i);
        }
    }

    if let Some(start) = current {
        spans.push(ChunkSpan {
            start,
            end: text.len(),
        });
    }

    spans
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(chunk_words: usize, overlap_words: usize) -> WordChunker {
        WordChunker::new(ChunkConfig {
            chunk_words,
            overlap_words,
        })
        .unwrap()
    }

    #[test]
    fn test_empty_text() {
        assert!(WordChunker::with_defaults().split("").is_empty());
        assert!(WordChunker::with_defaults().split("   \n\t").is_empty());
    }

    #[test]
    fn test_short_text_single_chunk() {
        let text = "  cats are mammals\n";
        let spans = WordChunker::with_defaults().split(text);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].text(text), "cats are mammals");
        assert_eq!(spans[0].start, 2);
    }

    #[test]
    fn test_overlap_windows() {
        let text = "a b c d e f g";
        let spans = chunker(3, 1).split(text);
        let texts: Vec<_> = spans.iter().map(|s| s.text(text)).collect();
        assert_eq!(texts, vec!["a b c", "c d e", "e f g"]);
    }

    #[test]
    fn test_multibyte_offsets() {
        let text = "고양이는 포유류 입니다 rockets";
        let spans = chunker(2, 0).split(text);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].text(text), "고양이는 포유류");
        assert_eq!(spans[1].text(text), "입니다 rockets");
        assert!(text.is_char_boundary(spans[1].start));
    }

    #[test]
    fn test_invalid_config() {
        assert!(WordChunker::new(ChunkConfig {
            chunk_words: 0,
            overlap_words: 0
        })
        .is_err());
        assert!(WordChunker::new(ChunkConfig {
            chunk_words: 5,
            overlap_words: 5
        })
        .is_err());
    }
}

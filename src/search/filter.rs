//! 경로 필터 - 문서 source URI에 대한 include/exclude glob
//!
//! 패턴은 `;` 또는 `,`로 구분하며 `*`(임의 문자열), `?`(한 문자)를 지원합니다.
//! 역슬래시는 `/`로 정규화하고, 대소문자를 구분하지 않습니다.

use regex::Regex;

use crate::error::{RagcapError, Result};
use crate::index::{ChunkFilter, ChunkId};

/// include/exclude 경로 필터
#[derive(Debug, Clone)]
pub struct PathFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl PathFilter {
    /// 패턴 파싱
    ///
    /// 둘 다 비어 있으면 `None` (필터 없음).
    pub fn parse(include: Option<&str>, exclude: Option<&str>) -> Result<Option<Self>> {
        let include = compile_patterns(include)?;
        let exclude = compile_patterns(exclude)?;

        if include.is_empty() && exclude.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self { include, exclude }))
    }

    /// source URI 일치 여부
    pub fn matches(&self, source_uri: &str) -> bool {
        let path = source_uri.replace('\\', "/");

        let included = self.include.is_empty() || self.include.iter().any(|re| re.is_match(&path));
        let excluded = self.exclude.iter().any(|re| re.is_match(&path));

        included && !excluded
    }

    /// (청크 ID, source URI) 목록에서 허용 청크 집합 생성
    pub fn chunk_filter(&self, sources: &[(ChunkId, String)]) -> ChunkFilter {
        ChunkFilter::new(
            sources
                .iter()
                .filter(|(_, uri)| self.matches(uri))
                .map(|(id, _)| *id),
        )
    }
}

fn compile_patterns(patterns: Option<&str>) -> Result<Vec<Regex>> {
    let Some(patterns) = patterns else {
        return Ok(Vec::new());
    };

    patterns
        .split([';', ','])
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            let regex = glob_to_regex(&p.replace('\\', "/"));
            Regex::new(&regex)
                .map_err(|e| RagcapError::invalid(format!("invalid path pattern '{}': {}", p, e)))
        })
        .collect()
}

/// `*`, `?` glob → 전체 일치 정규식
fn glob_to_regex(glob: &str) -> String {
    let mut regex = String::from("(?i)^");
    for ch in glob.chars() {
        match ch {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');
    regex
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_patterns_mean_no_filter() {
        assert!(PathFilter::parse(None, None).unwrap().is_none());
        assert!(PathFilter::parse(Some(" ; , "), Some("")).unwrap().is_none());
    }

    #[test]
    fn test_include_and_exclude() {
        let filter = PathFilter::parse(Some("docs/*;*.md"), Some("*secret*"))
            .unwrap()
            .unwrap();

        assert!(filter.matches("docs/a.txt"));
        assert!(filter.matches("notes/c.md"));
        assert!(!filter.matches("src/main.rs"));
        assert!(!filter.matches("docs/secret-plan.txt"));
    }

    #[test]
    fn test_exclude_only() {
        let filter = PathFilter::parse(None, Some("*.pdf")).unwrap().unwrap();
        assert!(filter.matches("a.txt"));
        assert!(!filter.matches("manual.PDF"));
    }

    #[test]
    fn test_backslash_and_question_mark() {
        let filter = PathFilter::parse(Some(r"docs\?.txt"), None).unwrap().unwrap();
        assert!(filter.matches(r"docs\a.txt"));
        assert!(filter.matches("docs/b.txt"));
        assert!(!filter.matches("docs/ab.txt"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let filter = PathFilter::parse(Some("a+b(1).txt"), None).unwrap().unwrap();
        assert!(filter.matches("a+b(1).txt"));
        assert!(!filter.matches("aab1.txt"));
    }

    #[test]
    fn test_chunk_filter() {
        let filter = PathFilter::parse(Some("docs/*"), None).unwrap().unwrap();
        let sources = vec![
            (1, "docs/a.txt".to_string()),
            (2, "docs/b.txt".to_string()),
            (3, "notes/c.md".to_string()),
        ];

        let chunks = filter.chunk_filter(&sources);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.allows(1));
        assert!(!chunks.allows(3));
    }
}

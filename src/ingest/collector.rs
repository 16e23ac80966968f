//! 파일 수집
//!
//! 로컬 파일 및 폴더에서 캡슐에 넣을 입력을 모읍니다.
//! .gitignore 패턴을 존중하고, 지원하는 확장자만 수집합니다.

use std::path::{Path, PathBuf};

use ignore::WalkBuilder;

use crate::error::{RagcapError, Result};

// ============================================================================
// File Types
// ============================================================================

/// 지원하는 파일 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// 일반 텍스트, 소스 코드
    Text,
    Markdown,
    Html,
    Pdf,
}

impl FileType {
    /// 확장자로 파일 타입 결정
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.to_lowercase();
        match ext.as_str() {
            "md" | "markdown" => Some(FileType::Markdown),
            "html" | "htm" => Some(FileType::Html),
            "pdf" => Some(FileType::Pdf),
            "txt" | "rs" | "ts" | "tsx" | "js" | "jsx" | "py" | "json" | "toml" | "yaml"
            | "yml" | "css" | "go" | "java" | "c" | "cpp" | "h" | "hpp" | "cs" | "sh"
            | "sql" | "xml" | "csv" | "rst" => Some(FileType::Text),
            _ => None,
        }
    }

    /// 파일 경로에서 타입 결정
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }
}

// ============================================================================
// Collected File
// ============================================================================

/// 수집된 파일 정보
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedFile {
    /// 파일 절대 경로
    pub path: PathBuf,
    /// 문서 source URI (수집 루트 기준 상대 경로, `/` 구분)
    pub source_uri: String,
    pub file_type: FileType,
    /// 파일 크기 (바이트)
    pub size: u64,
}

// ============================================================================
// File Collector
// ============================================================================

/// 파일 수집기 설정
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// .gitignore 패턴 존중 여부
    pub respect_gitignore: bool,
    /// 숨김 파일 포함 여부
    pub include_hidden: bool,
    /// 최대 파일 크기 (바이트, 0이면 제한 없음)
    pub max_file_size: u64,
    pub skip_pdfs: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            respect_gitignore: true,
            include_hidden: false,
            max_file_size: 10 * 1024 * 1024, // 10MB
            skip_pdfs: false,
        }
    }
}

/// 파일 수집기
pub struct FileCollector {
    config: CollectorConfig,
}

impl FileCollector {
    pub fn new(config: CollectorConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(CollectorConfig::default())
    }

    /// 파일 또는 폴더 수집 (source URI 순 정렬)
    pub fn collect(&self, input: &Path) -> Result<Vec<CollectedFile>> {
        let abs_path = if input.is_absolute() {
            input.to_path_buf()
        } else {
            std::env::current_dir()?.join(input)
        };

        if abs_path.is_file() {
            let root = abs_path.parent().unwrap_or(Path::new(""));
            return Ok(self
                .collect_entry(root, &abs_path)?
                .into_iter()
                .collect());
        }
        if !abs_path.is_dir() {
            return Err(RagcapError::io(
                format!("input not found: {}", abs_path.display()),
                std::io::Error::from(std::io::ErrorKind::NotFound),
            ));
        }

        let mut files = Vec::new();

        // ignore 크레이트로 .gitignore 지원
        let walker = WalkBuilder::new(&abs_path)
            .hidden(!self.config.include_hidden)
            .git_ignore(self.config.respect_gitignore)
            .git_global(self.config.respect_gitignore)
            .git_exclude(self.config.respect_gitignore)
            .require_git(false)
            .build();

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!("Failed to read entry: {}", e);
                    continue;
                }
            };

            if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
                continue;
            }

            match self.collect_entry(&abs_path, entry.path()) {
                Ok(Some(file)) => files.push(file),
                Ok(None) => {}
                Err(e) => tracing::warn!("Failed to collect file: {}", e),
            }
        }

        files.sort_by(|a, b| a.source_uri.cmp(&b.source_uri));

        tracing::info!("Collected {} files from {}", files.len(), abs_path.display());
        Ok(files)
    }

    fn collect_entry(&self, root: &Path, path: &Path) -> Result<Option<CollectedFile>> {
        let Some(file_type) = FileType::from_path(path) else {
            tracing::debug!("Skipping unsupported file: {}", path.display());
            return Ok(None);
        };

        let metadata = std::fs::metadata(path)
            .map_err(|e| RagcapError::io(format!("failed to read metadata: {}", path.display()), e))?;

        let file = CollectedFile {
            path: path.to_path_buf(),
            source_uri: source_uri(root, path),
            file_type,
            size: metadata.len(),
        };

        Ok(self.should_include(&file).then_some(file))
    }

    fn should_include(&self, file: &CollectedFile) -> bool {
        if self.config.max_file_size > 0 && file.size > self.config.max_file_size {
            tracing::warn!("Skipping large file: {} ({} bytes)", file.path.display(), file.size);
            return false;
        }

        if self.config.skip_pdfs && file.file_type == FileType::Pdf {
            return false;
        }

        true
    }
}

/// 루트 기준 상대 경로 (`/` 구분)
fn source_uri(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_type_from_extension() {
        assert_eq!(FileType::from_extension("md"), Some(FileType::Markdown));
        assert_eq!(FileType::from_extension("rs"), Some(FileType::Text));
        assert_eq!(FileType::from_extension("HTM"), Some(FileType::Html));
        assert_eq!(FileType::from_extension("PDF"), Some(FileType::Pdf));
        assert_eq!(FileType::from_extension("png"), None);
    }

    #[test]
    fn test_collect_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs/b.txt"), "dogs").unwrap();
        std::fs::write(dir.path().join("docs/a.md"), "# cats").unwrap();
        std::fs::write(dir.path().join("image.png"), [0u8; 4]).unwrap();
        std::fs::write(dir.path().join(".hidden.txt"), "secret").unwrap();
        std::fs::write(dir.path().join(".gitignore"), "ignored.txt\n").unwrap();
        std::fs::write(dir.path().join("ignored.txt"), "skip me").unwrap();

        let files = FileCollector::with_defaults().collect(dir.path()).unwrap();
        let uris: Vec<_> = files.iter().map(|f| f.source_uri.as_str()).collect();

        assert_eq!(uris, vec!["docs/a.md", "docs/b.txt"]);
        assert_eq!(files[0].file_type, FileType::Markdown);
    }

    #[test]
    fn test_collect_single_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("note.txt");
        std::fs::write(&path, "hello").unwrap();

        let files = FileCollector::with_defaults().collect(&path).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].source_uri, "note.txt");
        assert_eq!(files[0].size, 5);
    }

    #[test]
    fn test_size_limit() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("big.txt"), "x".repeat(64)).unwrap();

        let collector = FileCollector::new(CollectorConfig {
            max_file_size: 10,
            ..Default::default()
        });
        assert!(collector.collect(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_missing_input() {
        let err = FileCollector::with_defaults()
            .collect(Path::new("/nonexistent/ragcap-input"))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::IoError);
    }
}

//! 파일 로더 - 수집된 파일에서 본문 텍스트 추출
//!
//! - 텍스트/마크다운: 직접 읽기
//! - HTML: scraper로 본문 추출 (script/style/nav/header/footer 제외)
//! - PDF: pdf-extract로 텍스트 추출
//!
//! 추출 후 공백을 정규화하되 문단 경계(빈 줄)는 유지합니다.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};

use crate::error::{RagcapError, Result};

use super::collector::{CollectedFile, FileType};

/// 본문에서 제외할 요소
const SKIPPED_ELEMENTS: [&str; 7] = ["script", "style", "noscript", "nav", "header", "footer", "template"];

/// 블록 요소 (앞뒤로 줄바꿈)
const BLOCK_ELEMENTS: [&str; 16] = [
    "p", "div", "section", "article", "main", "li", "ul", "ol", "tr", "table", "pre", "h1", "h2",
    "h3", "h4", "br",
];

/// 파일 본문 읽기
pub async fn load(file: &CollectedFile) -> Result<String> {
    let raw = match file.file_type {
        FileType::Text | FileType::Markdown => read_text(&file.path).await?,
        FileType::Html => html_to_text(&read_text(&file.path).await?),
        FileType::Pdf => {
            // PDF 추출은 CPU 바운드이므로 spawn_blocking 사용
            let path = file.path.clone();
            tokio::task::spawn_blocking(move || pdf_to_text(&path)).await??
        }
    };

    Ok(normalize_whitespace(&raw))
}

async fn read_text(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| RagcapError::io(format!("failed to read {}", path.display()), e))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn pdf_to_text(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)
        .map_err(|e| RagcapError::io(format!("failed to read PDF {}", path.display()), e))?;

    let text = pdf_extract::extract_text_from_mem(&bytes).map_err(|e| {
        RagcapError::invalid(format!("failed to extract text from PDF {}: {}", path.display(), e))
    })?;

    if text.trim().is_empty() {
        tracing::warn!(
            "No text extracted from PDF: {}. It might be a scanned document.",
            path.display()
        );
    }

    // 폼피드(페이지 구분)는 문단 경계로
    Ok(text.replace('\x0c', "\n\n"))
}

/// HTML 문서 → 본문 텍스트
pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut text = String::new();

    let title = Selector::parse("title")
        .ok()
        .and_then(|s| document.select(&s).next())
        .map(|t| t.text().collect::<String>());
    if let Some(title) = title.filter(|t| !t.trim().is_empty()) {
        text.push_str(title.trim());
        text.push_str("\n\n");
    }

    let root = Selector::parse("body")
        .ok()
        .and_then(|s| document.select(&s).next())
        .unwrap_or_else(|| document.root_element());
    collect_text(root, &mut text);

    text
}

fn collect_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(t) => out.push_str(t),
            Node::Element(e) => {
                let name = e.name();
                if SKIPPED_ELEMENTS.contains(&name) {
                    continue;
                }
                let block = BLOCK_ELEMENTS.contains(&name);
                if block {
                    out.push_str("\n\n");
                }
                if let Some(child) = ElementRef::wrap(child) {
                    collect_text(child, out);
                }
                if block {
                    out.push_str("\n\n");
                }
            }
            _ => {}
        }
    }
}

/// 공백 정규화
///
/// 줄바꿈 통일, 줄 안의 연속 공백 축약, 줄 앞뒤 공백 제거, 3줄 이상 빈 줄 → 2줄.
pub fn normalize_whitespace(text: &str) -> String {
    static INLINE: OnceLock<Option<Regex>> = OnceLock::new();
    static TRAILING: OnceLock<Option<Regex>> = OnceLock::new();
    static BLANK_LINES: OnceLock<Option<Regex>> = OnceLock::new();

    let text = text.replace("\r\n", "\n").replace('\r', "\n");

    let mut text = match INLINE.get_or_init(|| Regex::new(r"[ \t\x0b\x0c]+").ok()) {
        Some(re) => re.replace_all(&text, " ").into_owned(),
        None => text,
    };
    if let Some(re) = TRAILING.get_or_init(|| Regex::new(r" *\n *").ok()) {
        text = re.replace_all(&text, "\n").into_owned();
    }
    if let Some(re) = BLANK_LINES.get_or_init(|| Regex::new(r"\n{3,}").ok()) {
        text = re.replace_all(&text, "\n\n").into_owned();
    }

    text.trim().to_string()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_normalize_whitespace() {
        let text = "  line one\t\t with   tabs  \r\n\r\n\r\n\r\nline two \n";
        assert_eq!(normalize_whitespace(text), "line one with tabs\n\nline two");
    }

    #[test]
    fn test_html_to_text_skips_boilerplate() {
        let html = r#"
            <html>
            <head><title>Cats</title><style>body { color: red; }</style></head>
            <body>
                <nav>Home | About</nav>
                <article><h1>Mammals</h1><p>Cats are <b>mammals</b>.</p></article>
                <script>console.log("x")</script>
                <footer>Copyright</footer>
            </body>
            </html>
        "#;

        let text = normalize_whitespace(&html_to_text(html));
        assert!(text.starts_with("Cats\n\nMammals"));
        assert!(text.contains("Cats are mammals."));
        assert!(!text.contains("Home"));
        assert!(!text.contains("console"));
        assert!(!text.contains("Copyright"));
    }

    #[tokio::test]
    async fn test_load_text_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.md");
        std::fs::write(&path, "# Title\n\n\n\nBody   text\n").unwrap();

        let file = CollectedFile {
            path,
            source_uri: "a.md".to_string(),
            file_type: FileType::Markdown,
            size: 0,
        };
        assert_eq!(load(&file).await.unwrap(), "# Title\n\nBody text");
    }

    #[tokio::test]
    async fn test_invalid_pdf() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.pdf");
        std::fs::write(&path, b"not a pdf").unwrap();

        let file = CollectedFile {
            path,
            source_uri: "broken.pdf".to_string(),
            file_type: FileType::Pdf,
            size: 9,
        };
        assert!(load(&file).await.is_err());
    }
}

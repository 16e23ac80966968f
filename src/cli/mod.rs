//! CLI 모듈
//!
//! ragcap CLI 명령어 정의 및 구현

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;

use crate::api::{AskRequest, Engine, ExportRequest, SearchRequest};
use crate::capsule::{self, IndexParams};
use crate::config::Config;
use crate::error::{ErrorResponse, RagcapError};
use crate::export::{read_history, ExportFormat};
use crate::ingest::{build_capsule, BuildOptions, ChunkConfig};
use crate::search::SearchMode;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "ragcap")]
#[command(version, about = "RAG 캡슐 엔진 - 하이브리드 검색, 답변 생성, 내보내기", long_about = None)]
pub struct Cli {
    /// 설정 파일 경로 (기본: ~/.ragcap/config.toml)
    #[arg(long, global = true, env = "RAGCAP_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// 출력 형식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// MMR 재순위 옵션
#[derive(Debug, Clone, Default, Args)]
pub struct MmrArgs {
    /// MMR 재순위 사용
    #[arg(long)]
    pub mmr: bool,

    /// 관련도 가중치 0..1 (기본: 설정값)
    #[arg(long, requires = "mmr")]
    pub mmr_lambda: Option<f32>,

    /// 재순위 후보 수 (기본: top_k × 4)
    #[arg(long, requires = "mmr")]
    pub mmr_pool: Option<usize>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 캡슐 검색
    Search {
        /// 캡슐 파일
        capsule: PathBuf,

        /// 검색 쿼리
        #[arg(short, long)]
        query: String,

        /// 결과 개수 (기본: 설정값)
        #[arg(short = 'k', long, visible_alias = "top")]
        top_k: Option<usize>,

        /// hybrid, lexical(bm25), vector
        #[arg(short, long, default_value = "hybrid")]
        mode: SearchMode,

        /// 포함할 source URI glob
        #[arg(long)]
        include: Option<String>,

        /// 제외할 source URI glob
        #[arg(long)]
        exclude: Option<String>,

        #[command(flatten)]
        mmr: MmrArgs,

        #[arg(long, value_enum, default_value_t)]
        format: OutputFormat,
    },

    /// 검색 결과로 답변 생성
    Ask {
        capsule: PathBuf,

        #[arg(short, long)]
        query: String,

        #[arg(short = 'k', long, visible_alias = "top")]
        top_k: Option<usize>,

        /// 답변 프로바이더 ID (기본: 설정값)
        #[arg(short, long)]
        provider: Option<String>,

        #[arg(short, long, default_value = "hybrid")]
        mode: SearchMode,

        /// 답변 생성 제한 시간 (초)
        #[arg(long)]
        timeout: Option<u64>,

        #[arg(long)]
        include: Option<String>,

        #[arg(long)]
        exclude: Option<String>,

        #[command(flatten)]
        mmr: MmrArgs,

        #[arg(long, value_enum, default_value_t)]
        format: OutputFormat,
    },

    /// 캡슐 내보내기
    Export {
        capsule: PathBuf,

        /// 출력 경로
        #[arg(short, long)]
        output: PathBuf,

        /// parquet, lance, faiss
        #[arg(short, long, default_value = "parquet")]
        format: String,

        /// JSON 출력
        #[arg(long)]
        json: bool,
    },

    /// 캡슐 정보 (인덱스 구축 없음)
    Inspect {
        capsule: PathBuf,

        #[arg(long)]
        json: bool,
    },

    /// 캡슐 검증 + 인덱스 구축
    Verify { capsule: PathBuf },

    /// 두 캡슐 비교
    Diff {
        a: PathBuf,
        b: PathBuf,

        #[arg(long)]
        json: bool,
    },

    /// 파일/폴더로 캡슐 생성 또는 갱신
    Build {
        capsule: PathBuf,

        /// 입력 파일 또는 폴더
        #[arg(short, long)]
        input: PathBuf,

        /// 임베딩 모델 ID (새 캡슐에만 적용)
        #[arg(long, default_value = crate::embedding::hash::MODEL_ID)]
        model: String,

        /// 임베딩 차원 (새 캡슐에만 적용)
        #[arg(long, default_value = "256")]
        dimension: usize,

        #[arg(long, default_value = "200")]
        chunk_words: usize,

        #[arg(long, default_value = "40")]
        overlap_words: usize,

        /// PDF 파일 건너뛰기
        #[arg(long)]
        skip_pdfs: bool,
    },

    /// 내보내기 이력
    History { capsule: PathBuf },
}

// ============================================================================
// Command Handlers
// ============================================================================

/// CLI 명령어 실행
pub async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Search {
            capsule,
            query,
            top_k,
            mode,
            include,
            exclude,
            mmr,
            format,
        } => {
            let request = SearchRequest {
                query,
                top_k,
                mode,
                include,
                exclude,
                mmr: mmr.mmr,
                mmr_lambda: mmr.mmr_lambda,
                mmr_pool: mmr.mmr_pool,
            };
            cmd_search(config_path, &capsule, request, format).await
        }
        Commands::Ask {
            capsule,
            query,
            top_k,
            provider,
            mode,
            timeout,
            include,
            exclude,
            mmr,
            format,
        } => {
            let request = AskRequest {
                query,
                top_k,
                provider_id: provider,
                mode,
                timeout_secs: timeout,
                include,
                exclude,
                mmr: mmr.mmr,
                mmr_lambda: mmr.mmr_lambda,
                mmr_pool: mmr.mmr_pool,
            };
            cmd_ask(config_path, &capsule, request, format).await
        }
        Commands::Export {
            capsule,
            output,
            format,
            json,
        } => {
            let request = ExportRequest {
                destination_path: output,
                format,
            };
            cmd_export(config_path, &capsule, request, json).await
        }
        Commands::Inspect { capsule, json } => cmd_inspect(&capsule, json),
        Commands::Verify { capsule } => cmd_verify(config_path, &capsule).await,
        Commands::Diff { a, b, json } => cmd_diff(&a, &b, json).await,
        Commands::Build {
            capsule,
            input,
            model,
            dimension,
            chunk_words,
            overlap_words,
            skip_pdfs,
        } => {
            let mut options = BuildOptions {
                model_id: model,
                dimension,
                chunk: ChunkConfig {
                    chunk_words,
                    overlap_words,
                },
                ..Default::default()
            };
            options.collector.skip_pdfs = skip_pdfs;
            cmd_build(config_path, &capsule, &input, &options).await
        }
        Commands::History { capsule } => cmd_history(&capsule).await,
    }
}

/// 검색 명령어 (search)
async fn cmd_search(
    config_path: Option<&Path>,
    capsule: &Path,
    request: SearchRequest,
    format: OutputFormat,
) -> Result<()> {
    let json = format == OutputFormat::Json;
    let engine = open_engine(config_path, capsule, json).await?;
    let cancel = cancel_on_ctrl_c();

    if !json {
        println!("[*] 검색 중: \"{}\" ({})", request.query, request.mode);
    }

    let response = engine
        .search(&request, &cancel)
        .await
        .map_err(|e| emit_failure(json, e))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    if response.results.is_empty() {
        println!("\n[!] 검색 결과가 없습니다.");
        return Ok(());
    }

    println!("\n[OK] 검색 결과 ({} 건):\n", response.results.len());

    for (i, hit) in response.results.iter().enumerate() {
        println!(
            "{}. [점수: {:.4}] Chunk #{} {}",
            i + 1,
            hit.score,
            hit.chunk_id,
            format_source_scores(hit.scores.lexical, hit.scores.vector)
        );
        if let Some(rerank) = hit.rerank_score {
            println!("   MMR: {:.4}", rerank);
        }
        println!("   Source: {} [{}..{}]", hit.document_source_uri, hit.offset_start, hit.offset_end);
        println!("   내용: {}", truncate_text(&hit.text, 200));
        println!();
    }

    Ok(())
}

/// 답변 명령어 (ask)
async fn cmd_ask(
    config_path: Option<&Path>,
    capsule: &Path,
    request: AskRequest,
    format: OutputFormat,
) -> Result<()> {
    let json = format == OutputFormat::Json;
    let engine = open_engine(config_path, capsule, json).await?;
    let cancel = cancel_on_ctrl_c();

    if !json {
        println!("[*] 답변 생성 중: \"{}\"", request.query);
    }

    let response = engine
        .ask(&request, &cancel)
        .await
        .map_err(|e| emit_failure(json, e))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    println!("\n{}\n", response.answer.trim());

    if response.citations.is_empty() {
        println!("[!] 인용된 청크가 없습니다.");
    } else {
        println!("[OK] 인용 ({} 건):", response.citations.len());
        for citation in &response.citations {
            println!("  #{:<6} {}", citation.chunk_id, citation.document_source_uri);
        }
    }

    Ok(())
}

/// 내보내기 명령어 (export)
async fn cmd_export(
    config_path: Option<&Path>,
    capsule: &Path,
    request: ExportRequest,
    json: bool,
) -> Result<()> {
    // 형식 오류는 캡슐을 열기 전에 보고
    let format: ExportFormat = request.format.parse().map_err(|e| emit_failure(json, e))?;
    let engine = open_engine(config_path, capsule, json).await?;
    let cancel = cancel_on_ctrl_c();

    if !json {
        println!("[*] 내보내는 중: {} → {} ({})", capsule.display(), request.destination_path.display(), format);
    }

    let response = engine
        .export(&request, &cancel)
        .await
        .map_err(|e| emit_failure(json, e))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        println!("[OK] 내보내기 완료: {}", response.path.display());
    }

    Ok(())
}

/// 정보 명령어 (inspect)
fn cmd_inspect(path: &Path, json: bool) -> Result<()> {
    let info = capsule::inspect(path).map_err(|e| emit_failure(json, e))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("=== ragcap capsule ===\n");
    println!("Path: {}", info.path.display());
    println!("Schema: v{}", info.schema_version);
    println!("Embedding: {} ({} dims)", info.embedding_model_id, info.embedding_dimension);
    println!("Created: {}", info.created_at.format("%Y-%m-%d %H:%M"));
    println!();
    println!(
        "[OK] 문서: {} 건 (최신 {} 건)",
        info.stats.document_count, info.stats.live_document_count
    );
    println!(
        "[OK] 청크: {} 개 (최신 {} 개, 임베딩 {} 개)",
        info.stats.chunk_count, info.stats.live_chunk_count, info.stats.embedding_count
    );
    println!("     평균 청크 크기: {}", format_bytes(info.stats.avg_chunk_bytes as usize));

    Ok(())
}

/// 검증 명령어 (verify)
async fn cmd_verify(config_path: Option<&Path>, path: &Path) -> Result<()> {
    let config = Config::load(config_path).context("설정 로드 실패")?;
    let params = IndexParams {
        lexical: config.lexical,
        vector: config.vector,
    };

    println!("[*] 검증 중: {}", path.display());

    let owned = path.to_path_buf();
    let report = tokio::task::spawn_blocking(move || capsule::verify(&owned, params))
        .await
        .context("검증 태스크 실패")?
        .context("캡슐 검증 실패")?;

    println!("[OK] 스키마 v{}, {}", report.info.schema_version, report.info.embedding_model_id);
    println!(
        "[OK] 어휘 인덱스: {} 청크, {} 단어",
        report.indexed_chunks, report.vocabulary_size
    );
    println!(
        "[OK] 벡터 인덱스: {} 벡터 ({:?}, {})",
        report.indexed_vectors,
        report.metric,
        if report.ann_graph { "HNSW" } else { "exact" }
    );

    Ok(())
}

/// 비교 명령어 (diff)
async fn cmd_diff(a: &Path, b: &Path, json: bool) -> Result<()> {
    let (left, right) = (a.to_path_buf(), b.to_path_buf());
    let result = tokio::task::spawn_blocking(move || capsule::diff(&left, &right))
        .await
        .context("비교 태스크 실패")?
        .map_err(|e| emit_failure(json, e))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    println!("=== {} ↔ {} ===\n", a.display(), b.display());

    for change in &result.meta {
        println!(
            "  meta {}: {} → {}",
            change.key,
            change.a.as_deref().unwrap_or("-"),
            change.b.as_deref().unwrap_or("-")
        );
    }
    for uri in &result.added_sources {
        println!("  + {}", uri);
    }
    for uri in &result.removed_sources {
        println!("  - {}", uri);
    }
    for uri in &result.modified_sources {
        println!("  ~ {}", uri);
    }

    println!();
    println!("청크: {} → {}", result.chunk_count.a, result.chunk_count.b);
    println!(
        "평균 청크 크기: {} → {}",
        format_bytes(result.avg_chunk_bytes.a as usize),
        format_bytes(result.avg_chunk_bytes.b as usize)
    );
    println!(
        "임베딩 차원: {} → {}",
        result.embedding_dimension.a, result.embedding_dimension.b
    );

    if result.is_identical() {
        println!("\n[OK] 내용 차이가 없습니다.");
    } else {
        println!(
            "\n[!] 추가 {}, 삭제 {}, 변경 {}",
            result.added_sources.len(),
            result.removed_sources.len(),
            result.modified_sources.len()
        );
    }

    Ok(())
}

/// 빌드 명령어 (build)
async fn cmd_build(
    config_path: Option<&Path>,
    capsule: &Path,
    input: &Path,
    options: &BuildOptions,
) -> Result<()> {
    let config = Config::load(config_path).context("설정 로드 실패")?;

    println!("[*] 수집 중: {} → {}", input.display(), capsule.display());

    let summary = build_capsule(capsule, input, options, &config.embedding)
        .await
        .context("캡슐 빌드 실패")?;

    println!();
    println!(
        "[OK] 완료: 문서 {}, 청크 {}, 변경 없음 {}, 건너뜀 {}",
        summary.sources, summary.chunks, summary.unchanged, summary.skipped
    );

    Ok(())
}

/// 이력 명령어 (history)
async fn cmd_history(capsule: &Path) -> Result<()> {
    let records = read_history(capsule).await.context("내보내기 이력 조회 실패")?;

    if records.is_empty() {
        println!("[!] 내보내기 이력이 없습니다.");
        return Ok(());
    }

    println!("[OK] 내보내기 이력 ({} 건):\n", records.len());
    for record in records {
        println!(
            "  {} [{}] {}",
            record.timestamp.format("%Y-%m-%d %H:%M"),
            record.format,
            record.file_path.display()
        );
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

async fn open_engine(config_path: Option<&Path>, capsule: &Path, json: bool) -> Result<Engine> {
    let config = Config::load(config_path).map_err(|e| emit_failure(json, e))?;
    Engine::open(capsule, config)
        .await
        .map_err(|e| emit_failure(json, e))
}

/// Ctrl-C 시 취소되는 토큰
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling in-flight request");
            child.cancel();
        }
    });
    token
}

/// JSON 모드면 실패 객체를 stdout에 출력
fn emit_failure(json: bool, err: RagcapError) -> anyhow::Error {
    if json {
        let response = ErrorResponse::from(&err);
        match serde_json::to_string_pretty(&response) {
            Ok(body) => println!("{}", body),
            Err(e) => tracing::error!("Failed to serialize error response: {}", e),
        }
    }
    anyhow::Error::new(err)
}

fn format_source_scores(lexical: Option<f32>, vector: Option<f32>) -> String {
    match (lexical, vector) {
        (Some(l), Some(v)) => format!("(BM25 {:.3}, VEC {:.3})", l, v),
        (Some(l), None) => format!("(BM25 {:.3})", l),
        (None, Some(v)) => format!("(VEC {:.3})", v),
        (None, None) => String::new(),
    }
}

/// 텍스트 자르기 (UTF-8 안전)
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

/// 바이트 크기 포맷팅
fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ============================================================================
// Tests
// ============================================================================

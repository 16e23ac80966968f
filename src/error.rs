//! 에러 타입 - 캡슐 엔진 공통 실패 분류
//!
//! 모든 실패는 종류(kind) + 메시지 + 선택적 원인(cause)으로 호출자에게 전달됩니다.
//! 엔진 내부에서 조용히 복구하거나 재시도하지 않습니다.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 원인 에러 박스
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result 별칭
pub type Result<T> = std::result::Result<T, RagcapError>;

// ============================================================================
// RagcapError
// ============================================================================

/// 캡슐 엔진 에러
#[derive(Debug, Error)]
pub enum RagcapError {
    /// 청크/문서 없음 (다른 ID로 재시도 가능)
    #[error("not found: {0}")]
    NotFound(String),

    /// 쿼리 임베딩 차원이 인덱스 차원과 다름
    #[error("dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// 등록되지 않은 답변 프로바이더 ID
    #[error("unknown provider: '{0}'")]
    UnknownProvider(String),

    /// 지원하지 않는 내보내기 형식
    #[error("unsupported export format: '{0}'")]
    UnsupportedFormat(String),

    /// 외부 프로바이더(LLM/임베딩) 실패
    #[error("provider error: {message}")]
    Provider {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// 캡슐을 사용할 수 없음 (로드 시점에 치명적)
    #[error("incompatible capsule: {0}")]
    IncompatibleCapsule(String),

    /// 저장소 접근 실패
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: BoxError,
    },

    /// 잘못된 요청 (모드, 설정, 인자)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// 호출자가 취소함
    #[error("operation cancelled")]
    Cancelled,

    /// 내부 태스크 실패
    #[error("internal error: {0}")]
    Internal(String),
}

impl RagcapError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn incompatible(msg: impl Into<String>) -> Self {
        Self::IncompatibleCapsule(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// 원인 없는 프로바이더 에러
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider {
            message: msg.into(),
            source: None,
        }
    }

    /// 원인을 첨부한 프로바이더 에러
    pub fn provider_with<E>(msg: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Provider {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// 원인을 첨부한 I/O 에러
    pub fn io<E>(msg: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Io {
            message: msg.into(),
            source: Box::new(source),
        }
    }

    /// 에러 종류
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::DimensionMismatch { .. } => ErrorKind::DimensionMismatch,
            Self::UnknownProvider(_) => ErrorKind::UnknownProvider,
            Self::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            Self::Provider { .. } => ErrorKind::ProviderError,
            Self::IncompatibleCapsule(_) => ErrorKind::IncompatibleCapsule,
            Self::Io { .. } => ErrorKind::IoError,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<std::io::Error> for RagcapError {
    fn from(e: std::io::Error) -> Self {
        Self::io("storage access failed", e)
    }
}

impl From<rusqlite::Error> for RagcapError {
    fn from(e: rusqlite::Error) -> Self {
        Self::io("capsule database error", e)
    }
}

impl From<tokio::task::JoinError> for RagcapError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Internal(format!("background task failed: {}", e))
    }
}

// ============================================================================
// ErrorKind / ErrorResponse
// ============================================================================

/// 직렬화되는 에러 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    DimensionMismatch,
    UnknownProvider,
    UnsupportedFormat,
    ProviderError,
    IncompatibleCapsule,
    #[serde(rename = "IOError")]
    IoError,
    InvalidRequest,
    Cancelled,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotFound => "NotFound",
            Self::DimensionMismatch => "DimensionMismatch",
            Self::UnknownProvider => "UnknownProvider",
            Self::UnsupportedFormat => "UnsupportedFormat",
            Self::ProviderError => "ProviderError",
            Self::IncompatibleCapsule => "IncompatibleCapsule",
            Self::IoError => "IOError",
            Self::InvalidRequest => "InvalidRequest",
            Self::Cancelled => "Cancelled",
            Self::Internal => "Internal",
        };
        f.write_str(s)
    }
}

/// JSON 실패 객체 `{kind, message, cause}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl From<&RagcapError> for ErrorResponse {
    fn from(err: &RagcapError) -> Self {
        // 원인 체인을 ": "로 연결
        let mut causes = Vec::new();
        let mut source = std::error::Error::source(err);
        while let Some(e) = source {
            causes.push(e.to_string());
            source = e.source();
        }

        Self {
            kind: err.kind(),
            message: err.to_string(),
            cause: if causes.is_empty() {
                None
            } else {
                Some(causes.join(": "))
            },
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serialization() {
        let json = serde_json::to_string(&ErrorKind::IoError).unwrap();
        assert_eq!(json, "\"IOError\"");

        let json = serde_json::to_string(&ErrorKind::UnknownProvider).unwrap();
        assert_eq!(json, "\"UnknownProvider\"");
    }

    #[test]
    fn test_error_response_with_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = RagcapError::io("failed to open capsule", io);

        let resp = ErrorResponse::from(&err);
        assert_eq!(resp.kind, ErrorKind::IoError);
        assert!(resp.message.contains("failed to open capsule"));
        assert_eq!(resp.cause.as_deref(), Some("denied"));
    }

    #[test]
    fn test_error_response_without_cause() {
        let err = RagcapError::UnknownProvider("nonexistent".to_string());
        let resp = ErrorResponse::from(&err);

        assert_eq!(resp.kind, ErrorKind::UnknownProvider);
        assert!(resp.cause.is_none());

        let json = serde_json::to_value(&resp).unwrap();
        assert!(json.get("cause").is_none());
        assert_eq!(json["kind"], "UnknownProvider");
    }

    #[test]
    fn test_dimension_mismatch_message() {
        let err = RagcapError::DimensionMismatch {
            expected: 256,
            actual: 128,
        };
        assert_eq!(err.kind(), ErrorKind::DimensionMismatch);
        assert!(err.to_string().contains("256"));
        assert!(err.to_string().contains("128"));
    }
}

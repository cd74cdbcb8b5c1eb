//! Top-level error taxonomy and stable exit codes.
//!
//! Errors fall into four buckets:
//! - retryable (cache lock timeout): the caller may resubmit the identical
//!   input later, exit code 2
//! - unsupported language: not retryable without reconfiguration, exit code 3
//! - setup/fatal: malformed input, path restriction violation, missing file,
//!   schema failure, or a build failure of a trusted program, exit code 1
//! - per-unit failures (one solution, one test) are never errors: they stay
//!   encoded in the report

use std::io;

use thiserror::Error;

use crate::cache::CacheError;
use crate::exec::ExecError;

/// Result type for grader operations
pub type GraderResult<T> = Result<T, GraderError>;

/// Errors that abort an evaluation (or a retryable slice of one)
#[derive(Debug, Error)]
pub enum GraderError {
    #[error("invalid input: {0}")]
    Input(String),

    #[error("unresolved variable: @{0}")]
    UnresolvedVariable(String),

    #[error("variable resolution too deep (cycle through @{0}?)")]
    VariableCycle(String),

    #[error("path outside allowed roots: {0}")]
    PathRestriction(String),

    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("missing required file: {0}")]
    MissingFile(String),

    #[error("program state error: {0}")]
    ProgramState(String),

    #[error("{stage} failed to build, evaluation aborted")]
    StageFailed { stage: String },

    #[error("schema validation failed: {0}")]
    Schema(String),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("execution setup error: {0}")]
    Exec(#[from] ExecError),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GraderError {
    /// True when resubmitting the identical input may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GraderError::Cache(e) if e.is_retryable())
    }

    /// Map this error to the process exit code.
    ///
    /// 0 is reserved for success; 1 is the generic fatal code, 2 means
    /// retryable, 3 means unsupported language.
    pub fn exit_code(&self) -> i32 {
        if self.is_retryable() {
            return 2;
        }
        match self {
            GraderError::UnsupportedLanguage(_) => 3,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn lock_timeout_is_retryable() {
        let err = GraderError::Cache(CacheError::LockTimeout(Duration::from_secs(60)));
        assert!(err.is_retryable());
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn unsupported_language_exit_code() {
        let err = GraderError::UnsupportedLanguage("cobol".to_string());
        assert!(!err.is_retryable());
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn generic_errors_exit_one() {
        assert_eq!(GraderError::Input("bad".into()).exit_code(), 1);
        assert_eq!(
            GraderError::PathRestriction("/etc/passwd".into()).exit_code(),
            1
        );
    }
}

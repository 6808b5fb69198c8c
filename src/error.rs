//! Error kind registry
//!
//! Every module error classifies itself into one of five kinds so callers can
//! decide whether to advance to the next source, give up, or retry a write.
//! [`CatalogError`] is the flattened form callers outside the crate see.

use serde::Serialize;
use thiserror::Error;

/// Coarse classification shared by every error in the crate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Invalid source definition or incomplete cloud spec; raised before any fetch
    Configuration,
    /// Path absent at a source, or source unreachable
    NotFound,
    /// Explicit auth rejection, or failed required-signature verification
    Unauthorized,
    /// Any other non-success transport outcome
    Transport,
    /// Persisting the merged catalog failed
    Write,
}

impl ErrorKind {
    /// Returns the string representation of the error kind
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "CONFIGURATION",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::Transport => "TRANSPORT",
            ErrorKind::Write => "WRITE",
        }
    }

    /// Process exit code used by the CLI
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::Configuration => 2,
            ErrorKind::NotFound => 3,
            ErrorKind::Unauthorized => 4,
            ErrorKind::Transport => 5,
            ErrorKind::Write => 6,
        }
    }

    /// Whether a lookup should try the same source again (when its retry flag allows)
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::NotFound | ErrorKind::Transport)
    }

    /// Pick the most severe kind out of a set of per-source failures.
    ///
    /// Unauthorized outranks Transport, which outranks NotFound, so a signature
    /// failure is never reported as a plain miss.
    pub fn most_severe<I: IntoIterator<Item = ErrorKind>>(kinds: I) -> Option<ErrorKind> {
        kinds.into_iter().max_by_key(|k| k.severity())
    }

    fn severity(&self) -> u8 {
        match self {
            ErrorKind::NotFound => 0,
            ErrorKind::Transport => 1,
            ErrorKind::Unauthorized => 2,
            ErrorKind::Write => 3,
            ErrorKind::Configuration => 4,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A failure reduced to its kind and a user-facing message
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("write error: {0}")]
    Write(String),
}

impl CatalogError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Configuration => CatalogError::Configuration(message),
            ErrorKind::NotFound => CatalogError::NotFound(message),
            ErrorKind::Unauthorized => CatalogError::Unauthorized(message),
            ErrorKind::Transport => CatalogError::Transport(message),
            ErrorKind::Write => CatalogError::Write(message),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CatalogError::Configuration(_) => ErrorKind::Configuration,
            CatalogError::NotFound(_) => ErrorKind::NotFound,
            CatalogError::Unauthorized(_) => ErrorKind::Unauthorized,
            CatalogError::Transport(_) => ErrorKind::Transport,
            CatalogError::Write(_) => ErrorKind::Write,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            CatalogError::Configuration(m)
            | CatalogError::NotFound(m)
            | CatalogError::Unauthorized(m)
            | CatalogError::Transport(m)
            | CatalogError::Write(m) => m,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }
}

macro_rules! classified {
    ($($error:ty),* $(,)?) => {
        $(
            impl From<$error> for CatalogError {
                fn from(error: $error) -> Self {
                    CatalogError::new(error.kind(), error.to_string())
                }
            }
        )*
    };
}

classified!(
    crate::cloud::CloudSpecError,
    crate::source::SourceError,
    crate::fetch::FetchError,
    crate::verify::PolicyError,
    crate::catalog::LayoutError,
    crate::lookup::AttemptError,
    crate::lookup::LookupError,
    crate::store::StoreError,
    crate::config::ConfigError,
    crate::pipeline::PipelineError,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_most_severe_prefers_unauthorized() {
        let kinds = vec![ErrorKind::NotFound, ErrorKind::Unauthorized, ErrorKind::Transport];
        assert_eq!(ErrorKind::most_severe(kinds), Some(ErrorKind::Unauthorized));
    }

    #[test]
    fn test_most_severe_empty() {
        assert_eq!(ErrorKind::most_severe(Vec::new()), None);
    }

    #[test]
    fn test_retryable() {
        assert!(ErrorKind::NotFound.is_retryable());
        assert!(ErrorKind::Transport.is_retryable());
        assert!(!ErrorKind::Unauthorized.is_retryable());
    }

    #[test]
    fn test_display() {
        assert_eq!(ErrorKind::NotFound.to_string(), "NOT_FOUND");
    }

    #[test]
    fn test_catalog_error_keeps_kind() {
        for kind in [
            ErrorKind::Configuration,
            ErrorKind::NotFound,
            ErrorKind::Unauthorized,
            ErrorKind::Transport,
            ErrorKind::Write,
        ] {
            let error = CatalogError::new(kind, "boom");
            assert_eq!(error.kind(), kind);
            assert_eq!(error.message(), "boom");
        }
    }

    #[test]
    fn test_module_error_converts() {
        let error: CatalogError = crate::fetch::FetchError::Unauthorized {
            url: "https://example/streams/v1/index.json".to_string(),
        }
        .into();
        assert_eq!(error.kind(), ErrorKind::Unauthorized);
        assert!(error.message().contains("https://example/streams/v1/index.json"));
        assert_eq!(error.exit_code(), 4);
    }
}

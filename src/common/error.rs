//! Error types for kvsnap

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error category, used by callers to tell failures apart
/// (and by the CLI to pick an exit status).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Usage,
    Resolution,
    Precondition,
    Bootstrap,
    Operation,
    Cancelled,
}

#[derive(Error, Debug)]
pub enum Error {
    // === Usage Errors ===
    #[error("{0}")]
    Usage(String),

    // === Resolution Errors ===
    #[error("failed to resolve {what}: {source}")]
    Resolution {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },

    // === Precondition Errors ===
    #[error("managed store has not been initialized")]
    NotInitialized,

    // === Bootstrap Errors ===
    #[error("cluster bootstrap failed: {message}")]
    Bootstrap {
        message: String,
        #[source]
        source: Option<Box<Error>>,
    },

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    // === Operation Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Operation(String),

    #[error("snapshot(s) not found: {}", .0.join(", "))]
    SnapshotNotFound(Vec<String>),

    #[error("failed to remove snapshot {failed} (removed: {}): {source}", names_or_none(.removed))]
    DeleteFailed {
        removed: Vec<String>,
        failed: String,
        #[source]
        source: Box<Error>,
    },

    #[error("S3 request failed with status {status}: {message}")]
    S3 { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TLS material error: {0}")]
    Tls(String),

    #[error("credential error: {0}")]
    Credential(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Cancellation ===
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn bootstrap(message: impl Into<String>) -> Self {
        Error::Bootstrap {
            message: message.into(),
            source: None,
        }
    }

    /// Which taxonomy bucket this error falls into.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Usage(_) | Error::InvalidConfig(_) => ErrorKind::Usage,
            Error::Resolution { .. } => ErrorKind::Resolution,
            Error::NotInitialized => ErrorKind::Precondition,
            Error::Bootstrap { .. } | Error::Corrupted(_) => ErrorKind::Bootstrap,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Io(_)
            | Error::Operation(_)
            | Error::SnapshotNotFound(_)
            | Error::DeleteFailed { .. }
            | Error::S3 { .. }
            | Error::Http(_)
            | Error::Tls(_)
            | Error::Credential(_) => ErrorKind::Operation,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }

    /// Process exit status for this error
    pub fn exit_code(&self) -> u8 {
        match self.kind() {
            ErrorKind::Usage => 2,
            ErrorKind::Cancelled => 130,
            _ => 1,
        }
    }

    /// Wrap an error raised while reconciling cluster state so that it is
    /// reported as a bootstrap failure. Cancellation passes through.
    pub fn into_bootstrap(self) -> Self {
        match self {
            Error::Cancelled | Error::Bootstrap { .. } | Error::Corrupted(_) => self,
            other => Error::Bootstrap {
                message: other.to_string(),
                source: Some(Box::new(other)),
            },
        }
    }
}

fn names_or_none(names: &[String]) -> String {
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(", ")
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Operation(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Operation(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::Usage("x".into()).kind(), ErrorKind::Usage);
        assert_eq!(Error::NotInitialized.kind(), ErrorKind::Precondition);
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            Error::SnapshotNotFound(vec!["a".into()]).kind(),
            ErrorKind::Operation
        );
        assert_eq!(
            Error::Resolution {
                what: "hostname",
                source: std::io::Error::other("boom"),
            }
            .kind(),
            ErrorKind::Resolution
        );
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::Usage("x".into()).exit_code(), 2);
        assert_eq!(Error::Cancelled.exit_code(), 130);
        assert_eq!(Error::NotInitialized.exit_code(), 1);
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            Error::NotInitialized.to_string(),
            "managed store has not been initialized"
        );
        assert_eq!(
            Error::SnapshotNotFound(vec!["a".into(), "b".into()]).to_string(),
            "snapshot(s) not found: a, b"
        );
    }

    #[test]
    fn test_into_bootstrap() {
        let err = Error::Io(std::io::Error::other("disk gone")).into_bootstrap();
        assert_eq!(err.kind(), ErrorKind::Bootstrap);
        assert!(err.to_string().contains("disk gone"));
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "I/O error: disk gone");

        assert!(Error::Cancelled.into_bootstrap().is_cancelled());
        assert!(std::error::Error::source(&Error::bootstrap("no id")).is_none());
    }

    #[test]
    fn test_delete_failed_names_both_sides() {
        let err = Error::DeleteFailed {
            removed: vec!["snap-a".into()],
            failed: "snap-b".into(),
            source: Box::new(Error::Operation("Is a directory".into())),
        };
        assert_eq!(err.kind(), ErrorKind::Operation);
        assert_eq!(
            err.to_string(),
            "failed to remove snapshot snap-b (removed: snap-a): Is a directory"
        );
    }
}

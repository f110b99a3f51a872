//! Error types shared by every plf crate

use std::path::PathBuf;

use crate::drift::Drift;
use crate::objstore::StoreError;

/// Result alias for shared primitives
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by shared primitives
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A state file exists but cannot be decoded. Never repaired automatically.
    #[error("corrupt state file {path}: {message}")]
    CorruptState { path: PathBuf, message: String },

    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("timeout after {seconds}s waiting for {description}")]
    Timeout { description: String, seconds: u64 },

    #[error("error waiting for {description}: {message}")]
    Wait {
        description: String,
        message: String,
    },

    #[error(transparent)]
    Drift(#[from] Drift),

    #[error("object store: {0}")]
    Store(#[from] StoreError),

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("cloud credentials for profile '{profile}' are not usable: {message}\n  {hint}")]
    Credentials {
        profile: String,
        message: String,
        hint: String,
    },
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }

    pub fn corrupt_state(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Error::CorruptState {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Whether the caller may reasonably retry the failed operation.
    ///
    /// A timed-out wait or a storage backend blip can be re-attempted;
    /// everything else is a configuration problem or a hard rejection.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout { .. } => true,
            Error::Store(e) => e.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeouts_are_retryable() {
        let timeout = Error::Timeout {
            description: "polaris".into(),
            seconds: 30,
        };
        assert!(timeout.is_retryable());
        assert!(!Error::validation("bad").is_retryable());
        assert!(!Error::corrupt_state("/tmp/x", "eof").is_retryable());
    }

    #[test]
    fn corrupt_state_names_the_file() {
        let err = Error::corrupt_state("/work/.snow-utils/setup-manifest.yaml", "bad indent");
        let msg = err.to_string();
        assert!(msg.contains("setup-manifest.yaml"));
        assert!(msg.contains("bad indent"));
    }
}

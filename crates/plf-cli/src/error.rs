//! Error types for the CLI

use std::path::PathBuf;

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Setup(#[from] plf_setup::SetupError),

    #[error(transparent)]
    Migrate(#[from] plf_migrate::MigrateError),

    #[error(transparent)]
    Common(#[from] plf_common::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid .env file {path}: {message}")]
    Env { path: PathBuf, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("command failed: {message}")]
    CommandFailed { message: String },

    /// Operator declined the confirmation prompt
    #[error("aborted")]
    Aborted,
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }

    pub fn command_failed(message: impl Into<String>) -> Self {
        Error::CommandFailed {
            message: message.into(),
        }
    }
}

//! Setup error types

use crate::catalog::CatalogError;
use crate::provisioner::ProvisionError;

/// Setup Result type
pub type Result<T> = std::result::Result<T, SetupError>;

/// Errors raised while creating, resuming or tearing down the environment
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error(transparent)]
    Common(#[from] plf_common::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cluster provisioner: {0}")]
    Provision(#[from] ProvisionError),

    #[error("catalog service: {0}")]
    Catalog(#[from] CatalogError),

    #[error("object store: {0}")]
    Store(#[from] plf_common::StoreError),

    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// A step's external call failed. The run stays IN_PROGRESS and the
    /// next resume re-attempts the same resource.
    #[error("{step} failed at resource {ordinal} ({label}): {source}")]
    Step {
        step: &'static str,
        ordinal: u8,
        label: String,
        #[source]
        source: Box<SetupError>,
    },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("command failed: {message}")]
    CommandFailed { message: String },
}

impl SetupError {
    pub fn validation(message: impl Into<String>) -> Self {
        SetupError::Validation {
            message: message.into(),
        }
    }

    pub fn command_failed(message: impl Into<String>) -> Self {
        SetupError::CommandFailed {
            message: message.into(),
        }
    }

    /// Ordinal of the resource a step failure is attributed to
    pub fn failed_ordinal(&self) -> Option<u8> {
        match self {
            SetupError::Step { ordinal, .. } => Some(*ordinal),
            _ => None,
        }
    }

    /// Whether re-running the same operation may succeed without operator action
    pub fn is_retryable(&self) -> bool {
        match self {
            SetupError::Common(e) => e.is_retryable(),
            SetupError::Provision(e) => e.is_retryable(),
            SetupError::Catalog(e) => e.is_retryable(),
            SetupError::Store(e) => e.is_retryable(),
            SetupError::Step { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

/// Extension trait to convert errors with Display to `SetupError::CommandFailed`.
pub trait CommandErrorExt<T> {
    fn cmd_err(self) -> Result<T>;
}

impl<T, E: std::fmt::Display> CommandErrorExt<T> for std::result::Result<T, E> {
    fn cmd_err(self) -> Result<T> {
        self.map_err(|e| SetupError::command_failed(e.to_string()))
    }
}

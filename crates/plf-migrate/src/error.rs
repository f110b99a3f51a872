//! Migration error types

use plf_common::{Drift, StoreError};
use plf_setup::CatalogError;

use crate::warehouse::WarehouseError;

/// Migration Result type
pub type Result<T> = std::result::Result<T, MigrateError>;

/// Errors raised by the migration pipeline
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    #[error(transparent)]
    Common(#[from] plf_common::Error),

    #[error("catalog: {0}")]
    Catalog(#[from] CatalogError),

    #[error("object store: {0}")]
    Store(#[from] StoreError),

    #[error("warehouse: {0}")]
    Warehouse(#[from] WarehouseError),

    /// Configured naming no longer matches what the cloud resources were
    /// created with
    #[error(transparent)]
    Drift(#[from] Drift),

    #[error("metadata document {key}: {message}")]
    Metadata { key: String, message: String },

    /// A prerequisite stage has not run yet
    #[error("{what} not found; run {command} first")]
    NotSetUp { what: String, command: String },

    #[error("validation error: {message}")]
    Validation { message: String },
}

impl MigrateError {
    pub fn validation(message: impl Into<String>) -> Self {
        MigrateError::Validation {
            message: message.into(),
        }
    }

    pub fn metadata(key: impl Into<String>, message: impl ToString) -> Self {
        MigrateError::Metadata {
            key: key.into(),
            message: message.to_string(),
        }
    }

    pub fn not_set_up(what: impl Into<String>, command: impl Into<String>) -> Self {
        MigrateError::NotSetUp {
            what: what.into(),
            command: command.into(),
        }
    }

    /// Whether re-running the same operation may succeed without operator action
    pub fn is_retryable(&self) -> bool {
        match self {
            MigrateError::Common(e) => e.is_retryable(),
            MigrateError::Catalog(e) => e.is_retryable(),
            MigrateError::Store(e) => e.is_retryable(),
            _ => false,
        }
    }
}

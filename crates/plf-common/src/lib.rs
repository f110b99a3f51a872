//! Shared primitives for plf
//!
//! Building blocks used by both the environment setup and the migration
//! pipeline. Nothing in here knows about a specific resource or table.

pub mod drift;
pub mod error;
pub mod fs;
pub mod identity;
pub mod naming;
pub mod objstore;
pub mod poll;
pub mod retry;
pub mod template;

pub use drift::{check as check_drift, ensure_consistent, Drift, DriftCheck, FieldDrift, Snapshot};
pub use error::{Error, Result};
pub use identity::verify_cloud_credentials;
pub use naming::{warehouse_table_name, ResourceBase};
pub use objstore::{ObjectEntry, ObjectStore, StoreError};
pub use poll::{wait_with_timeout, PollConfig, PollResult};
pub use retry::{retry_with_backoff, retry_with_backoff_if, RetryConfig};
pub use template::TemplateEngine;

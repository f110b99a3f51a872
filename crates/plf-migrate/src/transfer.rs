//! Transfer engine
//!
//! Planning is a key+size diff between two listings. Execution copies each
//! planned object independently with bounded retry; one object's failure
//! never stops the others.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use plf_common::{retry_with_backoff_if, ObjectEntry, ObjectStore, RetryConfig, StoreError};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

/// Objects to move for one table
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferPlan {
    /// Keys to copy, sorted
    pub keys: Vec<String>,
    /// Total size of the planned objects
    pub bytes: u64,
    /// Objects in the source listing
    pub source_objects: usize,
    /// Source objects already present at the destination with the same size
    pub skipped: usize,
}

impl TransferPlan {
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Keys that are new at the source or whose size differs.
///
/// With `force` every source key is planned.
pub fn plan(source: &[ObjectEntry], dest: &[ObjectEntry], force: bool) -> TransferPlan {
    let dest_sizes: HashMap<&str, u64> = dest.iter().map(|e| (e.key.as_str(), e.size)).collect();

    let mut planned: Vec<&ObjectEntry> = source
        .iter()
        .filter(|e| force || dest_sizes.get(e.key.as_str()) != Some(&e.size))
        .collect();
    planned.sort_by(|a, b| a.key.cmp(&b.key));

    TransferPlan {
        bytes: planned.iter().map(|e| e.size).sum(),
        source_objects: source.len(),
        skipped: source.len() - planned.len(),
        keys: planned.into_iter().map(|e| e.key.clone()).collect(),
    }
}

/// Hex sha256 over the sorted `key:size` lines of a listing
pub fn source_digest(entries: &[ObjectEntry]) -> String {
    let mut lines: Vec<String> = entries.iter().map(|e| format!("{}:{}", e.key, e.size)).collect();
    lines.sort();
    let mut hasher = Sha256::new();
    for line in lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Result of copying one object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectOutcome {
    pub key: String,
    pub result: Result<u64, StoreError>,
}

/// Per-table summary of an executed plan
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub transferred: u64,
    pub bytes: u64,
    /// First permanently failed object, as `key: error`
    pub error: Option<String>,
}

impl TransferSummary {
    pub fn from_outcomes(outcomes: &[ObjectOutcome]) -> Self {
        let mut summary = TransferSummary::default();
        for outcome in outcomes {
            match &outcome.result {
                Ok(bytes) => {
                    summary.transferred += 1;
                    summary.bytes += bytes;
                }
                Err(e) if summary.error.is_none() => {
                    summary.error = Some(format!("{}: {}", outcome.key, e));
                }
                Err(_) => {}
            }
        }
        summary
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Copies planned keys from one bucket to another
pub struct TransferEngine {
    source: Arc<dyn ObjectStore>,
    source_bucket: String,
    dest: Arc<dyn ObjectStore>,
    dest_bucket: String,
    retry: RetryConfig,
    concurrency: usize,
}

impl TransferEngine {
    /// Four attempts per object, waiting 1s, 2s and 4s between them
    pub fn default_retry() -> RetryConfig {
        RetryConfig::bounded(4, Duration::from_secs(1))
    }

    pub fn new(
        source: Arc<dyn ObjectStore>,
        source_bucket: impl Into<String>,
        dest: Arc<dyn ObjectStore>,
        dest_bucket: impl Into<String>,
    ) -> Self {
        Self {
            source,
            source_bucket: source_bucket.into(),
            dest,
            dest_bucket: dest_bucket.into(),
            retry: Self::default_retry(),
            concurrency: 1,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Objects copied at once. Retries of one object never hold up others.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn source_bucket(&self) -> &str {
        &self.source_bucket
    }

    pub fn dest_bucket(&self) -> &str {
        &self.dest_bucket
    }

    pub async fn list_source(&self, prefix: &str) -> Result<Vec<ObjectEntry>, StoreError> {
        self.source.list(&self.source_bucket, prefix).await
    }

    pub async fn list_dest(&self, prefix: &str) -> Result<Vec<ObjectEntry>, StoreError> {
        self.dest.list(&self.dest_bucket, prefix).await
    }

    /// Copy every planned key, returning one outcome per key in plan order.
    pub async fn execute(&self, plan: &TransferPlan) -> Vec<ObjectOutcome> {
        let total = plan.keys.len();
        let outcomes: Vec<ObjectOutcome> = stream::iter(plan.keys.iter().cloned())
            .map(|key| async move {
                let result = self.copy_with_retry(&key).await;
                ObjectOutcome { key, result }
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let copied = outcomes.iter().filter(|o| o.result.is_ok()).count();
        info!(copied, total, "transfer finished");
        outcomes
    }

    async fn copy_with_retry(&self, key: &str) -> Result<u64, StoreError> {
        let name = format!("copy {}", key);
        let result = retry_with_backoff_if(
            &self.retry,
            &name,
            || async {
                plf_common::objstore::copy_object(
                    self.source.as_ref(),
                    &self.source_bucket,
                    self.dest.as_ref(),
                    &self.dest_bucket,
                    key,
                )
                .await
            },
            StoreError::is_retryable,
        )
        .await;
        if let Ok(bytes) = &result {
            debug!(key, bytes, "copied");
        }
        result
    }
}

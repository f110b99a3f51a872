//! Object storage
//!
//! Two instances exist at runtime: the local S3-compatible store inside the
//! cluster (static keys, custom endpoint) and the cloud bucket (named
//! profile). Each client is built from explicit settings only; neither reads
//! the process environment, so local keys can never leak into the cloud
//! credential chain.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use aws_config::meta::region::ProvideRegion;
use aws_config::profile::{ProfileFileCredentialsProvider, ProfileFileRegionProvider};
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use bytes::Bytes;
use tracing::debug;

/// Region used when neither the flag, the recorded state nor the profile
/// names one
pub const DEFAULT_REGION: &str = "us-east-1";

/// Errors from an object store
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: s3://{bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("bucket not found: {bucket}")]
    NoSuchBucket { bucket: String },

    #[error("{operation} denied: {message}")]
    AccessDenied { operation: String, message: String },

    #[error("{operation} failed: {message}")]
    Backend { operation: String, message: String },
}

impl StoreError {
    pub fn backend(operation: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Backend {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Network and service failures are worth retrying; missing objects and
    /// rejected credentials are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Backend { .. })
    }
}

/// One listed object
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
}

/// Key/value blob store
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Every object under `prefix`, in key order.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectEntry>, StoreError>;

    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, StoreError>;

    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StoreError>;

    /// Succeeds when the object does not exist.
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError>;

    /// Succeeds when the bucket already exists and is ours.
    async fn create_bucket(&self, bucket: &str) -> Result<(), StoreError>;

    /// Succeeds when the bucket does not exist. The bucket must be empty.
    async fn delete_bucket(&self, bucket: &str) -> Result<(), StoreError>;
}

/// Copy one object between stores (which may be the same store).
pub async fn copy_object(
    source: &dyn ObjectStore,
    source_bucket: &str,
    dest: &dyn ObjectStore,
    dest_bucket: &str,
    key: &str,
) -> Result<u64, StoreError> {
    let body = source.get(source_bucket, key).await?;
    let len = body.len() as u64;
    dest.put(dest_bucket, key, body).await?;
    Ok(len)
}

/// Settings for the local S3-compatible store
#[derive(Clone, Debug)]
pub struct LocalStoreConfig {
    pub endpoint: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Settings for the cloud store
#[derive(Clone, Debug)]
pub struct CloudStoreConfig {
    /// Named profile from the shared AWS config files; `None` means `default`
    pub profile: Option<String>,
    pub region: String,
}

/// Resolve the cloud region: explicit value, then the profile's configured
/// region, then [`DEFAULT_REGION`].
pub async fn resolve_region(explicit: Option<&str>, profile: Option<&str>) -> String {
    if let Some(region) = explicit.filter(|r| !r.is_empty()) {
        return region.to_string();
    }
    let provider = ProfileFileRegionProvider::builder()
        .profile_name(profile.unwrap_or("default"))
        .build();
    match provider.region().await {
        Some(region) => region.to_string(),
        None => DEFAULT_REGION.to_string(),
    }
}

/// S3-backed [`ObjectStore`]
#[derive(Clone, Debug)]
pub struct S3Store {
    client: aws_sdk_s3::Client,
    region: String,
}

impl S3Store {
    /// Client for the in-cluster store: static keys, path-style addressing.
    pub fn local(config: &LocalStoreConfig) -> Self {
        let credentials = Credentials::new(
            config.access_key_id.clone(),
            config.secret_access_key.clone(),
            None,
            None,
            "plf-local",
        );
        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(DEFAULT_REGION))
            .credentials_provider(credentials)
            .endpoint_url(&config.endpoint)
            .force_path_style(true)
            .build();
        Self {
            client: aws_sdk_s3::Client::from_conf(s3_config),
            region: DEFAULT_REGION.to_string(),
        }
    }

    /// Client for the cloud bucket, credentials from the named profile only.
    pub fn cloud(config: &CloudStoreConfig) -> Self {
        let provider = ProfileFileCredentialsProvider::builder()
            .profile_name(config.profile.as_deref().unwrap_or("default"))
            .build();
        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(provider)
            .build();
        Self {
            client: aws_sdk_s3::Client::from_conf(s3_config),
            region: config.region.clone(),
        }
    }
}

fn sdk_error<E>(operation: &str, err: SdkError<E, HttpResponse>) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let message = DisplayErrorContext(&err).to_string();
    if let SdkError::ServiceError(service) = &err {
        if matches!(service.raw().status().as_u16(), 401 | 403) {
            return StoreError::AccessDenied {
                operation: operation.to_string(),
                message,
            };
        }
    }
    StoreError::backend(operation, message)
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectEntry>, StoreError> {
        let mut entries = Vec::new();
        let mut continuation_token = None;

        loop {
            let resp = match self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(continuation_token)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(SdkError::ServiceError(err)) if err.err().is_no_such_bucket() => {
                    return Err(StoreError::NoSuchBucket {
                        bucket: bucket.to_string(),
                    })
                }
                Err(err) => return Err(sdk_error("ListObjectsV2", err)),
            };

            for object in resp.contents() {
                if let Some(key) = object.key() {
                    entries.push(ObjectEntry {
                        key: key.to_string(),
                        size: object.size().unwrap_or(0).max(0) as u64,
                    });
                }
            }

            if resp.next_continuation_token().is_some() {
                continuation_token = resp.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }

        entries.sort();
        debug!(bucket, prefix, count = entries.len(), "listed objects");
        Ok(entries)
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, StoreError> {
        let resp = match self.client.get_object().bucket(bucket).key(key).send().await {
            Ok(resp) => resp,
            Err(SdkError::ServiceError(err)) if err.err().is_no_such_key() => {
                return Err(StoreError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                })
            }
            Err(err) => return Err(sdk_error("GetObject", err)),
        };
        let body = resp
            .body
            .collect()
            .await
            .map_err(|e| StoreError::backend("GetObject", e.to_string()))?;
        Ok(body.into_bytes())
    }

    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| sdk_error("PutObject", e))?;
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| sdk_error("DeleteObject", e))?;
        Ok(())
    }

    async fn create_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        let mut req = self.client.create_bucket().bucket(bucket);
        if self.region != DEFAULT_REGION {
            req = req.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }
        match req.send().await {
            Ok(_) => Ok(()),
            Err(SdkError::ServiceError(err)) if err.err().is_bucket_already_owned_by_you() => {
                debug!(bucket, "bucket already exists");
                Ok(())
            }
            Err(err) => Err(sdk_error("CreateBucket", err)),
        }
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        match self.client.delete_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(()),
            Err(SdkError::ServiceError(err)) if err.raw().status().as_u16() == 404 => Ok(()),
            Err(err) => Err(sdk_error("DeleteBucket", err)),
        }
    }
}

/// In-memory [`ObjectStore`].
///
/// Supports scripted failures so transfer and pipeline behaviour can be
/// exercised without a network.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    buckets: BTreeMap<String, BTreeMap<String, Bytes>>,
    /// key -> remaining failures (`u32::MAX` = always)
    failures: HashMap<String, u32>,
    gets: u64,
    puts: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::backend("lock", "memory store lock poisoned"))
    }

    /// Insert an object directly, creating the bucket if needed.
    pub fn insert(&self, bucket: &str, key: &str, body: impl Into<Bytes>) {
        if let Ok(mut inner) = self.lock() {
            inner
                .buckets
                .entry(bucket.to_string())
                .or_default()
                .insert(key.to_string(), body.into());
        }
    }

    /// Make every get/put of `key` fail.
    pub fn fail_always(&self, key: &str) {
        if let Ok(mut inner) = self.lock() {
            inner.failures.insert(key.to_string(), u32::MAX);
        }
    }

    /// Make the next `times` gets/puts of `key` fail.
    pub fn fail_times(&self, key: &str, times: u32) {
        if let Ok(mut inner) = self.lock() {
            inner.failures.insert(key.to_string(), times);
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut inner) = self.lock() {
            inner.failures.clear();
        }
    }

    /// Contents of one object, if present.
    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.lock()
            .ok()?
            .buckets
            .get(bucket)?
            .get(key)
            .cloned()
    }

    pub fn has_bucket(&self, bucket: &str) -> bool {
        self.lock()
            .map(|inner| inner.buckets.contains_key(bucket))
            .unwrap_or(false)
    }

    /// Number of (get, put) calls served so far
    pub fn call_counts(&self) -> (u64, u64) {
        self.lock()
            .map(|inner| (inner.gets, inner.puts))
            .unwrap_or_default()
    }
}

impl MemoryInner {
    fn injected_failure(&mut self, operation: &str, key: &str) -> Result<(), StoreError> {
        match self.failures.get_mut(key) {
            Some(0) | None => Ok(()),
            Some(remaining) => {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                Err(StoreError::backend(operation, format!("injected failure for {key}")))
            }
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectEntry>, StoreError> {
        let inner = self.lock()?;
        let objects = inner.buckets.get(bucket).ok_or_else(|| StoreError::NoSuchBucket {
            bucket: bucket.to_string(),
        })?;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| ObjectEntry {
                key: k.clone(),
                size: v.len() as u64,
            })
            .collect())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, StoreError> {
        let mut inner = self.lock()?;
        inner.gets += 1;
        inner.injected_failure("GetObject", key)?;
        inner
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.puts += 1;
        inner.injected_failure("PutObject", key)?;
        let objects = inner
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| StoreError::NoSuchBucket {
                bucket: bucket.to_string(),
            })?;
        objects.insert(key.to_string(), body);
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if let Some(objects) = inner.buckets.get_mut(bucket) {
            objects.remove(key);
        }
        Ok(())
    }

    async fn create_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        self.lock()?.buckets.entry(bucket.to_string()).or_default();
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        match inner.buckets.get(bucket) {
            Some(objects) if !objects.is_empty() => Err(StoreError::backend(
                "DeleteBucket",
                format!("bucket {bucket} is not empty"),
            )),
            _ => {
                inner.buckets.remove(bucket);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_is_prefix_scoped_and_sorted() {
        let store = MemoryStore::new();
        store.insert("warehouse", "wildlife/penguins/data/b.parquet", "bb");
        store.insert("warehouse", "wildlife/penguins/data/a.parquet", "a");
        store.insert("warehouse", "wildlife/puffins/data/c.parquet", "ccc");

        let entries = store.list("warehouse", "wildlife/penguins/").await.unwrap();
        assert_eq!(
            entries,
            vec![
                ObjectEntry { key: "wildlife/penguins/data/a.parquet".into(), size: 1 },
                ObjectEntry { key: "wildlife/penguins/data/b.parquet".into(), size: 2 },
            ]
        );
    }

    #[tokio::test]
    async fn missing_bucket_and_key_are_distinct() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.list("nope", "").await,
            Err(StoreError::NoSuchBucket { .. })
        ));
        store.create_bucket("b").await.unwrap();
        let err = store.get("b", "k").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert!(!err.is_retryable());
        let denied = StoreError::AccessDenied {
            operation: "GetObject".into(),
            message: "403".into(),
        };
        assert!(!denied.is_retryable());
    }

    #[tokio::test]
    async fn injected_failures_run_out() {
        let store = MemoryStore::new();
        store.insert("b", "k", "v");
        store.fail_times("k", 2);

        assert!(store.get("b", "k").await.unwrap_err().is_retryable());
        assert!(store.get("b", "k").await.is_err());
        assert_eq!(store.get("b", "k").await.unwrap(), Bytes::from("v"));
    }

    #[tokio::test]
    async fn copy_between_stores() {
        let local = MemoryStore::new();
        let cloud = MemoryStore::new();
        local.insert("polardb", "ns/t/data/f.parquet", "12345");
        cloud.create_bucket("dest").await.unwrap();

        let copied = copy_object(&local, "polardb", &cloud, "dest", "ns/t/data/f.parquet")
            .await
            .unwrap();
        assert_eq!(copied, 5);
        assert_eq!(cloud.object("dest", "ns/t/data/f.parquet").unwrap(), Bytes::from("12345"));
    }

    #[tokio::test]
    async fn bucket_must_be_empty_to_delete() {
        let store = MemoryStore::new();
        store.insert("b", "k", "v");
        assert!(store.delete_bucket("b").await.is_err());
        store.delete("b", "k").await.unwrap();
        store.delete_bucket("b").await.unwrap();
        assert!(!store.has_bucket("b"));
        store.delete_bucket("b").await.unwrap();
    }
}

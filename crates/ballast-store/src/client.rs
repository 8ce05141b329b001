//! Typed facade over the object store backend.
//!
//! One `ObjectClient` is shared by every session of a server process. The
//! backend handles transient retries; this layer adds bounded outbound
//! concurrency and maps conditional-write results into explicit outcomes.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use object_store::aws::{AmazonS3Builder, S3ConditionalPut};
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{
    BackoffConfig, ClientOptions, ObjectStore, PutMode, PutOptions, PutPayload, RetryConfig,
    UpdateVersion,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::debug;

use crate::error::{StoreError, StoreResult};

/// Maximum retry attempts for transient backend failures
const MAX_ATTEMPTS: usize = 5;
/// TCP connect budget per request
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Full request budget (headers + body)
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Cap on concurrent outbound requests across all sessions
const MAX_IN_FLIGHT: usize = 64;
/// Key probed at startup to verify the endpoint is reachable
const PROBE_KEY: &str = ".ballast-probe";

/// Connection settings for an S3-compatible endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    /// Endpoint URL (e.g. `http://localhost:9000`)
    pub endpoint: String,
    /// Access key id
    pub access_key: String,
    /// Secret access key
    pub secret_key: String,
    /// Bucket holding all exports
    pub bucket: String,
    /// Region name
    pub region: String,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9000".to_string(),
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            bucket: "ballast".to_string(),
            region: "us-east-1".to_string(),
        }
    }
}

/// Result of a successful conditional put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    /// Etag of the newly written object
    pub etag: String,
}

/// Client over an object store backend with bounded concurrency.
#[derive(Debug)]
pub struct ObjectClient {
    store: Arc<dyn ObjectStore>,
    permits: Semaphore,
}

impl ObjectClient {
    /// Connect to an S3-compatible endpoint.
    ///
    /// Retries transient failures with exponential backoff and jitter, at
    /// most [`MAX_ATTEMPTS`] times. Conditional-write conflicts are never
    /// retried.
    pub fn for_s3(config: &S3Config) -> StoreResult<Self> {
        let retry = RetryConfig {
            backoff: BackoffConfig {
                init_backoff: Duration::from_millis(100),
                max_backoff: Duration::from_secs(10),
                base: 2.0,
            },
            max_retries: MAX_ATTEMPTS,
            retry_timeout: Duration::from_secs(120),
        };

        let store = AmazonS3Builder::new()
            .with_endpoint(config.endpoint.clone())
            .with_access_key_id(config.access_key.clone())
            .with_secret_access_key(config.secret_key.clone())
            .with_bucket_name(config.bucket.clone())
            .with_region(config.region.clone())
            .with_allow_http(true)
            .with_virtual_hosted_style_request(false)
            .with_conditional_put(S3ConditionalPut::ETagMatch)
            .with_retry(retry)
            .with_client_options(
                ClientOptions::new()
                    .with_connect_timeout(CONNECT_TIMEOUT)
                    .with_timeout(REQUEST_TIMEOUT),
            )
            .build()
            .map_err(|e| StoreError::Config(e.to_string()))?;

        debug!(
            endpoint = %config.endpoint,
            bucket = %config.bucket,
            region = %config.region,
            "object client connected"
        );
        Ok(Self::with_store(Arc::new(store)))
    }

    /// In-memory backend, used by tests and local experiments.
    pub fn in_memory() -> Self {
        Self::with_store(Arc::new(InMemory::new()))
    }

    fn with_store(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            permits: Semaphore::new(MAX_IN_FLIGHT),
        }
    }

    async fn permit(&self) -> StoreResult<SemaphorePermit<'_>> {
        self.permits
            .acquire()
            .await
            .map_err(|_| StoreError::Unavailable("object client closed".to_string()))
    }

    /// Fetch an object. `Ok(None)` when the key does not exist.
    pub async fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        Ok(self.get_with_etag(key).await?.map(|(bytes, _)| bytes))
    }

    /// Fetch an object together with its etag.
    pub async fn get_with_etag(&self, key: &str) -> StoreResult<Option<(Bytes, String)>> {
        let _permit = self.permit().await?;
        match self.store.get(&Path::from(key)).await {
            Ok(result) => {
                let etag = result
                    .meta
                    .e_tag
                    .clone()
                    .ok_or_else(|| StoreError::MissingEtag(key.to_string()))?;
                let bytes = result.bytes().await.map_err(StoreError::from_backend)?;
                Ok(Some((bytes, etag)))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(StoreError::from_backend(e)),
        }
    }

    /// Unconditional put.
    pub async fn put(&self, key: &str, data: Bytes) -> StoreResult<()> {
        let _permit = self.permit().await?;
        self.store
            .put(&Path::from(key), PutPayload::from(data))
            .await
            .map_err(StoreError::from_backend)?;
        Ok(())
    }

    /// Create the object only if it does not already exist
    /// (S3 `If-None-Match: *`). Loses with [`StoreError::AlreadyExists`].
    pub async fn put_if_absent(&self, key: &str, data: Bytes) -> StoreResult<PutOutcome> {
        self.put_with_mode(key, data, PutMode::Create).await
    }

    /// Replace the object only if its etag still matches (S3 `If-Match`).
    /// Loses with [`StoreError::PreconditionFailed`].
    pub async fn put_if_match(&self, key: &str, data: Bytes, etag: &str) -> StoreResult<PutOutcome> {
        let mode = PutMode::Update(UpdateVersion {
            e_tag: Some(etag.to_string()),
            version: None,
        });
        self.put_with_mode(key, data, mode).await
    }

    async fn put_with_mode(&self, key: &str, data: Bytes, mode: PutMode) -> StoreResult<PutOutcome> {
        let _permit = self.permit().await?;
        let result = self
            .store
            .put_opts(&Path::from(key), PutPayload::from(data), PutOptions::from(mode))
            .await
            .map_err(StoreError::from_backend)?;
        let etag = result
            .e_tag
            .ok_or_else(|| StoreError::MissingEtag(key.to_string()))?;
        Ok(PutOutcome { etag })
    }

    /// Etag of an object, or `Ok(None)` when absent.
    pub async fn head(&self, key: &str) -> StoreResult<Option<String>> {
        let _permit = self.permit().await?;
        match self.store.head(&Path::from(key)).await {
            Ok(meta) => Ok(Some(meta.e_tag.unwrap_or_default())),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(StoreError::from_backend(e)),
        }
    }

    /// Startup reachability probe. A missing probe key is fine; only an
    /// unreachable or misconfigured backend is an error.
    pub async fn probe(&self) -> StoreResult<()> {
        self.head(PROBE_KEY).await.map(|_| ())
    }
}

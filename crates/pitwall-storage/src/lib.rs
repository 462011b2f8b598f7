//! Document stores, the idempotent upsert engine, and the HTTP fetch utilities used by
//! upstream providers.

mod memory;
mod mongo;
mod upsert;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use pitwall_core::{Record, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};

pub use memory::MemoryStore;
pub use mongo::{record_to_bson, value_to_bson, MongoStore};
pub use upsert::{PartialWriteError, SyncReport, UpsertEngine, UpsertError, WriteFailure};

pub const CRATE_NAME: &str = "pitwall-storage";

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Where and how to reach the target document store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub uri: String,
    pub database: String,
    /// Bound on connection establishment and server selection.
    pub connect_timeout: Duration,
    pub app_name: Option<String>,
}

impl StoreConfig {
    pub fn new(uri: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            database: database.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            app_name: Some("pitwall".to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document store unreachable: {0}")]
    Connectivity(String),
    #[error("invalid connection address: {0}")]
    InvalidAddress(String),
    #[error("unique index on {collection}.{field} could not be created: {message}")]
    Index {
        collection: String,
        field: String,
        message: String,
    },
}

/// One conditional write: match on `filter_field == filter_value`, overwrite every field in
/// `set`, and apply `set_on_insert` only when the match creates a new document.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOp {
    /// Position of the source document in the caller's batch.
    pub position: usize,
    pub filter_field: String,
    pub filter_value: Value,
    pub set: Record,
    pub set_on_insert: Record,
}

/// Per-operation failure reported by a bulk write. `op_index` indexes the submitted slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpError {
    pub op_index: usize,
    pub code: Option<i32>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkWriteOutcome {
    pub matched: u64,
    pub modified: u64,
    /// Indexes (into the submitted slice) of operations that created a document.
    pub upserted: Vec<usize>,
    pub errors: Vec<OpError>,
}

/// A named-collection document store supporting unique indexes and unordered bulk upserts.
///
/// Every operation in a bulk call must be applied atomically on its own; a failing operation
/// must not prevent its siblings from being applied.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn describe(&self) -> String;

    async fn ping(&self) -> Result<(), StoreError>;

    /// Idempotent: an existing equivalent unique index is success.
    async fn ensure_unique_index(&self, collection: &str, field: &str) -> Result<(), StoreError>;

    async fn bulk_upsert(
        &self,
        collection: &str,
        ops: &[UpsertOp],
    ) -> Result<BulkWriteOutcome, StoreError>;
}

#[async_trait]
impl<S: DocumentStore + ?Sized> DocumentStore for Box<S> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        (**self).ping().await
    }

    async fn ensure_unique_index(&self, collection: &str, field: &str) -> Result<(), StoreError> {
        (**self).ensure_unique_index(collection, field).await
    }

    async fn bulk_upsert(
        &self,
        collection: &str,
        ops: &[UpsertOp],
    ) -> Result<BulkWriteOutcome, StoreError> {
        (**self).bulk_upsert(collection, ops).await
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            token_bucket: Some(TokenBucketConfig {
                capacity: 4,
                refill_every: Duration::from_millis(250),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Client-side request pacing for rate-limited public APIs.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Single-attempt HTTP fetcher. Failures surface to the caller as-is; there is no retry.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            token_bucket,
        })
    }

    /// Body of a successful GET on `url`.
    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?.to_vec();
            debug!(bytes = body.len(), %final_url, "fetched");
            Ok(body)
        }
        .instrument(info_span!("http_fetch", url))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_bucket_hands_out_its_capacity_without_waiting() {
        let bucket = SimpleTokenBucket::new(3, Duration::from_secs(60));
        let started = Instant::now();
        for _ in 0..3 {
            bucket.take().await;
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn store_config_defaults_to_bounded_connect_timeout() {
        let config = StoreConfig::new("mongodb://localhost:27017", "visionf1");
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.database, "visionf1");
    }
}

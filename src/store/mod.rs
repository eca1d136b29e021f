//! External-store seams: time-series persistence and key-value/pub-sub.
//!
//! The concrete storage engines live outside this crate; the core only
//! depends on the two traits here. [`memory`] provides in-process
//! implementations used by tests and the demo binary.

pub mod memory;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// A single sample to append: timestamp plus named fields.
#[derive(Debug, Clone)]
pub struct DataPoint {
    /// Sample timestamp.
    pub timestamp: DateTime<Utc>,
    /// Field name → value. Scalars and structured payloads both pass
    /// through as JSON values.
    pub fields: BTreeMap<String, Value>,
}

/// A stored sample returned by a range query, with the tags it was
/// written under.
#[derive(Debug, Clone)]
pub struct Record {
    /// Sample timestamp.
    pub timestamp: DateTime<Utc>,
    /// Tags attached at write time.
    pub tags: BTreeMap<String, String>,
    /// Field name → value.
    pub fields: BTreeMap<String, Value>,
}

/// An ordered (ascending by timestamp) query result.
pub type Series = Vec<Record>;

/// Append/query access to tagged time-series measurements.
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// Appends `points` to `measurement`, all tagged with `tags`.
    async fn append_points(
        &self,
        measurement: &str,
        tags: &BTreeMap<String, String>,
        points: Vec<DataPoint>,
    ) -> Result<()>;

    /// Returns records in `[start, stop)` whose tags contain every entry
    /// of `tags` and, when `fields` is non-empty, at least one of the
    /// requested fields (other fields are stripped from the result).
    /// Ordered by timestamp ascending.
    async fn range_query(
        &self,
        measurement: &str,
        fields: &[String],
        tags: &BTreeMap<String, String>,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<Series>;
}

/// A message delivered on a pub/sub channel.
#[derive(Debug, Clone)]
pub struct Message {
    /// Channel the message was published on.
    pub channel: String,
    /// JSON payload.
    pub payload: Value,
}

/// An open subscription; dropped to unsubscribe.
pub struct Subscription {
    pub(crate) receiver: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    /// Waits for the next message; `None` once the channel is closed.
    pub async fn next(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }
}

/// TTL-capable key/value cache plus pub/sub transport.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Reads a key; `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Writes a key without expiration.
    async fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Writes a key that expires after `ttl`.
    async fn set_with_ttl(&self, key: &str, value: Value, ttl: Duration) -> Result<()>;

    /// Atomically writes a key with `ttl` only when it is absent (or
    /// expired). Returns `true` when this call performed the write.
    async fn set_if_absent(&self, key: &str, value: Value, ttl: Duration) -> Result<bool>;

    /// Publishes a payload to every current subscriber of `channel`.
    async fn publish(&self, channel: &str, payload: Value) -> Result<()>;

    /// Opens a subscription to `channel`.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}

/// Reads and decodes a key into `T`; `None` when absent.
pub async fn get_typed<T: DeserializeOwned>(
    kv: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>> {
    match kv.get(key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Encodes and writes a value under `key` with `ttl`.
pub async fn set_typed_with_ttl<T: Serialize>(
    kv: &dyn KeyValueStore,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<()> {
    kv.set_with_ttl(key, serde_json::to_value(value)?, ttl).await
}

/// Bounds a store call with a caller-supplied timeout.
///
/// A timed-out call surfaces as [`Error::StoreUnavailable`] so the owning
/// tick/request loop can retry with backoff; it never stalls the caller.
pub async fn with_timeout<T>(
    timeout: Duration,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::store(format!(
            "call exceeded timeout of {}s",
            timeout.as_secs_f64()
        ))),
    }
}

/// Bounded exponential backoff with jitter for background retry loops.
///
/// Doubles from the configured base per consecutive failure, capped at the
/// configured ceiling, with up to one extra base-interval of random jitter
/// so restarted replicas do not retry in lockstep.
pub fn retry_backoff(config: &crate::config::StoreConfig, consecutive_failures: u32) -> Duration {
    use rand::Rng;

    let base = config.retry_backoff_secs.max(1);
    let cap = config.retry_backoff_max_secs.max(base);
    let exponent = consecutive_failures.saturating_sub(1).min(16);
    let scaled = base.saturating_mul(1u64 << exponent).min(cap);
    let jitter = rand::rng().random_range(0.0..config.retry_backoff_secs.max(1) as f64);
    Duration::from_secs_f64(scaled as f64 + jitter)
}

/// Builds a tag map from `(key, value)` pairs.
pub fn tags<const N: usize>(pairs: [(&str, &str); N]) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

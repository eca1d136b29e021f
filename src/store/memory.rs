//! In-process store implementation backing tests and the demo binary.
//!
//! TTL expiry is evaluated lazily against `tokio::time::Instant`, so tests
//! running under `tokio::time::pause` can fast-forward expirations.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::Result;

use super::{DataPoint, KeyValueStore, Message, Record, Series, Subscription, TimeSeriesStore};

struct KvEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl KvEntry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Shared in-memory store implementing both store traits.
///
/// Wrap in an `Arc` and hand the same instance to every subsystem — the
/// pub/sub channels only connect subscribers of the same instance.
#[derive(Default)]
pub struct MemoryStore {
    series: Mutex<HashMap<String, Vec<Record>>>,
    kv: Mutex<HashMap<String, KvEntry>>,
    channels: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Message>>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-expired) keys, for test assertions.
    pub fn kv_len(&self) -> usize {
        let now = Instant::now();
        self.kv.lock().values().filter(|e| !e.expired(now)).count()
    }
}

#[async_trait]
impl TimeSeriesStore for MemoryStore {
    async fn append_points(
        &self,
        measurement: &str,
        tags: &BTreeMap<String, String>,
        points: Vec<DataPoint>,
    ) -> Result<()> {
        let mut series = self.series.lock();
        let records = series.entry(measurement.to_string()).or_default();
        for point in points {
            records.push(Record {
                timestamp: point.timestamp,
                tags: tags.clone(),
                fields: point.fields,
            });
        }
        records.sort_by_key(|r| r.timestamp);
        Ok(())
    }

    async fn range_query(
        &self,
        measurement: &str,
        fields: &[String],
        tags: &BTreeMap<String, String>,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<Series> {
        let series = self.series.lock();
        let Some(records) = series.get(measurement) else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        for record in records {
            if record.timestamp < start || record.timestamp >= stop {
                continue;
            }
            if !tags
                .iter()
                .all(|(k, v)| record.tags.get(k).is_some_and(|tv| tv == v))
            {
                continue;
            }
            if fields.is_empty() {
                out.push(record.clone());
                continue;
            }
            let selected: BTreeMap<String, Value> = record
                .fields
                .iter()
                .filter(|(name, _)| fields.iter().any(|f| f == *name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect();
            if !selected.is_empty() {
                out.push(Record {
                    timestamp: record.timestamp,
                    tags: record.tags.clone(),
                    fields: selected,
                });
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let now = Instant::now();
        let mut kv = self.kv.lock();
        match kv.get(key) {
            Some(entry) if entry.expired(now) => {
                kv.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.kv.lock().insert(
            key.to_string(),
            KvEntry {
                value,
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: Value, ttl: Duration) -> Result<()> {
        self.kv.lock().insert(
            key.to_string(),
            KvEntry {
                value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: Value, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut kv = self.kv.lock();
        if let Some(entry) = kv.get(key) {
            if !entry.expired(now) {
                return Ok(false);
            }
        }
        kv.insert(
            key.to_string(),
            KvEntry {
                value,
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn publish(&self, channel: &str, payload: Value) -> Result<()> {
        let mut channels = self.channels.lock();
        if let Some(senders) = channels.get_mut(channel) {
            senders.retain(|sender| {
                sender
                    .send(Message {
                        channel: channel.to_string(),
                        payload: payload.clone(),
                    })
                    .is_ok()
            });
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(sender);
        Ok(Subscription { receiver })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::store::tags;

    fn ts(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, hour, minute, 0).unwrap()
    }

    #[tokio::test]
    async fn range_query_filters_by_window_and_tags() {
        let store = MemoryStore::new();
        let device_tags = tags([("device_id", "heater_1")]);
        let other_tags = tags([("device_id", "heater_2")]);

        for (point_tags, hour) in [(&device_tags, 8), (&device_tags, 12), (&other_tags, 12)] {
            store
                .append_points(
                    "net_power",
                    point_tags,
                    vec![DataPoint {
                        timestamp: ts(hour, 0),
                        fields: BTreeMap::from([("value".to_string(), json!(1.5))]),
                    }],
                )
                .await
                .unwrap();
        }

        let result = store
            .range_query("net_power", &[], &device_tags, ts(9, 0), ts(13, 0))
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].timestamp, ts(12, 0));
    }

    #[tokio::test]
    async fn range_query_stop_is_exclusive() {
        let store = MemoryStore::new();
        store
            .append_points(
                "net_power",
                &BTreeMap::new(),
                vec![DataPoint {
                    timestamp: ts(10, 0),
                    fields: BTreeMap::from([("value".to_string(), json!(2.0))]),
                }],
            )
            .await
            .unwrap();

        let result = store
            .range_query("net_power", &[], &BTreeMap::new(), ts(9, 0), ts(10, 0))
            .await
            .unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_keys() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("marker", json!(true), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(store.get("marker").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(store.get("marker").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn set_if_absent_is_exclusive_until_expiry() {
        let store = MemoryStore::new();
        let won = store
            .set_if_absent("marker", json!(1), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(won);

        let second = store
            .set_if_absent("marker", json!(2), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(!second);

        tokio::time::advance(Duration::from_secs(31)).await;
        let after_expiry = store
            .set_if_absent("marker", json!(3), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(after_expiry);
    }

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let store = MemoryStore::new();
        let mut first = store.subscribe("requests").await.unwrap();
        let mut second = store.subscribe("requests").await.unwrap();

        store.publish("requests", json!({"id": 7})).await.unwrap();

        assert_eq!(first.next().await.unwrap().payload["id"], 7);
        assert_eq!(second.next().await.unwrap().payload["id"], 7);
    }
}

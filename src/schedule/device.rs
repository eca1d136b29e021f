//! Non-recurring, priority-ranked schedules for a single device.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::config::MonitorConfig;
use crate::devices::DeviceRegistry;
use crate::error::{Error, Result};
use crate::store::{DataPoint, KeyValueStore, TimeSeriesStore, tags};

use super::model::{
    ControlChannel, ControlType, EventValue, ScheduleEvent, ScheduleEventData, Scheduler,
};

/// Key-value prefix for per-device schedule version stamps, bumped on
/// every dispatch write and checked by the monitor's registry.
pub const SCHEDULE_VERSION_PREFIX: &str = "schedule_version:";

/// Resolves persisted priority dispatches for one `(device, channel)` pair.
///
/// The scheduler itself is stateless: every query goes back to the store,
/// so a rewritten schedule is picked up immediately.
pub struct DeviceScheduler {
    device_id: String,
    channel: ControlChannel,
    store: Arc<dyn TimeSeriesStore>,
    config: MonitorConfig,
}

/// One parsed dispatch record from the store.
struct Candidate {
    event: ScheduleEvent,
    priority: u8,
    written_at: String,
    source: ControlType,
}

impl DeviceScheduler {
    /// Binds a scheduler to one device and control channel.
    pub fn new(
        device_id: impl Into<String>,
        channel: ControlChannel,
        store: Arc<dyn TimeSeriesStore>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            channel,
            store,
            config,
        }
    }

    /// Persists a priority-ranked schedule for one or more devices.
    ///
    /// Each device's dispatch map (timestamp → value) is translated into
    /// contiguous events: every entry ends where the next begins, and the
    /// final entry stays in force for `config.dispatch_horizon()`.
    /// Devices not present in the registry are logged and skipped; the
    /// remaining devices are still written.
    ///
    /// `from_direct_control` tags the write as a direct command instead of
    /// a priority dispatch, which downstream consumers use for provenance
    /// only.
    ///
    /// # Errors
    ///
    /// `Error::InvalidPriority` when `priority > 100`;
    /// `Error::EmptyDispatch` when no device carries any entry.
    pub async fn save_schedule(
        store: &dyn TimeSeriesStore,
        kv: &dyn KeyValueStore,
        devices: &DeviceRegistry,
        config: &MonitorConfig,
        priority: u8,
        dispatches: &BTreeMap<String, BTreeMap<DateTime<Utc>, EventValue>>,
        from_direct_control: bool,
    ) -> Result<()> {
        if priority > 100 {
            return Err(Error::InvalidPriority(priority));
        }
        if dispatches.values().all(BTreeMap::is_empty) {
            return Err(Error::EmptyDispatch);
        }

        let written_at = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
        let source = if from_direct_control {
            ControlType::DirectControl
        } else {
            ControlType::PriorityDispatch
        };

        for (device_id, dispatch) in dispatches {
            if dispatch.is_empty() {
                continue;
            }
            let Some(device) = devices.get(device_id) else {
                error!(%device_id, "device is not installed on the building, skipping dispatch");
                continue;
            };

            let events = events_from_dispatch(dispatch, config.dispatch_horizon_secs)?;
            let channel = device.device_type.dispatch_channel();
            let point_tags = tags([
                ("device_id", device_id.as_str()),
                ("channel", channel.as_tag()),
                ("priority", &priority.to_string()),
                ("control", source.as_tag()),
                ("written_at", &written_at),
            ]);

            let points = events
                .iter()
                .map(|event| DataPoint {
                    timestamp: event.start,
                    fields: BTreeMap::from([
                        ("value".to_string(), event.value.0.clone()),
                        (
                            "end".to_string(),
                            Value::from(event.end.to_rfc3339_opts(SecondsFormat::Secs, true)),
                        ),
                    ]),
                })
                .collect();

            store
                .append_points(&config.schedule_measurement, &point_tags, points)
                .await?;

            kv.set(
                &format!("{SCHEDULE_VERSION_PREFIX}{device_id}"),
                Value::from(written_at.clone()),
            )
            .await?;

            debug!(
                %device_id,
                priority,
                events = events.len(),
                from_direct_control,
                "dispatch schedule written"
            );
        }

        Ok(())
    }

    /// Resolves the covering event at `time_target` from the
    /// highest-priority tier that has one.
    ///
    /// Tiers without a covering event do not block the search; an equal
    /// priority is broken in favor of the most recent write. Events that
    /// started more than `config.lookback_hours` before the target are
    /// outside the scan window.
    pub async fn get_event_data(
        &self,
        time_target: DateTime<Utc>,
    ) -> Result<Option<ScheduleEventData>> {
        let start = time_target - ChronoDuration::hours(self.config.lookback_hours as i64);
        let stop = time_target + ChronoDuration::microseconds(1);
        let query_tags = tags([
            ("device_id", self.device_id.as_str()),
            ("channel", self.channel.as_tag()),
        ]);

        let records = self
            .store
            .range_query(&self.config.schedule_measurement, &[], &query_tags, start, stop)
            .await?;

        let mut best: Option<Candidate> = None;
        for record in records {
            let Some(candidate) = parse_candidate(&record.tags, &record.fields, record.timestamp)
            else {
                warn!(
                    device_id = %self.device_id,
                    timestamp = %record.timestamp,
                    "skipping malformed dispatch record"
                );
                continue;
            };
            if !candidate.event.covers(time_target) {
                continue;
            }
            let replaces = match &best {
                None => true,
                Some(current) => {
                    (candidate.priority, candidate.written_at.as_str())
                        > (current.priority, current.written_at.as_str())
                }
            };
            if replaces {
                best = Some(candidate);
            }
        }

        Ok(best.map(|c| ScheduleEventData {
            value: c.event.value,
            source: c.source,
            changed: false,
        }))
    }
}

#[async_trait]
impl Scheduler for DeviceScheduler {
    async fn get_event_data(&self, timestamp: DateTime<Utc>) -> Result<Option<ScheduleEventData>> {
        DeviceScheduler::get_event_data(self, timestamp).await
    }
}

/// Translates a sorted timestamp → value map into contiguous events.
fn events_from_dispatch(
    dispatch: &BTreeMap<DateTime<Utc>, EventValue>,
    horizon_secs: u64,
) -> Result<Vec<ScheduleEvent>> {
    let stamps: Vec<&DateTime<Utc>> = dispatch.keys().collect();
    let mut events = Vec::with_capacity(dispatch.len());
    for (i, (start, value)) in dispatch.iter().enumerate() {
        let end = match stamps.get(i + 1) {
            Some(next) => **next,
            None => *start + ChronoDuration::seconds(horizon_secs as i64),
        };
        events.push(ScheduleEvent::new(*start, end, value.clone())?);
    }
    Ok(events)
}

/// Parses one stored record into a candidate, `None` on any malformed part.
fn parse_candidate(
    tags: &BTreeMap<String, String>,
    fields: &BTreeMap<String, Value>,
    timestamp: DateTime<Utc>,
) -> Option<Candidate> {
    let priority: u8 = tags.get("priority")?.parse().ok()?;
    let written_at = tags.get("written_at")?.clone();
    let source = ControlType::from_tag(tags.get("control")?)?;
    let value = EventValue(fields.get("value")?.clone());
    let end = DateTime::parse_from_rfc3339(fields.get("end")?.as_str()?)
        .ok()?
        .with_timezone(&Utc);
    let event = ScheduleEvent::new(timestamp, end, value).ok()?;
    Some(Candidate {
        event,
        priority,
        written_at,
        source,
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::store::memory::MemoryStore;

    fn ts(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, hour, minute, 0).unwrap()
    }

    fn registry() -> DeviceRegistry {
        let raw = json!([
            {"entity_id": "heater_1", "type": "space_heating"},
            {"entity_id": "ev_1", "type": "on_off_ev_charger"}
        ]);
        DeviceRegistry::new(serde_json::from_value(raw).unwrap())
    }

    fn scheduler(store: &Arc<MemoryStore>, device_id: &str) -> DeviceScheduler {
        DeviceScheduler::new(
            device_id,
            ControlChannel::Setpoint,
            Arc::clone(store) as Arc<dyn TimeSeriesStore>,
            MonitorConfig::default(),
        )
    }

    async fn save(
        store: &MemoryStore,
        priority: u8,
        dispatch: BTreeMap<DateTime<Utc>, EventValue>,
        from_direct_control: bool,
    ) -> Result<()> {
        let dispatches = BTreeMap::from([("heater_1".to_string(), dispatch)]);
        DeviceScheduler::save_schedule(
            store,
            store,
            &registry(),
            &MonitorConfig::default(),
            priority,
            &dispatches,
            from_direct_control,
        )
        .await
    }

    #[tokio::test]
    async fn save_and_resolve_covering_event() {
        let store = Arc::new(MemoryStore::new());
        let dispatch = BTreeMap::from([
            (ts(10, 0), EventValue::from(21.0)),
            (ts(11, 0), EventValue::from(19.0)),
        ]);
        save(&store, 50, dispatch, false).await.unwrap();

        let data = scheduler(&store, "heater_1")
            .get_event_data(ts(10, 30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data.value.as_f64(), Some(21.0));
        assert_eq!(data.source, ControlType::PriorityDispatch);

        let later = scheduler(&store, "heater_1")
            .get_event_data(ts(11, 30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(later.value.as_f64(), Some(19.0));
    }

    #[tokio::test]
    async fn last_entry_expires_after_horizon() {
        let store = Arc::new(MemoryStore::new());
        let dispatch = BTreeMap::from([(ts(10, 0), EventValue::from(21.0))]);
        save(&store, 50, dispatch, false).await.unwrap();

        // Default horizon is 60s: covered at 10:00:30, gone at 10:02.
        let within = scheduler(&store, "heater_1")
            .get_event_data(ts(10, 0) + ChronoDuration::seconds(30))
            .await
            .unwrap();
        assert!(within.is_some());

        let after = scheduler(&store, "heater_1")
            .get_event_data(ts(10, 2))
            .await
            .unwrap();
        assert!(after.is_none());
    }

    #[tokio::test]
    async fn higher_priority_tier_wins() {
        let store = Arc::new(MemoryStore::new());
        save(
            &store,
            20,
            BTreeMap::from([(ts(10, 0), EventValue::from(18.0))]),
            false,
        )
        .await
        .unwrap();
        save(
            &store,
            70,
            BTreeMap::from([(ts(10, 0), EventValue::from(23.0))]),
            false,
        )
        .await
        .unwrap();

        let data = scheduler(&store, "heater_1")
            .get_event_data(ts(10, 0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data.value.as_f64(), Some(23.0));
    }

    #[tokio::test]
    async fn empty_tier_does_not_block_fallthrough() {
        let store = Arc::new(MemoryStore::new());
        // Priority 90 covers only 09:00; priority 30 covers 10:00.
        save(
            &store,
            90,
            BTreeMap::from([(ts(9, 0), EventValue::from(25.0))]),
            false,
        )
        .await
        .unwrap();
        save(
            &store,
            30,
            BTreeMap::from([(ts(10, 0), EventValue::from(20.0))]),
            false,
        )
        .await
        .unwrap();

        let data = scheduler(&store, "heater_1")
            .get_event_data(ts(10, 0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data.value.as_f64(), Some(20.0));
    }

    #[tokio::test]
    async fn same_priority_latest_write_wins() {
        let store = Arc::new(MemoryStore::new());
        save(
            &store,
            50,
            BTreeMap::from([(ts(10, 0), EventValue::from(18.0))]),
            false,
        )
        .await
        .unwrap();
        save(
            &store,
            50,
            BTreeMap::from([(ts(10, 0), EventValue::from(22.0))]),
            false,
        )
        .await
        .unwrap();

        let data = scheduler(&store, "heater_1")
            .get_event_data(ts(10, 0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data.value.as_f64(), Some(22.0));
    }

    #[tokio::test]
    async fn direct_control_sets_provenance() {
        let store = Arc::new(MemoryStore::new());
        save(
            &store,
            50,
            BTreeMap::from([(ts(10, 0), EventValue::from(21.0))]),
            true,
        )
        .await
        .unwrap();

        let data = scheduler(&store, "heater_1")
            .get_event_data(ts(10, 0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data.source, ControlType::DirectControl);
    }

    #[tokio::test]
    async fn rejects_out_of_range_priority() {
        let store = Arc::new(MemoryStore::new());
        let result = save(
            &store,
            101,
            BTreeMap::from([(ts(10, 0), EventValue::from(21.0))]),
            false,
        )
        .await;
        assert!(matches!(result, Err(Error::InvalidPriority(101))));
    }

    #[tokio::test]
    async fn rejects_empty_dispatch() {
        let store = Arc::new(MemoryStore::new());
        let result = save(&store, 50, BTreeMap::new(), false).await;
        assert!(matches!(result, Err(Error::EmptyDispatch)));
    }

    #[tokio::test]
    async fn unknown_device_is_skipped_but_known_ones_written() {
        let store = Arc::new(MemoryStore::new());
        let dispatches = BTreeMap::from([
            (
                "ghost_1".to_string(),
                BTreeMap::from([(ts(10, 0), EventValue::from(1.0))]),
            ),
            (
                "heater_1".to_string(),
                BTreeMap::from([(ts(10, 0), EventValue::from(21.0))]),
            ),
        ]);
        DeviceScheduler::save_schedule(
            store.as_ref(),
            store.as_ref(),
            &registry(),
            &MonitorConfig::default(),
            50,
            &dispatches,
            false,
        )
        .await
        .unwrap();

        let data = scheduler(&store, "heater_1")
            .get_event_data(ts(10, 0))
            .await
            .unwrap();
        assert!(data.is_some());
    }

    #[tokio::test]
    async fn no_event_outside_any_interval() {
        let store = Arc::new(MemoryStore::new());
        save(
            &store,
            50,
            BTreeMap::from([(ts(10, 0), EventValue::from(21.0))]),
            false,
        )
        .await
        .unwrap();

        let before = scheduler(&store, "heater_1")
            .get_event_data(ts(9, 59))
            .await
            .unwrap();
        assert!(before.is_none());
    }
}

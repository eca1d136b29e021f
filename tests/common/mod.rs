//! Shared test fixtures for integration tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use vpp_core::config::CoreConfig;
use vpp_core::devices::{DeviceRegistry, USER_DEVICES_KEY};
use vpp_core::schedule::SchedulerMonitor;
use vpp_core::store::memory::MemoryStore;
use vpp_core::store::{DataPoint, KeyValueStore, TimeSeriesStore};

/// 2025-06-02 (a Monday) at the given time, UTC.
pub fn monday(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 2, hour, minute, 0).unwrap()
}

/// The default demo building: one thermostat with a standing setpoint
/// preference (06:00 → 21.0, 22:00 → 17.0, all week), a water heater,
/// and an EV charger.
pub fn building_json() -> serde_json::Value {
    json!([
        {
            "entity_id": "heater_1",
            "type": "space_heating",
            "priority": 1,
            "group": "high",
            "preferences": {
                "preferences_setpoint": {
                    "allweek": {
                        "days": [
                            "MONDAY", "TUESDAY", "WEDNESDAY", "THURSDAY",
                            "FRIDAY", "SATURDAY", "SUNDAY"
                        ],
                        "events": [
                            {"time": "06:00", "value": 21.0},
                            {"time": "22:00", "value": 17.0}
                        ]
                    }
                }
            }
        },
        {"entity_id": "wh_1", "type": "water_heater", "priority": 2},
        {"entity_id": "ev_1", "type": "on_off_ev_charger", "priority": 3, "group": "low"}
    ])
}

/// Publishes `devices` (or the default building) and loads the registry.
pub async fn seed_devices(
    store: &MemoryStore,
    devices: Option<serde_json::Value>,
) -> DeviceRegistry {
    store
        .set(USER_DEVICES_KEY, devices.unwrap_or_else(building_json))
        .await
        .unwrap();
    DeviceRegistry::from_kv(store).await.unwrap()
}

/// Builds a monitor over the shared store with the given configuration.
pub async fn build_monitor(store: &Arc<MemoryStore>, config: &CoreConfig) -> SchedulerMonitor {
    let devices = DeviceRegistry::from_kv(store.as_ref()).await.unwrap();
    SchedulerMonitor::new(
        Arc::clone(store) as Arc<dyn TimeSeriesStore>,
        Arc::clone(store) as Arc<dyn KeyValueStore>,
        devices,
        config.monitor.clone(),
        config.store.clone(),
    )
}

/// Appends flat telemetry to one measurement: `value` under `field`,
/// sampled every `step_minutes` over `[start, stop)`.
pub async fn seed_flat_series(
    store: &MemoryStore,
    measurement: &str,
    field: &str,
    value: f64,
    start: DateTime<Utc>,
    stop: DateTime<Utc>,
    step_minutes: i64,
) {
    let mut points = Vec::new();
    let mut cursor = start;
    while cursor < stop {
        points.push(DataPoint {
            timestamp: cursor,
            fields: BTreeMap::from([(field.to_string(), json!(value))]),
        });
        cursor += chrono::Duration::minutes(step_minutes);
    }
    store
        .append_points(measurement, &BTreeMap::new(), points)
        .await
        .unwrap();
}

//! Read-only registry of the building's controllable devices.
//!
//! Devices are defined externally (static configuration pushed to the
//! key-value store) and never mutated by the core.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::schedule::model::{PreferenceType, Schedule};
use crate::store::{KeyValueStore, get_typed};

/// Key-value key the device list is published under.
pub const USER_DEVICES_KEY: &str = "user_devices";

/// Closed set of controllable device types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    OnOffEvCharger,
    ElectricVehicleV1g,
    ElectricVehicleV2g,
    ElectricStorage,
    PhotovoltaicGeneratorPvlib,
    SpaceHeating,
    ThermalStorage,
    WaterHeater,
}

impl DeviceType {
    /// The control channel priority dispatches for this device type are
    /// written on (thermostats take setpoints, storage takes battery
    /// power, everything else takes plain power).
    pub fn dispatch_channel(self) -> crate::schedule::model::ControlChannel {
        use crate::schedule::model::ControlChannel;
        match self {
            DeviceType::SpaceHeating => ControlChannel::Setpoint,
            DeviceType::ElectricStorage => ControlChannel::BatteryPower,
            DeviceType::PhotovoltaicGeneratorPvlib => ControlChannel::SolarPower,
            DeviceType::OnOffEvCharger
            | DeviceType::ElectricVehicleV1g
            | DeviceType::ElectricVehicleV2g
            | DeviceType::ThermalStorage
            | DeviceType::WaterHeater => ControlChannel::Power,
        }
    }
}

/// UI partitioning group. Not consulted by scheduling logic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceGroup {
    High,
    #[default]
    Medium,
    Low,
}

/// One controllable device as defined in static configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Opaque identifier, unique within the building.
    pub entity_id: String,
    /// Device type.
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    /// Rank when devices compete for a shared power budget
    /// (lower = served first).
    #[serde(default)]
    pub priority: u8,
    /// UI partitioning group.
    #[serde(default)]
    pub group: DeviceGroup,
    /// Standing weekly preferences, by category.
    #[serde(default)]
    pub preferences: BTreeMap<PreferenceType, Schedule>,
}

/// The building's device list with lookup helpers.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
}

impl DeviceRegistry {
    /// Wraps an already-loaded device list.
    pub fn new(devices: Vec<Device>) -> Self {
        Self { devices }
    }

    /// Loads the device list from the key-value store; absent key means
    /// an empty registry.
    pub async fn from_kv(kv: &dyn KeyValueStore) -> Result<Self> {
        let devices = get_typed::<Vec<Device>>(kv, USER_DEVICES_KEY)
            .await?
            .unwrap_or_default();
        Ok(Self { devices })
    }

    /// Whether a device with `entity_id` is installed.
    pub fn exists(&self, entity_id: &str) -> bool {
        self.devices.iter().any(|d| d.entity_id == entity_id)
    }

    /// The device with `entity_id`, if installed.
    pub fn get(&self, entity_id: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.entity_id == entity_id)
    }

    /// Number of installed devices of `device_type`.
    pub fn count_by_type(&self, device_type: DeviceType) -> usize {
        self.devices
            .iter()
            .filter(|d| d.device_type == device_type)
            .count()
    }

    /// Entity ids of all installed devices of `device_type`.
    pub fn ids_of_type(&self, device_type: DeviceType) -> Vec<&str> {
        self.devices
            .iter()
            .filter(|d| d.device_type == device_type)
            .map(|d| d.entity_id.as_str())
            .collect()
    }

    /// Iterates over all devices.
    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    /// Number of installed devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn registry() -> DeviceRegistry {
        let raw = json!([
            {"entity_id": "heater_1", "type": "space_heating", "priority": 1, "group": "high"},
            {"entity_id": "heater_2", "type": "space_heating", "priority": 2},
            {"entity_id": "ev_1", "type": "on_off_ev_charger", "priority": 3, "group": "low"}
        ]);
        DeviceRegistry::new(serde_json::from_value(raw).unwrap())
    }

    #[test]
    fn exists_and_get() {
        let reg = registry();
        assert!(reg.exists("heater_1"));
        assert!(!reg.exists("boiler_1"));
        assert_eq!(reg.get("ev_1").map(|d| d.device_type), Some(DeviceType::OnOffEvCharger));
    }

    #[test]
    fn count_and_ids_by_type() {
        let reg = registry();
        assert_eq!(reg.count_by_type(DeviceType::SpaceHeating), 2);
        assert_eq!(
            reg.ids_of_type(DeviceType::SpaceHeating),
            vec!["heater_1", "heater_2"]
        );
        assert_eq!(reg.count_by_type(DeviceType::WaterHeater), 0);
    }

    #[test]
    fn group_defaults_to_medium() {
        let reg = registry();
        assert_eq!(reg.get("heater_2").map(|d| d.group), Some(DeviceGroup::Medium));
    }

    #[tokio::test]
    async fn from_kv_reads_user_devices() {
        use crate::store::memory::MemoryStore;

        let store = MemoryStore::new();
        store
            .set(
                USER_DEVICES_KEY,
                json!([{"entity_id": "wh_1", "type": "water_heater"}]),
            )
            .await
            .unwrap();

        let reg = DeviceRegistry::from_kv(&store).await.unwrap();
        assert_eq!(reg.len(), 1);
        assert!(reg.exists("wh_1"));
    }
}

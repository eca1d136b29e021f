//! Single point of query for "what should device X be doing now".
//!
//! Integrates priority dispatches, direct control, and preference
//! fallback, with change tracking across evaluation ticks. Scheduler
//! instances are constructed lazily and cached per
//! `(device, channel-or-preference)` key; a per-device version stamp in
//! the key-value store invalidates cached entries when the underlying
//! schedule is rewritten.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use tokio::sync::{OnceCell, RwLock};
use tracing::{info, warn};

use crate::config::{MonitorConfig, StoreConfig};
use crate::devices::DeviceRegistry;
use crate::error::{Error, Result};
use crate::store::{KeyValueStore, TimeSeriesStore, get_typed, with_timeout};

use super::device::{DeviceScheduler, SCHEDULE_VERSION_PREFIX};
use super::model::{
    ControlChannel, ControlType, PreferenceType, Schedule, ScheduleEventData, Scheduler,
};
use super::weekly::WeeklyRecurringScheduler;

/// Registry key: which scheduler flavor a cached instance resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKey {
    /// Dispatch resolution on a control channel.
    Channel(ControlChannel),
    /// Recurring preference resolution.
    Preference(PreferenceType),
}

/// A cached scheduler slot: the version it was built against and a
/// per-key construction cell so concurrent first queries build it once.
struct Entry {
    version: Option<String>,
    cell: Arc<OnceCell<Option<Arc<dyn Scheduler>>>>,
}

/// Registry and arbiter over all scheduler instances.
pub struct SchedulerMonitor {
    ts_store: Arc<dyn TimeSeriesStore>,
    kv: Arc<dyn KeyValueStore>,
    devices: DeviceRegistry,
    config: MonitorConfig,
    store_config: StoreConfig,
    offset: FixedOffset,
    registry: RwLock<HashMap<(String, TypeKey), Entry>>,
}

impl SchedulerMonitor {
    /// Creates a monitor over the given stores and device registry.
    pub fn new(
        ts_store: Arc<dyn TimeSeriesStore>,
        kv: Arc<dyn KeyValueStore>,
        devices: DeviceRegistry,
        config: MonitorConfig,
        store_config: StoreConfig,
    ) -> Self {
        let offset =
            FixedOffset::east_opt(config.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix());
        Self {
            ts_store,
            kv,
            devices,
            config,
            store_config,
            offset,
            registry: RwLock::new(HashMap::new()),
        }
    }

    /// The device registry snapshot this monitor serves.
    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    /// Returns (constructing if absent or stale) the scheduler bound to
    /// `(device_id, key)`. `Ok(None)` when the key has nothing to resolve
    /// — a preference the device does not carry.
    ///
    /// Construction is synchronized per key; queries for different keys
    /// never block each other.
    pub async fn get_device_scheduler(
        &self,
        device_id: &str,
        key: TypeKey,
    ) -> Result<Option<Arc<dyn Scheduler>>> {
        if !self.devices.exists(device_id) {
            return Err(Error::UnknownDevice(device_id.to_string()));
        }

        let version = self.current_version(device_id).await?;
        let cell = self.entry_cell(device_id, key, version).await;
        let scheduler = cell
            .get_or_try_init(|| self.build_scheduler(device_id, key))
            .await?;
        Ok(scheduler.clone())
    }

    /// Resolves the governing event data for a device at `timestamp`.
    ///
    /// The device scheduler is consulted first; when no dispatch covers
    /// the instant, resolution falls back to the channel's recurring
    /// preference. This order encodes the policy that explicit,
    /// time-boxed commands always override standing user preferences.
    pub async fn get_device_event_data(
        &self,
        device_id: &str,
        channel: ControlChannel,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<ScheduleEventData>> {
        let timeout = self.store_config.timeout();

        if let Some(scheduler) = self
            .get_device_scheduler(device_id, TypeKey::Channel(channel))
            .await?
        {
            if let Some(data) = with_timeout(timeout, scheduler.get_event_data(timestamp)).await? {
                return Ok(Some(data));
            }
        }

        let Some(preference) = channel.preference_type() else {
            return Ok(None);
        };
        match self
            .get_device_scheduler(device_id, TypeKey::Preference(preference))
            .await?
        {
            Some(scheduler) => with_timeout(timeout, scheduler.get_event_data(timestamp)).await,
            None => Ok(None),
        }
    }

    /// Resolves event data at `timestamp` and flags whether the value
    /// changed since the previous evaluation tick
    /// (`config.time_step()` earlier).
    ///
    /// Both instants are recomputed from the store rather than cached, so
    /// the flag stays correct across schedule rewrites. Direct-control
    /// values never raise the flag — a direct command is actuated on
    /// receipt, not on the tick edge.
    pub async fn get_device_event_data_with_changed_flag(
        &self,
        device_id: &str,
        channel: ControlChannel,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<ScheduleEventData>> {
        let previous_tick = timestamp
            - chrono::Duration::seconds(self.config.time_step_secs as i64);

        let previous = self
            .get_device_event_data(device_id, channel, previous_tick)
            .await?;
        let Some(mut current) = self
            .get_device_event_data(device_id, channel, timestamp)
            .await?
        else {
            return Ok(None);
        };

        current.changed = current.source != ControlType::DirectControl
            && previous.map(|p| p.value) != Some(current.value.clone());
        Ok(Some(current))
    }

    /// Logs resolved event data for every registered device on `channel`.
    ///
    /// Per-device failures are logged and do not stop the sweep.
    pub async fn log_events_data(&self, channel: ControlChannel, timestamp: DateTime<Utc>) {
        let device_ids: Vec<String> = self
            .devices
            .iter()
            .map(|d| d.entity_id.clone())
            .collect();

        for device_id in device_ids {
            match self
                .get_device_event_data_with_changed_flag(&device_id, channel, timestamp)
                .await
            {
                Ok(Some(data)) => info!(
                    %channel,
                    %device_id,
                    value = %data.value,
                    source = ?data.source,
                    changed = data.changed,
                    "resolved event data"
                ),
                Ok(None) => {}
                Err(e) => {
                    warn!(%channel, %device_id, error = %e, "event data resolution failed");
                }
            }
        }
    }

    /// Reads the device's current schedule version stamp.
    async fn current_version(&self, device_id: &str) -> Result<Option<String>> {
        get_typed::<String>(
            self.kv.as_ref(),
            &format!("{SCHEDULE_VERSION_PREFIX}{device_id}"),
        )
        .await
    }

    /// Fetches the construction cell for a key, replacing it when the
    /// stored version stamp no longer matches.
    async fn entry_cell(
        &self,
        device_id: &str,
        key: TypeKey,
        version: Option<String>,
    ) -> Arc<OnceCell<Option<Arc<dyn Scheduler>>>> {
        let map_key = (device_id.to_string(), key);

        {
            let registry = self.registry.read().await;
            if let Some(entry) = registry.get(&map_key) {
                if entry.version == version {
                    return Arc::clone(&entry.cell);
                }
            }
        }

        let mut registry = self.registry.write().await;
        let entry = registry.entry(map_key).or_insert_with(|| Entry {
            version: version.clone(),
            cell: Arc::new(OnceCell::new()),
        });
        if entry.version != version {
            *entry = Entry {
                version,
                cell: Arc::new(OnceCell::new()),
            };
        }
        Arc::clone(&entry.cell)
    }

    /// Builds the scheduler instance for a key.
    async fn build_scheduler(
        &self,
        device_id: &str,
        key: TypeKey,
    ) -> Result<Option<Arc<dyn Scheduler>>> {
        match key {
            TypeKey::Channel(channel) => Ok(Some(Arc::new(DeviceScheduler::new(
                device_id,
                channel,
                Arc::clone(&self.ts_store),
                self.config.clone(),
            )) as Arc<dyn Scheduler>)),
            TypeKey::Preference(preference) => {
                let Some(schedule) = self.load_preference(device_id, preference).await? else {
                    return Ok(None);
                };
                let scheduler = WeeklyRecurringScheduler::with_offset(&schedule, self.offset)?;
                Ok(Some(Arc::new(scheduler) as Arc<dyn Scheduler>))
            }
        }
    }

    /// Loads a device's preference schedule, preferring the store's
    /// current device list over the construction-time snapshot so a
    /// rebuilt registry entry sees rewritten preferences.
    async fn load_preference(
        &self,
        device_id: &str,
        preference: PreferenceType,
    ) -> Result<Option<Schedule>> {
        let fresh = DeviceRegistry::from_kv(self.kv.as_ref()).await?;
        let registry = if fresh.is_empty() { &self.devices } else { &fresh };
        Ok(registry
            .get(device_id)
            .and_then(|d| d.preferences.get(&preference))
            .cloned())
    }
}

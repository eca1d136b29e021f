//! Schedule value types shared by both scheduler implementations.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Days of the week, in the order used for backward wraparound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Weekday {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl Weekday {
    /// The day preceding this one (cyclic).
    pub fn prev(self) -> Self {
        use Weekday::*;
        match self {
            Monday => Sunday,
            Tuesday => Monday,
            Wednesday => Tuesday,
            Thursday => Wednesday,
            Friday => Thursday,
            Saturday => Friday,
            Sunday => Saturday,
        }
    }
}

impl From<chrono::Weekday> for Weekday {
    fn from(day: chrono::Weekday) -> Self {
        match day {
            chrono::Weekday::Mon => Weekday::Monday,
            chrono::Weekday::Tue => Weekday::Tuesday,
            chrono::Weekday::Wed => Weekday::Wednesday,
            chrono::Weekday::Thu => Weekday::Thursday,
            chrono::Weekday::Fri => Weekday::Friday,
            chrono::Weekday::Sat => Weekday::Saturday,
            chrono::Weekday::Sun => Weekday::Sunday,
        }
    }
}

/// Categories of recurring user preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PreferenceType {
    #[serde(rename = "preferences_setpoint")]
    Setpoint,
    #[serde(rename = "preferences_occupancy")]
    Occupancy,
    #[serde(rename = "preferences_soc")]
    StateOfCharge,
    #[serde(rename = "preferences_branched")]
    Branched,
    #[serde(rename = "preferences_water_heater_consumption")]
    WaterHeaterConsumption,
}

/// Provenance of a resolved value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlType {
    /// Explicit, time-boxed schedule submitted through the dispatch surface.
    PriorityDispatch,
    /// Operator/direct command, actuated on receipt rather than on a tick edge.
    DirectControl,
    /// Standing weekly preference used when no dispatch covers the instant.
    PreferenceFallback,
}

impl ControlType {
    /// Stable tag string used in the persisted layout.
    pub fn as_tag(self) -> &'static str {
        match self {
            ControlType::PriorityDispatch => "priority_dispatch",
            ControlType::DirectControl => "direct_control",
            ControlType::PreferenceFallback => "preference_fallback",
        }
    }

    /// Parses a persisted tag back into a provenance value.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "priority_dispatch" => Some(ControlType::PriorityDispatch),
            "direct_control" => Some(ControlType::DirectControl),
            "preference_fallback" => Some(ControlType::PreferenceFallback),
            _ => None,
        }
    }
}

/// Control channels a device can be queried on.
///
/// Channels with a standing-preference counterpart fall back to it when no
/// dispatch covers the queried instant; the rest resolve from dispatches
/// only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ControlChannel {
    #[serde(rename = "setpoint")]
    Setpoint,
    #[serde(rename = "power")]
    Power,
    #[serde(rename = "battery_power")]
    BatteryPower,
    #[serde(rename = "occupation")]
    Occupancy,
    #[serde(rename = "state_of_charge")]
    StateOfCharge,
    #[serde(rename = "sp_power")]
    SolarPower,
}

impl ControlChannel {
    /// The preference category backing this channel, if any.
    pub fn preference_type(self) -> Option<PreferenceType> {
        match self {
            ControlChannel::Setpoint => Some(PreferenceType::Setpoint),
            ControlChannel::Occupancy => Some(PreferenceType::Occupancy),
            ControlChannel::StateOfCharge => Some(PreferenceType::StateOfCharge),
            ControlChannel::Power | ControlChannel::BatteryPower | ControlChannel::SolarPower => {
                None
            }
        }
    }

    /// Stable tag string used in the persisted layout.
    pub fn as_tag(self) -> &'static str {
        match self {
            ControlChannel::Setpoint => "setpoint",
            ControlChannel::Power => "power",
            ControlChannel::BatteryPower => "battery_power",
            ControlChannel::Occupancy => "occupation",
            ControlChannel::StateOfCharge => "state_of_charge",
            ControlChannel::SolarPower => "sp_power",
        }
    }
}

impl fmt::Display for ControlChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// A schedule value: scalar setpoint, binary state, or structured payload.
///
/// Equality is structural and drives change detection, so writers should be
/// consistent about numeric representation (a `21` and a `21.0` differ).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventValue(pub Value);

impl EventValue {
    /// The value as `f64` when it is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        self.0.as_f64()
    }
}

impl From<f64> for EventValue {
    fn from(v: f64) -> Self {
        EventValue(Value::from(v))
    }
}

impl From<bool> for EventValue {
    fn from(v: bool) -> Self {
        EventValue(Value::from(v))
    }
}

impl From<Value> for EventValue {
    fn from(v: Value) -> Self {
        EventValue(v)
    }
}

impl fmt::Display for EventValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single non-recurring interval during which a device holds a value.
///
/// Events within one schedule for the same device must not overlap; the
/// writer enforces this and the reader returns the first match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEvent {
    /// Interval start (inclusive).
    pub start: DateTime<Utc>,
    /// Interval end (exclusive).
    pub end: DateTime<Utc>,
    /// Target value over the interval.
    pub value: EventValue,
}

impl ScheduleEvent {
    /// Creates an event, rejecting inverted or empty intervals.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, value: EventValue) -> Result<Self> {
        if start >= end {
            return Err(Error::MalformedTimeRange { start, end });
        }
        Ok(Self { start, end, value })
    }

    /// Whether the interval contains `instant` (`start` inclusive, `end`
    /// exclusive).
    pub fn covers(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }
}

/// A weekly trigger: from this time until the next chronologically later
/// trigger, the value applies on each listed day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklyScheduleEvent {
    /// Days this trigger fires on.
    pub days: Vec<Weekday>,
    /// Trigger time of day.
    #[serde(with = "hhmm")]
    pub time: NaiveTime,
    /// Value applied from the trigger onward.
    pub value: EventValue,
}

/// One named sub-schedule (e.g. `weekday`): the days it applies to and its
/// time-ordered triggers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubSchedule {
    /// Days every trigger in this sub-schedule applies to.
    pub days: Vec<Weekday>,
    /// Triggers, ordered by time of day.
    pub events: Vec<TimeSlot>,
}

/// A trigger time and its value inside a sub-schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSlot {
    /// Trigger time of day.
    #[serde(with = "hhmm")]
    pub time: NaiveTime,
    /// Value applied from the trigger onward.
    #[serde(alias = "data")]
    pub value: EventValue,
}

/// A named collection of sub-schedules, as persisted for one
/// `(device, preference type)` pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schedule {
    /// Sub-schedule name → definition.
    pub sub_schedules: BTreeMap<String, SubSchedule>,
}

impl Schedule {
    /// Flattens every sub-schedule into standalone weekly events.
    pub fn expanded_events(&self) -> Vec<WeeklyScheduleEvent> {
        self.sub_schedules
            .values()
            .flat_map(|sub| {
                sub.events.iter().map(|slot| WeeklyScheduleEvent {
                    days: sub.days.clone(),
                    time: slot.time,
                    value: slot.value.clone(),
                })
            })
            .collect()
    }
}

/// The resolved output of a scheduler query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEventData {
    /// Resolved target value.
    pub value: EventValue,
    /// Which layer produced the value.
    pub source: ControlType,
    /// Whether the value differs from the previous evaluation tick.
    /// Only the monitor sets this; schedulers report `false`.
    pub changed: bool,
}

/// The polymorphic scheduler seam.
///
/// Exactly two implementations exist — [`crate::schedule::DeviceScheduler`]
/// and [`crate::schedule::WeeklyRecurringScheduler`] — and the monitor
/// depends only on this trait.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Resolves the active schedule data at `timestamp`; `None` when no
    /// event covers it.
    async fn get_event_data(&self, timestamp: DateTime<Utc>) -> Result<Option<ScheduleEventData>>;
}

/// `HH:MM` (de)serialization for trigger times, matching the persisted
/// schedule layout. Accepts `HH:MM:SS` on input for compatibility.
mod hhmm {
    use chrono::NaiveTime;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&raw, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M:%S"))
            .map_err(serde::de::Error::custom)
    }
}

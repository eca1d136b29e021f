//! Recurring weekly preference schedules.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Offset, TimeZone, Timelike, Utc};

use crate::error::{Error, Result};

use super::model::{
    ControlType, Schedule, ScheduleEventData, Scheduler, Weekday, WeeklyScheduleEvent,
};

/// Resolves a device's recurring preference value at an arbitrary instant.
///
/// Recurring schedules are circular: a query before the week's first
/// trigger wraps backward to the most recent prior one, so a scheduler
/// holding at least one event never resolves to "no event".
pub struct WeeklyRecurringScheduler {
    events: Vec<WeeklyScheduleEvent>,
    offset: FixedOffset,
}

impl WeeklyRecurringScheduler {
    /// Loads a schedule, resolving (day, time-of-day) in UTC.
    pub fn new(schedule: &Schedule) -> Result<Self> {
        Self::with_offset(schedule, Utc.fix())
    }

    /// Loads a schedule, resolving (day, time-of-day) in the given fixed
    /// offset.
    ///
    /// Performs conflict detection across all sub-schedules: two triggers
    /// sharing the same `(day, time)` make the schedule ambiguous and fail
    /// with [`Error::ScheduleConflict`] rather than silently picking one.
    pub fn with_offset(schedule: &Schedule, offset: FixedOffset) -> Result<Self> {
        let mut events = schedule.expanded_events();

        let mut seen: BTreeSet<(Weekday, NaiveTime)> = BTreeSet::new();
        for event in &events {
            for day in &event.days {
                if !seen.insert((*day, event.time)) {
                    return Err(Error::ScheduleConflict {
                        day: *day,
                        time: event.time,
                    });
                }
            }
        }

        events.sort_by_key(|e| e.time);
        Ok(Self { events, offset })
    }

    /// Number of expanded weekly triggers.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the schedule holds no triggers at all.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// The trigger governing `timestamp`: the latest one at or before the
    /// query's time of day among sub-schedules covering its weekday, else
    /// the last trigger of the most recent prior day (cyclically, up to
    /// 7 days back).
    pub fn get_event(&self, timestamp: DateTime<Utc>) -> Option<&WeeklyScheduleEvent> {
        let local = timestamp.with_timezone(&self.offset);
        let time_of_day = local.time().with_nanosecond(0).unwrap_or_else(|| local.time());
        let mut day: Weekday = local.weekday().into();

        if let Some(event) = self
            .events
            .iter()
            .filter(|e| e.days.contains(&day) && e.time <= time_of_day)
            .max_by_key(|e| e.time)
        {
            return Some(event);
        }

        for _ in 0..7 {
            day = day.prev();
            if let Some(event) = self
                .events
                .iter()
                .filter(|e| e.days.contains(&day))
                .max_by_key(|e| e.time)
            {
                return Some(event);
            }
        }

        None
    }

    /// Triggers firing inside `(start, end]`, based on `start`'s calendar
    /// day in the scheduler's offset.
    pub fn events_in_interval(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<&WeeklyScheduleEvent> {
        let start_local = start.with_timezone(&self.offset);
        let end_local = end.with_timezone(&self.offset);
        let day: Weekday = start_local.weekday().into();

        self.events
            .iter()
            .filter(|event| {
                if !event.days.contains(&day) {
                    return false;
                }
                let naive = start_local.date_naive().and_time(event.time);
                match self.offset.from_local_datetime(&naive).single() {
                    Some(trigger) => start_local < trigger && trigger <= end_local,
                    None => false,
                }
            })
            .collect()
    }

    /// Wraps [`Self::get_event`] into resolved event data tagged as a
    /// preference fallback. Change detection is the monitor's
    /// responsibility, so `changed` is always `false` here.
    pub fn get_event_data(&self, timestamp: DateTime<Utc>) -> Option<ScheduleEventData> {
        self.get_event(timestamp).map(|event| ScheduleEventData {
            value: event.value.clone(),
            source: ControlType::PreferenceFallback,
            changed: false,
        })
    }
}

#[async_trait]
impl Scheduler for WeeklyRecurringScheduler {
    async fn get_event_data(&self, timestamp: DateTime<Utc>) -> Result<Option<ScheduleEventData>> {
        Ok(WeeklyRecurringScheduler::get_event_data(self, timestamp))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn schedule(raw: serde_json::Value) -> Schedule {
        serde_json::from_value(raw).unwrap()
    }

    fn weekday_weekend() -> Schedule {
        schedule(json!({
            "weekday": {
                "days": ["MONDAY", "TUESDAY", "WEDNESDAY", "THURSDAY", "FRIDAY"],
                "events": [
                    {"time": "06:00", "value": 21.0},
                    {"time": "22:00", "value": 17.0}
                ]
            },
            "weekend": {
                "days": ["SATURDAY", "SUNDAY"],
                "events": [
                    {"time": "07:00", "value": 20.0},
                    {"time": "23:00", "value": 16.0}
                ]
            }
        }))
    }

    // 2025-06-02 is a Monday.
    fn ts(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, day, hour, minute, 0).unwrap()
    }

    #[test]
    fn selects_latest_trigger_at_or_before_query() {
        let scheduler = WeeklyRecurringScheduler::new(&weekday_weekend()).unwrap();
        // Monday 07:30 → 06:00 trigger.
        let event = scheduler.get_event(ts(2, 7, 30)).unwrap();
        assert_eq!(event.value.as_f64(), Some(21.0));
        // Monday 23:00 → 22:00 trigger.
        let event = scheduler.get_event(ts(2, 23, 0)).unwrap();
        assert_eq!(event.value.as_f64(), Some(17.0));
    }

    #[test]
    fn trigger_boundary_is_inclusive() {
        let scheduler = WeeklyRecurringScheduler::new(&weekday_weekend()).unwrap();
        let event = scheduler.get_event(ts(2, 6, 0)).unwrap();
        assert_eq!(event.value.as_f64(), Some(21.0));
    }

    #[test]
    fn wraps_to_previous_day_before_first_trigger() {
        let scheduler = WeeklyRecurringScheduler::new(&weekday_weekend()).unwrap();
        // Monday 05:00 → Sunday's last trigger (23:00 → 16.0).
        let event = scheduler.get_event(ts(2, 5, 0)).unwrap();
        assert_eq!(event.value.as_f64(), Some(16.0));
    }

    #[test]
    fn single_event_schedule_is_circular() {
        let scheduler = WeeklyRecurringScheduler::new(&schedule(json!({
            "weekday": {
                "days": ["MONDAY"],
                "events": [{"time": "06:00", "value": 21.0}]
            }
        })))
        .unwrap();

        // Sunday 23:00 wraps all the way back to Monday's event.
        let event = scheduler.get_event(ts(8, 23, 0)).unwrap();
        assert_eq!(event.value.as_f64(), Some(21.0));
        // And so does Monday 05:00, one hour before the trigger.
        let event = scheduler.get_event(ts(2, 5, 0)).unwrap();
        assert_eq!(event.value.as_f64(), Some(21.0));
    }

    #[test]
    fn duplicate_trigger_fails_at_load_time() {
        let result = WeeklyRecurringScheduler::new(&schedule(json!({
            "morning": {
                "days": ["MONDAY"],
                "events": [{"time": "06:00", "value": 21.0}]
            },
            "other": {
                "days": ["MONDAY"],
                "events": [{"time": "06:00", "value": 18.0}]
            }
        })));
        assert!(matches!(result, Err(Error::ScheduleConflict { .. })));
    }

    #[test]
    fn duplicate_trigger_within_one_sub_schedule_fails() {
        let result = WeeklyRecurringScheduler::new(&schedule(json!({
            "weekday": {
                "days": ["TUESDAY"],
                "events": [
                    {"time": "08:00", "value": 21.0},
                    {"time": "08:00", "value": 19.0}
                ]
            }
        })));
        assert!(matches!(result, Err(Error::ScheduleConflict { .. })));
    }

    #[test]
    fn fixed_offset_shifts_resolution() {
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        let scheduler =
            WeeklyRecurringScheduler::with_offset(&weekday_weekend(), offset).unwrap();
        // 05:00 UTC Monday is 07:00 local → the 06:00 trigger applies.
        let event = scheduler.get_event(ts(2, 5, 0)).unwrap();
        assert_eq!(event.value.as_f64(), Some(21.0));
    }

    #[test]
    fn events_in_interval_catches_triggers() {
        let scheduler = WeeklyRecurringScheduler::new(&weekday_weekend()).unwrap();
        // Monday 05:30 → 06:30 straddles the 06:00 trigger.
        let fired = scheduler.events_in_interval(ts(2, 5, 30), ts(2, 6, 30));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].value.as_f64(), Some(21.0));

        // Monday 06:30 → 07:30 contains no trigger.
        let fired = scheduler.events_in_interval(ts(2, 6, 30), ts(2, 7, 30));
        assert!(fired.is_empty());
    }

    #[test]
    fn get_event_data_tags_preference_fallback() {
        let scheduler = WeeklyRecurringScheduler::new(&weekday_weekend()).unwrap();
        let data = scheduler.get_event_data(ts(2, 12, 0)).unwrap();
        assert_eq!(data.source, ControlType::PreferenceFallback);
        assert!(!data.changed);
    }
}

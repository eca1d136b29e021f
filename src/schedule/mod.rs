//! Layered scheduling engine: schedule model, the two scheduler
//! implementations, and the monitor that arbitrates between them.

pub mod device;
pub mod model;
pub mod monitor;
pub mod weekly;

pub use device::DeviceScheduler;
pub use model::{
    ControlChannel, ControlType, EventValue, PreferenceType, Schedule, ScheduleEvent,
    ScheduleEventData, Scheduler, Weekday, WeeklyScheduleEvent,
};
pub use monitor::{SchedulerMonitor, TypeKey};
pub use weekly::WeeklyRecurringScheduler;

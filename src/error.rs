//! Crate-wide error taxonomy.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the coordination core.
///
/// Validation variants are rejected synchronously and never retried.
/// `StoreUnavailable` is retryable by the owning tick/request loop;
/// `RemoteService` is logged and surfaced but does not clear any state
/// already written (the blackout marker in particular stays put).
#[derive(Debug, Error)]
pub enum Error {
    /// Dispatch priority outside the accepted `[0, 100]` range.
    #[error("invalid priority {0}: must be in [0, 100]")]
    InvalidPriority(u8),

    /// `save_schedule` called with no dispatch entries.
    #[error("empty dispatch: at least one timestamp/value pair is required")]
    EmptyDispatch,

    /// A time range whose end does not come after its start.
    #[error("malformed time range: start {start} must precede end {end}")]
    MalformedTimeRange {
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
    },

    /// Two weekly events share the same `(day, time)` trigger.
    #[error("schedule conflict: duplicate trigger at {day:?} {time}")]
    ScheduleConflict {
        day: crate::schedule::model::Weekday,
        time: chrono::NaiveTime,
    },

    /// The time-series or key-value store timed out or refused the call.
    #[error("store unavailable: {reason}")]
    StoreUnavailable { reason: String },

    /// The remote power-limit service failed or rejected the request.
    #[error("remote service error: {reason}")]
    RemoteService { reason: String },

    /// A device id that is not part of the registry.
    #[error("unknown device \"{0}\"")]
    UnknownDevice(String),

    /// A payload read from the store could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Builds a `StoreUnavailable` from any displayable cause.
    pub fn store(reason: impl std::fmt::Display) -> Self {
        Error::StoreUnavailable {
            reason: reason.to_string(),
        }
    }

    /// Builds a `RemoteService` from any displayable cause.
    pub fn remote(reason: impl std::fmt::Display) -> Self {
        Error::RemoteService {
            reason: reason.to_string(),
        }
    }
}

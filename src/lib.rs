//! Coordination core for controllable building devices.
//!
//! Three subsystems share the external store and nothing else:
//! - the layered scheduling engine ([`schedule`]) resolving which of
//!   several competing schedules governs a device at any instant,
//! - the blackout detector ([`grap`]) turning telemetry gaps into an
//!   idempotent cold-load-pickup curtailment,
//! - the cache-aside forecast responder ([`forecast`]).
//!
//! The concrete time-series and key-value/pub-sub engines, the REST
//! surface, device-protocol adapters, and the production forecasting
//! model live outside this crate, behind the seams in [`store`],
//! [`rpc`], and [`forecast::model`].

pub mod config;
pub mod devices;
pub mod error;
pub mod forecast;
pub mod grap;
pub mod rpc;
pub mod schedule;
pub mod store;

pub use error::{Error, Result};

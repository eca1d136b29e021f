//! TOML-based configuration for the coordination core.
//!
//! Thresholds, TTLs, and intervals are explicit fields passed into each
//! component at construction — there is no ambient global state.

use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration.
///
/// All fields have defaults suitable for a single-building deployment.
/// Load from TOML with [`CoreConfig::from_toml_file`] or start from
/// `CoreConfig::default()`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    /// External-store call parameters.
    pub store: StoreConfig,
    /// Scheduler monitor parameters.
    pub monitor: MonitorConfig,
    /// Blackout detector parameters.
    pub grap: GrapConfig,
    /// Forecast responder parameters.
    pub forecast: ForecastConfig,
}

/// External-store call parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Per-call timeout for store operations (seconds).
    pub timeout_secs: u64,
    /// Initial retry backoff for background loops (seconds).
    pub retry_backoff_secs: u64,
    /// Backoff ceiling (seconds).
    pub retry_backoff_max_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            retry_backoff_secs: 5,
            retry_backoff_max_secs: 60,
        }
    }
}

impl StoreConfig {
    /// Per-call timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Scheduler monitor parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    /// Evaluation tick granularity (seconds). The changed flag compares
    /// against the resolution one tick earlier.
    pub time_step_secs: u64,
    /// How long the final dispatch entry of a schedule stays in force
    /// past its timestamp (seconds).
    pub dispatch_horizon_secs: u64,
    /// How far back dispatch queries scan for a covering event (hours).
    pub lookback_hours: u64,
    /// Fixed offset applied before weekly (day, time-of-day) resolution
    /// (minutes east of UTC).
    pub utc_offset_minutes: i32,
    /// Measurement holding persisted priority dispatches.
    pub schedule_measurement: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            time_step_secs: 60,
            dispatch_horizon_secs: 60,
            lookback_hours: 48,
            utc_offset_minutes: 0,
            schedule_measurement: "control_schedule".to_string(),
        }
    }
}

impl MonitorConfig {
    /// Evaluation tick as a `Duration`.
    pub fn time_step(&self) -> Duration {
        Duration::from_secs(self.time_step_secs)
    }

    /// Dispatch horizon as a `Duration`.
    pub fn dispatch_horizon(&self) -> Duration {
        Duration::from_secs(self.dispatch_horizon_secs)
    }
}

/// Blackout detector parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GrapConfig {
    /// Tick interval (seconds).
    pub interval_secs: u64,
    /// Minimum telemetry gap treated as a blackout (minutes, 1–30).
    pub gap_threshold_minutes: f64,
    /// Telemetry window scanned each tick (hours).
    pub lookback_hours: u64,
    /// Measurement carrying the building's net power telemetry.
    pub power_measurement: String,
    /// Field within the power measurement.
    pub power_field: String,
    /// Curtailment cap used when the service configuration key is absent (kW).
    pub default_power_cap_kw: f64,
    /// Key-value key holding the GRAP service configuration.
    pub service_config_key: String,
    /// Pub/sub channel of the power-limit service.
    pub request_channel: String,
    /// Timeout for the cold-load-pickup RPC (seconds).
    pub rpc_timeout_secs: u64,
}

impl Default for GrapConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            gap_threshold_minutes: 30.0,
            lookback_hours: 24,
            power_measurement: "net_power".to_string(),
            power_field: "net_power".to_string(),
            default_power_cap_kw: 10.0,
            service_config_key: "grid_service_grap".to_string(),
            request_channel: "grid:cold_load_pickup".to_string(),
            rpc_timeout_secs: 30,
        }
    }
}

impl GrapConfig {
    /// Tick interval as a `Duration`.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// RPC timeout as a `Duration`.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }
}

/// Forecast responder parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ForecastConfig {
    /// Pub/sub channel forecast requests arrive on.
    pub request_channel: String,
    /// Method name a request must carry to trigger the forecast.
    pub method: String,
    /// Cache entry time-to-live (seconds).
    pub cache_ttl_secs: u64,
    /// Days of history fed to the model.
    pub history_days: u64,
    /// Default sampling interval when a request omits one (minutes).
    pub default_interval_minutes: u32,
    /// Measurement carrying the building's total net power telemetry.
    pub total_measurement: String,
    /// Field within the total measurement.
    pub total_field: String,
    /// Measurement the derived non-controllable history is persisted to.
    pub history_measurement: String,
    /// Measurement predicted series are persisted to.
    pub forecast_measurement: String,
    /// Measurement carrying per-device power telemetry.
    pub device_power_measurement: String,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            request_channel: "forecaster:non_controllable_loads".to_string(),
            method: "non_controllable_loads_forecast".to_string(),
            cache_ttl_secs: 86_400,
            history_days: 30,
            default_interval_minutes: 10,
            total_measurement: "net_power".to_string(),
            total_field: "net_power".to_string(),
            history_measurement: "non_controllable_loads".to_string(),
            forecast_measurement: "non_controllable_loads_forecast".to_string(),
            device_power_measurement: "device_power".to_string(),
        }
    }
}

impl ForecastConfig {
    /// Cache TTL as a `Duration`.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Configuration error with field path and constraint description.
#[derive(Debug)]
pub struct ConfigError {
    /// Dotted field path (e.g., `"grap.gap_threshold_minutes"`).
    pub field: String,
    /// Human-readable constraint description.
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config error: {} — {}", self.field, self.message)
    }
}

impl CoreConfig {
    /// Parses configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file cannot be read or the TOML is invalid.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError {
            field: "config".to_string(),
            message: format!("cannot read \"{}\": {e}", path.display()),
        })?;
        Self::from_toml_str(&content)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the TOML is invalid or contains unknown fields.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError {
            field: "toml".to_string(),
            message: e.to_string(),
        })
    }

    /// Validates all fields and returns a list of errors.
    ///
    /// Returns an empty vector if configuration is valid.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.store.timeout_secs == 0 {
            errors.push(ConfigError {
                field: "store.timeout_secs".into(),
                message: "must be > 0".into(),
            });
        }
        if self.store.retry_backoff_secs > self.store.retry_backoff_max_secs {
            errors.push(ConfigError {
                field: "store.retry_backoff_secs".into(),
                message: "must be <= store.retry_backoff_max_secs".into(),
            });
        }

        if self.monitor.time_step_secs == 0 {
            errors.push(ConfigError {
                field: "monitor.time_step_secs".into(),
                message: "must be > 0".into(),
            });
        }
        if self.monitor.lookback_hours == 0 {
            errors.push(ConfigError {
                field: "monitor.lookback_hours".into(),
                message: "must be > 0".into(),
            });
        }

        if self.grap.interval_secs == 0 {
            errors.push(ConfigError {
                field: "grap.interval_secs".into(),
                message: "must be > 0".into(),
            });
        }
        if !(1.0..=30.0).contains(&self.grap.gap_threshold_minutes) {
            errors.push(ConfigError {
                field: "grap.gap_threshold_minutes".into(),
                message: "must be in [1.0, 30.0]".into(),
            });
        }
        if self.grap.lookback_hours == 0 {
            errors.push(ConfigError {
                field: "grap.lookback_hours".into(),
                message: "must be > 0".into(),
            });
        }

        if self.forecast.cache_ttl_secs == 0 {
            errors.push(ConfigError {
                field: "forecast.cache_ttl_secs".into(),
                message: "must be > 0".into(),
            });
        }
        if self.forecast.history_days == 0 {
            errors.push(ConfigError {
                field: "forecast.history_days".into(),
                message: "must be > 0".into(),
            });
        }
        if self.forecast.default_interval_minutes == 0 {
            errors.push(ConfigError {
                field: "forecast.default_interval_minutes".into(),
                message: "must be > 0".into(),
            });
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = CoreConfig::default();
        let errors = cfg.validate();
        assert!(errors.is_empty(), "defaults should be valid: {errors:?}");
    }

    #[test]
    fn valid_toml_parses() {
        let toml = r#"
[store]
timeout_secs = 5

[monitor]
time_step_secs = 30
utc_offset_minutes = 120

[grap]
interval_secs = 15
gap_threshold_minutes = 10.0

[forecast]
cache_ttl_secs = 3600
"#;
        let cfg = CoreConfig::from_toml_str(toml);
        assert!(cfg.is_ok(), "valid TOML should parse: {:?}", cfg.err());
        let cfg = cfg.ok();
        assert_eq!(cfg.as_ref().map(|c| c.monitor.time_step_secs), Some(30));
        assert_eq!(
            cfg.as_ref().map(|c| c.monitor.utc_offset_minutes),
            Some(120)
        );
        assert_eq!(cfg.as_ref().map(|c| c.forecast.cache_ttl_secs), Some(3600));
    }

    #[test]
    fn invalid_toml_unknown_field() {
        let toml = r#"
[grap]
bogus_field = true
"#;
        let result = CoreConfig::from_toml_str(toml);
        assert!(result.is_err());
    }

    #[test]
    fn validation_bounds_gap_threshold() {
        let mut cfg = CoreConfig::default();
        cfg.grap.gap_threshold_minutes = 45.0;
        let errors = cfg.validate();
        assert!(
            errors
                .iter()
                .any(|e| e.field == "grap.gap_threshold_minutes")
        );

        cfg.grap.gap_threshold_minutes = 0.5;
        let errors = cfg.validate();
        assert!(
            errors
                .iter()
                .any(|e| e.field == "grap.gap_threshold_minutes")
        );
    }

    #[test]
    fn validation_catches_zero_time_step() {
        let mut cfg = CoreConfig::default();
        cfg.monitor.time_step_secs = 0;
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "monitor.time_step_secs"));
    }

    #[test]
    fn validation_catches_backoff_inversion() {
        let mut cfg = CoreConfig::default();
        cfg.store.retry_backoff_secs = 120;
        cfg.store.retry_backoff_max_secs = 60;
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "store.retry_backoff_secs"));
    }
}

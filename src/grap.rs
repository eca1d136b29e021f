//! Grid Response and Protection (GRAP): blackout detection and
//! cold-load-pickup coordination.
//!
//! A periodic task correlates gaps in the building's power telemetry into
//! grid events and coordinates a curtailment response through the remote
//! power-limit service — exactly once per outage.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::config::{GrapConfig, StoreConfig};
use crate::error::{Error, Result};
use crate::rpc;
use crate::store::{
    KeyValueStore, TimeSeriesStore, get_typed, retry_backoff, set_typed_with_ttl, with_timeout,
};

/// Marker key guarding against duplicate responses for one outage.
pub const BLACKOUT_MARKER_KEY: &str = "grap:blackout";

/// Key holding the active curtailment state for operator visibility.
pub const GRAP_STATE_KEY: &str = "grap:state";

/// RPC method name of the cold-load-pickup grid function.
pub const COLD_LOAD_PICKUP_METHOD: &str = "cold_load_pickup";

/// A detected grid event, persisted under [`BLACKOUT_MARKER_KEY`] with an
/// expiration sized from the outage duration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlackoutRecord {
    /// Length of the telemetry gap (minutes).
    pub detected_minutes: f64,
    /// Timestamp of the first sample after the gap.
    pub stop: DateTime<Utc>,
}

/// Curtailment request sent to the power-limit service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurtailmentRequest {
    /// Always `"grap"` for requests originating here.
    pub reason: String,
    /// Cold-load-pickup window length (minutes).
    pub duration_minutes: f64,
    /// Requested power cap (kW).
    pub power_cap_kw: f64,
}

/// Power-limit service answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurtailmentResponse {
    /// Whether the service accepted the curtailment.
    pub accepted: bool,
    /// Cap actually applied (kW).
    pub applied_limit_kw: f64,
    /// Window the cap stays in force (minutes).
    pub duration_minutes: f64,
}

/// GRAP settings published by the grid-services layer.
#[derive(Debug, Clone, Deserialize)]
struct GrapServiceSettings {
    grap_limit: f64,
}

/// The remote power-limit service seam.
#[async_trait]
pub trait PowerLimitService: Send + Sync {
    /// Requests a bounded curtailment for a cold-load-pickup window.
    async fn request_cold_load_pickup(
        &self,
        request: CurtailmentRequest,
    ) -> Result<CurtailmentResponse>;
}

/// Power-limit client speaking the RPC envelope over pub/sub.
pub struct PubSubPowerLimitClient {
    kv: Arc<dyn KeyValueStore>,
    channel: String,
    timeout: Duration,
}

impl PubSubPowerLimitClient {
    /// Creates a client publishing on `channel` with the given RPC timeout.
    pub fn new(kv: Arc<dyn KeyValueStore>, channel: impl Into<String>, timeout: Duration) -> Self {
        Self {
            kv,
            channel: channel.into(),
            timeout,
        }
    }
}

#[async_trait]
impl PowerLimitService for PubSubPowerLimitClient {
    async fn request_cold_load_pickup(
        &self,
        request: CurtailmentRequest,
    ) -> Result<CurtailmentResponse> {
        let result = rpc::call(
            self.kv.as_ref(),
            &self.channel,
            COLD_LOAD_PICKUP_METHOD,
            serde_json::to_value(&request)?,
            self.timeout,
        )
        .await?;
        Ok(serde_json::from_value(result)?)
    }
}

/// Periodic blackout detector.
///
/// Ticks are strictly serialized: [`BlackoutDetector::run`] awaits each
/// tick — including the idempotency check, marker write, and RPC — before
/// starting the next, so an in-flight response can never be re-triggered
/// by an overlapping tick.
pub struct BlackoutDetector {
    ts_store: Arc<dyn TimeSeriesStore>,
    kv: Arc<dyn KeyValueStore>,
    service: Arc<dyn PowerLimitService>,
    config: GrapConfig,
    store_config: StoreConfig,
}

impl BlackoutDetector {
    /// Creates a detector over the given stores and power-limit service.
    pub fn new(
        ts_store: Arc<dyn TimeSeriesStore>,
        kv: Arc<dyn KeyValueStore>,
        service: Arc<dyn PowerLimitService>,
        config: GrapConfig,
        store_config: StoreConfig,
    ) -> Self {
        Self {
            ts_store,
            kv,
            service,
            config,
            store_config,
        }
    }

    /// Runs one detection pass.
    ///
    /// State machine: `NORMAL → GAP_DETECTED → (dedup check) →
    /// RESPONSE_TRIGGERED → COOLDOWN (TTL) → NORMAL`. The dedup check is
    /// an atomic set-if-absent on the marker key, so concurrent or
    /// restarted detectors cannot double-trigger. A failed marker write
    /// propagates (and is retried next tick); a failed RPC leaves the
    /// marker in place so the event shows as active-but-unconfirmed and
    /// is not re-raised.
    pub async fn tick(&self) -> Result<()> {
        let timeout = self.store_config.timeout();

        if with_timeout(timeout, self.kv.get(GRAP_STATE_KEY)).await?.is_some() {
            debug!("curtailment already active, skipping blackout scan");
            return Ok(());
        }

        let Some((detected_minutes, stop)) = self.detect_last_interruption().await? else {
            debug!("no blackouts detected");
            return Ok(());
        };

        let record = BlackoutRecord {
            detected_minutes,
            stop,
        };
        let ttl = Duration::from_secs_f64((detected_minutes * 60.0).max(1.0));
        let won = with_timeout(
            timeout,
            self.kv
                .set_if_absent(BLACKOUT_MARKER_KEY, serde_json::to_value(&record)?, ttl),
        )
        .await?;
        if !won {
            info!(
                detected_minutes,
                "cold load pickup already requested for this outage, not requesting again"
            );
            return Ok(());
        }

        let power_cap_kw = get_typed::<GrapServiceSettings>(
            self.kv.as_ref(),
            &self.config.service_config_key,
        )
        .await
        .ok()
        .flatten()
        .map_or(self.config.default_power_cap_kw, |s| s.grap_limit);

        let request = CurtailmentRequest {
            reason: "grap".to_string(),
            duration_minutes: detected_minutes,
            power_cap_kw,
        };
        info!(
            detected_minutes,
            power_cap_kw, "blackout detected, requesting cold load pickup curtailment"
        );

        let response = self.service.request_cold_load_pickup(request).await?;
        info!(
            accepted = response.accepted,
            applied_limit_kw = response.applied_limit_kw,
            duration_minutes = response.duration_minutes,
            "power limit service answered"
        );

        let state_ttl = Duration::from_secs_f64((response.duration_minutes * 60.0).max(1.0));
        set_typed_with_ttl(self.kv.as_ref(), GRAP_STATE_KEY, &response, state_ttl).await?;

        Ok(())
    }

    /// Reserved extension point for reconciling local blackout state with
    /// a remote authority. No call is made.
    pub async fn reconcile_remote(&self) -> Result<()> {
        Ok(())
    }

    /// Scans the telemetry window for the most recent gap between
    /// consecutive samples exceeding the configured threshold.
    ///
    /// Returns the gap length in minutes and the timestamp of the sample
    /// that ended it — the moment power came back, which is when cold
    /// load pickup matters.
    async fn detect_last_interruption(&self) -> Result<Option<(f64, DateTime<Utc>)>> {
        let stop = Utc::now();
        let start = stop - ChronoDuration::hours(self.config.lookback_hours as i64);
        let fields = vec![self.config.power_field.clone()];

        let records = with_timeout(
            self.store_config.timeout(),
            self.ts_store.range_query(
                &self.config.power_measurement,
                &fields,
                &BTreeMap::new(),
                start,
                stop,
            ),
        )
        .await?;

        let mut last_gap: Option<(f64, DateTime<Utc>)> = None;
        for pair in records.windows(2) {
            let gap_minutes = (pair[1].timestamp - pair[0].timestamp).num_seconds() as f64 / 60.0;
            if gap_minutes > self.config.gap_threshold_minutes {
                last_gap = Some((gap_minutes, pair[1].timestamp));
            }
        }

        if let Some((minutes, at)) = last_gap {
            info!(minutes, stop = %at, "telemetry interruption found");
        }
        Ok(last_gap)
    }

    /// Runs the detector until the task is dropped.
    ///
    /// Tick errors are logged and delay the next attempt with bounded
    /// backoff; they never terminate the loop.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut consecutive_failures: u32 = 0;

        loop {
            ticker.tick().await;
            match self.tick().await {
                Ok(()) => consecutive_failures = 0,
                Err(e) => {
                    consecutive_failures += 1;
                    error!(error = %e, consecutive_failures, "blackout detector tick failed");
                    if matches!(e, Error::StoreUnavailable { .. }) {
                        tokio::time::sleep(retry_backoff(&self.store_config, consecutive_failures))
                            .await;
                    }
                }
            }
        }
    }
}

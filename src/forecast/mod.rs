//! Cache-aside forecast responder for non-controllable loads.
//!
//! Answers asynchronous forecast requests from the pub/sub channel,
//! reusing previously computed results under a time-boxed cache policy
//! and recomputing via the trained model otherwise.

pub mod model;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, OnceCell};
use tracing::{error, info, warn};

use crate::config::{ForecastConfig, StoreConfig};
use crate::devices::{DeviceRegistry, DeviceType};
use crate::error::{Error, Result};
use crate::rpc;
use crate::store::{
    DataPoint, KeyValueStore, Message, TimeSeriesStore, get_typed, retry_backoff,
    set_typed_with_ttl, with_timeout,
};

use model::ForecastModel;

/// Cache key prefix for forecast entries.
pub const FORECAST_CACHE_PREFIX: &str = "forecast:ncl:";

/// Parameters of a forecast request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastParams {
    /// Forecast window start (inclusive).
    pub start: DateTime<Utc>,
    /// Forecast window end (exclusive).
    pub stop: DateTime<Utc>,
    /// Sampling interval (minutes); the configured default when omitted.
    #[serde(default)]
    pub interval: Option<u32>,
}

/// One predicted sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    /// Sample timestamp.
    pub timestamp: DateTime<Utc>,
    /// Predicted non-controllable load (kW).
    pub value: f64,
}

/// A computed forecast as cached and returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastSeries {
    /// Window start (inclusive).
    pub start: DateTime<Utc>,
    /// Window end (exclusive).
    pub stop: DateTime<Utc>,
    /// Sampling interval (minutes).
    pub interval_minutes: u32,
    /// Predicted samples over `[start, stop)`.
    pub series: Vec<SeriesPoint>,
    /// When the model produced this series.
    pub computed_at: DateTime<Utc>,
}

/// A forecast response: the series plus its provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastAnswer {
    /// `true` when served from cache rather than freshly computed.
    pub cached: bool,
    /// The forecast itself.
    pub forecast: ForecastSeries,
}

/// Deterministic, collision-free cache key for a request.
pub fn cache_key(start: DateTime<Utc>, stop: DateTime<Utc>, interval_minutes: u32) -> String {
    format!(
        "{FORECAST_CACHE_PREFIX}{}:{}:{}",
        start.to_rfc3339_opts(SecondsFormat::Secs, true),
        stop.to_rfc3339_opts(SecondsFormat::Secs, true),
        interval_minutes
    )
}

/// Publishes a forecast request and awaits the answer.
pub async fn request_forecast(
    kv: &dyn KeyValueStore,
    config: &ForecastConfig,
    params: &ForecastParams,
    timeout: Duration,
) -> Result<ForecastAnswer> {
    let result = rpc::call(
        kv,
        &config.request_channel,
        &config.method,
        serde_json::to_value(params)?,
        timeout,
    )
    .await?;
    Ok(serde_json::from_value(result)?)
}

/// Request/response handler implementing cache-aside forecast retrieval.
pub struct ForecastResponder {
    ts_store: Arc<dyn TimeSeriesStore>,
    kv: Arc<dyn KeyValueStore>,
    model: Arc<dyn ForecastModel>,
    devices: DeviceRegistry,
    config: ForecastConfig,
    store_config: StoreConfig,
    in_flight: Mutex<HashMap<String, Arc<OnceCell<ForecastSeries>>>>,
}

impl ForecastResponder {
    /// Creates a responder over the given stores, model, and devices.
    pub fn new(
        ts_store: Arc<dyn TimeSeriesStore>,
        kv: Arc<dyn KeyValueStore>,
        model: Arc<dyn ForecastModel>,
        devices: DeviceRegistry,
        config: ForecastConfig,
        store_config: StoreConfig,
    ) -> Self {
        Self {
            ts_store,
            kv,
            model,
            devices,
            config,
            store_config,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Answers one forecast request, cache-aside.
    ///
    /// Concurrent requests for the same uncached key coalesce: a per-key
    /// cell admits exactly one computation, and late joiners await its
    /// result (answered as cache-sourced, since they did not compute).
    pub async fn respond(&self, params: &ForecastParams) -> Result<ForecastAnswer> {
        if params.start >= params.stop {
            return Err(Error::MalformedTimeRange {
                start: params.start,
                end: params.stop,
            });
        }
        let interval_minutes = params
            .interval
            .unwrap_or(self.config.default_interval_minutes);
        let key = cache_key(params.start, params.stop, interval_minutes);
        let timeout = self.store_config.timeout();

        if let Some(entry) = with_timeout(
            timeout,
            get_typed::<ForecastSeries>(self.kv.as_ref(), &key),
        )
        .await?
        {
            info!(%key, "forecast already cached, returning cached response");
            return Ok(ForecastAnswer {
                cached: true,
                forecast: entry,
            });
        }

        let cell = {
            let mut in_flight = self.in_flight.lock().await;
            Arc::clone(in_flight.entry(key.clone()).or_default())
        };

        let mut computed = false;
        let result = cell
            .get_or_try_init(|| async {
                computed = true;
                self.compute(params.start, params.stop, interval_minutes, &key)
                    .await
            })
            .await
            .cloned();

        if computed {
            self.in_flight.lock().await.remove(&key);
        }

        Ok(ForecastAnswer {
            cached: !computed,
            forecast: result?,
        })
    }

    /// Computes, persists, and caches a fresh forecast.
    async fn compute(
        &self,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
        interval_minutes: u32,
        key: &str,
    ) -> Result<ForecastSeries> {
        let history_start = start - ChronoDuration::days(self.config.history_days as i64);
        let history = self.derive_non_controllable(history_start, start).await?;
        if history.is_empty() {
            warn!("no telemetry history in the training window, forecasting from nothing");
        }

        let step = ChronoDuration::minutes(interval_minutes as i64);
        let mut targets = Vec::new();
        let mut cursor = start;
        while cursor < stop {
            targets.push(cursor);
            cursor += step;
        }

        let predicted = self.model.fit_predict(&history, &targets)?;
        let series: Vec<SeriesPoint> = targets
            .iter()
            .zip(predicted)
            .map(|(timestamp, value)| SeriesPoint {
                timestamp: *timestamp,
                value: (value * 100.0).round() / 100.0,
            })
            .collect();

        let points = series
            .iter()
            .map(|point| DataPoint {
                timestamp: point.timestamp,
                fields: BTreeMap::from([("value".to_string(), Value::from(point.value))]),
            })
            .collect();
        with_timeout(
            self.store_config.timeout(),
            self.ts_store
                .append_points(&self.config.forecast_measurement, &BTreeMap::new(), points),
        )
        .await?;

        let forecast = ForecastSeries {
            start,
            stop,
            interval_minutes,
            series,
            computed_at: Utc::now(),
        };
        with_timeout(
            self.store_config.timeout(),
            set_typed_with_ttl(self.kv.as_ref(), key, &forecast, self.config.cache_ttl()),
        )
        .await?;

        info!(%key, points = forecast.series.len(), "forecast computed and cached");
        Ok(forecast)
    }

    /// Derives the non-controllable load history: total net consumption
    /// negated, space-heating and water-heater consumption added back,
    /// EV charging subtracted. Batteries are left out of the derivation.
    ///
    /// The derived series is persisted for audit before being returned.
    async fn derive_non_controllable(
        &self,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, f64)>> {
        let timeout = self.store_config.timeout();
        let total_fields = vec![self.config.total_field.clone()];
        let total = with_timeout(
            timeout,
            self.ts_store.range_query(
                &self.config.total_measurement,
                &total_fields,
                &BTreeMap::new(),
                start,
                stop,
            ),
        )
        .await?;

        let heating = self
            .sum_device_power(&[DeviceType::SpaceHeating], start, stop)
            .await?;
        let water = self
            .sum_device_power(&[DeviceType::WaterHeater], start, stop)
            .await?;
        let ev = self
            .sum_device_power(
                &[
                    DeviceType::OnOffEvCharger,
                    DeviceType::ElectricVehicleV1g,
                    DeviceType::ElectricVehicleV2g,
                ],
                start,
                stop,
            )
            .await?;

        let mut history = Vec::with_capacity(total.len());
        for record in total {
            let Some(total_kw) = record
                .fields
                .get(&self.config.total_field)
                .and_then(Value::as_f64)
            else {
                continue;
            };
            let timestamp = record.timestamp;
            let value = -total_kw
                + heating.get(&timestamp).copied().unwrap_or(0.0)
                + water.get(&timestamp).copied().unwrap_or(0.0)
                - ev.get(&timestamp).copied().unwrap_or(0.0);
            history.push((timestamp, value));
        }

        if !history.is_empty() {
            let points = history
                .iter()
                .map(|(timestamp, value)| DataPoint {
                    timestamp: *timestamp,
                    fields: BTreeMap::from([("value".to_string(), Value::from(*value))]),
                })
                .collect();
            with_timeout(
                timeout,
                self.ts_store.append_points(
                    &self.config.history_measurement,
                    &BTreeMap::new(),
                    points,
                ),
            )
            .await?;
        }

        Ok(history)
    }

    /// Sums per-timestamp power across all installed devices of the given
    /// types. Devices publish under `power_<entity_id>` fields.
    async fn sum_device_power(
        &self,
        types: &[DeviceType],
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<BTreeMap<DateTime<Utc>, f64>> {
        let fields: Vec<String> = types
            .iter()
            .flat_map(|t| self.devices.ids_of_type(*t))
            .map(|id| format!("power_{id}"))
            .collect();
        if fields.is_empty() {
            return Ok(BTreeMap::new());
        }

        let records = with_timeout(
            self.store_config.timeout(),
            self.ts_store.range_query(
                &self.config.device_power_measurement,
                &fields,
                &BTreeMap::new(),
                start,
                stop,
            ),
        )
        .await?;

        let mut sums = BTreeMap::new();
        for record in records {
            let sum: f64 = record.fields.values().filter_map(Value::as_f64).sum();
            *sums.entry(record.timestamp).or_insert(0.0) += sum;
        }
        Ok(sums)
    }

    /// Handles one raw message from the request channel.
    async fn handle_message(&self, message: Message) -> Result<()> {
        let request: rpc::Request = serde_json::from_value(message.payload)?;

        if request.method != self.config.method {
            warn!(
                received = %request.method,
                expected = %self.config.method,
                "message does not trigger the non-controllable loads forecast"
            );
            return rpc::reply_error(
                self.kv.as_ref(),
                &request,
                &format!(
                    "method \"{}\" does not trigger the forecast; use \"{}\"",
                    request.method, self.config.method
                ),
            )
            .await;
        }

        let params: ForecastParams = serde_json::from_value(request.params.clone())?;
        match self.respond(&params).await {
            Ok(answer) => {
                rpc::reply(self.kv.as_ref(), &request, serde_json::to_value(&answer)?).await
            }
            Err(e) => {
                error!(error = %e, "forecast computation failed");
                rpc::reply_error(self.kv.as_ref(), &request, &e.to_string()).await
            }
        }
    }

    /// Serves forecast requests until the task is dropped.
    ///
    /// Each request is handled in its own task so a slow computation does
    /// not block the channel; handler errors are logged and the responder
    /// moves on to the next request.
    pub async fn run(self: Arc<Self>) {
        let mut consecutive_failures: u32 = 0;
        loop {
            let mut subscription = match self.kv.subscribe(&self.config.request_channel).await {
                Ok(subscription) => {
                    consecutive_failures = 0;
                    subscription
                }
                Err(e) => {
                    consecutive_failures += 1;
                    error!(error = %e, "forecast request subscription failed");
                    tokio::time::sleep(retry_backoff(&self.store_config, consecutive_failures))
                        .await;
                    continue;
                }
            };
            info!(
                channel = %self.config.request_channel,
                "forecast responder subscribed"
            );

            while let Some(message) = subscription.next().await {
                let responder = Arc::clone(&self);
                tokio::spawn(async move {
                    if let Err(e) = responder.handle_message(message).await {
                        error!(error = %e, "forecast request handling failed");
                    }
                });
            }

            consecutive_failures += 1;
            warn!("forecast request subscription closed, resubscribing");
            tokio::time::sleep(retry_backoff(&self.store_config, consecutive_failures)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::store::memory::MemoryStore;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, hour, 0, 0).unwrap()
    }

    #[test]
    fn cache_key_is_deterministic_and_injective() {
        let a = cache_key(ts(0), ts(12), 10);
        let b = cache_key(ts(0), ts(12), 10);
        assert_eq!(a, b);

        assert_ne!(cache_key(ts(0), ts(12), 10), cache_key(ts(0), ts(12), 15));
        assert_ne!(cache_key(ts(0), ts(12), 10), cache_key(ts(0), ts(13), 10));
    }

    #[tokio::test]
    async fn rejects_inverted_window() {
        let store = Arc::new(MemoryStore::new());
        let responder = ForecastResponder::new(
            Arc::clone(&store) as Arc<dyn TimeSeriesStore>,
            Arc::clone(&store) as Arc<dyn KeyValueStore>,
            Arc::new(model::SeasonalNaive),
            DeviceRegistry::default(),
            ForecastConfig::default(),
            StoreConfig::default(),
        );

        let params = ForecastParams {
            start: ts(12),
            stop: ts(0),
            interval: None,
        };
        let result = responder.respond(&params).await;
        assert!(matches!(result, Err(Error::MalformedTimeRange { .. })));
    }

    #[tokio::test]
    async fn series_covers_half_open_window() {
        let store = Arc::new(MemoryStore::new());
        let responder = ForecastResponder::new(
            Arc::clone(&store) as Arc<dyn TimeSeriesStore>,
            Arc::clone(&store) as Arc<dyn KeyValueStore>,
            Arc::new(model::SeasonalNaive),
            DeviceRegistry::default(),
            ForecastConfig::default(),
            StoreConfig::default(),
        );

        let params = ForecastParams {
            start: ts(0),
            stop: ts(1),
            interval: Some(10),
        };
        let answer = responder.respond(&params).await.unwrap();
        assert!(!answer.cached);
        // [00:00, 01:00) at 10 min → six samples, stop excluded.
        assert_eq!(answer.forecast.series.len(), 6);
        assert_eq!(answer.forecast.series[0].timestamp, ts(0));
        assert!(answer.forecast.series.last().map(|p| p.timestamp) < Some(ts(1)));
    }
}

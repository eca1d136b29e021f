//! Demo entry point — wires the in-memory store, seeds a small building,
//! and exercises each subsystem once.
//!
//! Production deployments embed the library behind real store adapters;
//! this binary exists to show the wiring and for manual smoke runs.

use std::collections::BTreeMap;
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vpp_core::config::CoreConfig;
use vpp_core::devices::{DeviceRegistry, USER_DEVICES_KEY};
use vpp_core::forecast::model::SeasonalNaive;
use vpp_core::forecast::{ForecastParams, ForecastResponder, request_forecast};
use vpp_core::grap::{
    BlackoutDetector, COLD_LOAD_PICKUP_METHOD, CurtailmentRequest, CurtailmentResponse,
    PowerLimitService, PubSubPowerLimitClient,
};
use vpp_core::rpc;
use vpp_core::schedule::{ControlChannel, DeviceScheduler, EventValue, SchedulerMonitor};
use vpp_core::store::memory::MemoryStore;
use vpp_core::store::{DataPoint, KeyValueStore, TimeSeriesStore};

/// Parsed CLI arguments.
struct CliArgs {
    config_path: Option<String>,
}

fn print_help() {
    eprintln!("vpp-core — building device coordination core (demo run)");
    eprintln!();
    eprintln!("Usage: vpp-core [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --config <path>   Load configuration from a TOML file");
    eprintln!("  --help            Show this help message");
    eprintln!();
    eprintln!("Without --config, built-in defaults are used.");
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = CliArgs { config_path: None };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                process::exit(0);
            }
            "--config" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("error: --config requires a path argument");
                    process::exit(1);
                }
                cli.config_path = Some(args[i].clone());
            }
            other => {
                eprintln!("error: unknown argument \"{other}\"");
                print_help();
                process::exit(1);
            }
        }
        i += 1;
    }

    cli
}

#[tokio::main]
async fn main() {
    let cli = parse_args();

    let config = if let Some(ref path) = cli.config_path {
        match CoreConfig::from_toml_file(Path::new(path)) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("{e}");
                process::exit(1);
            }
        }
    } else {
        CoreConfig::default()
    };

    let errors = config.validate();
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("{e}");
        }
        process::exit(1);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = demo(config).await {
        eprintln!("demo run failed: {e}");
        process::exit(1);
    }
}

/// Seeds a small building and exercises each caller-facing surface once.
async fn demo(config: CoreConfig) -> vpp_core::Result<()> {
    let store = Arc::new(MemoryStore::new());
    seed_building(&store, &config).await?;

    let devices = DeviceRegistry::from_kv(store.as_ref()).await?;
    let monitor = SchedulerMonitor::new(
        Arc::clone(&store) as Arc<dyn TimeSeriesStore>,
        Arc::clone(&store) as Arc<dyn KeyValueStore>,
        devices.clone(),
        config.monitor.clone(),
        config.store.clone(),
    );

    // A priority-70 dispatch overriding the standing setpoint preference.
    let now = Utc::now();
    let dispatches = BTreeMap::from([(
        "heater_1".to_string(),
        BTreeMap::from([
            (now, EventValue::from(21.5)),
            (now + ChronoDuration::minutes(30), EventValue::from(19.0)),
        ]),
    )]);
    DeviceScheduler::save_schedule(
        store.as_ref(),
        store.as_ref(),
        monitor.devices(),
        &config.monitor,
        70,
        &dispatches,
        false,
    )
    .await?;

    let data = monitor
        .get_device_event_data_with_changed_flag("heater_1", ControlChannel::Setpoint, now)
        .await?;
    info!(?data, "resolved heater_1 setpoint");
    monitor.log_events_data(ControlChannel::Setpoint, now).await;

    // Blackout detection against the seeded telemetry gap, answered by a
    // stand-in power-limit service.
    spawn_power_limit_stub(&store, &config).await?;
    let client = Arc::new(PubSubPowerLimitClient::new(
        Arc::clone(&store) as Arc<dyn KeyValueStore>,
        config.grap.request_channel.clone(),
        config.grap.rpc_timeout(),
    ));
    let detector = BlackoutDetector::new(
        Arc::clone(&store) as Arc<dyn TimeSeriesStore>,
        Arc::clone(&store) as Arc<dyn KeyValueStore>,
        client as Arc<dyn PowerLimitService>,
        config.grap.clone(),
        config.store.clone(),
    );
    detector.tick().await?;

    // Forecast request through the pub/sub surface.
    let responder = Arc::new(ForecastResponder::new(
        Arc::clone(&store) as Arc<dyn TimeSeriesStore>,
        Arc::clone(&store) as Arc<dyn KeyValueStore>,
        Arc::new(SeasonalNaive),
        devices,
        config.forecast.clone(),
        config.store.clone(),
    ));
    tokio::spawn(Arc::clone(&responder).run());
    // Let the responder subscribe before the request goes out.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let params = ForecastParams {
        start: now,
        stop: now + ChronoDuration::hours(24),
        interval: None,
    };
    let answer = request_forecast(
        store.as_ref(),
        &config.forecast,
        &params,
        Duration::from_secs(30),
    )
    .await?;
    info!(
        cached = answer.cached,
        points = answer.forecast.series.len(),
        "forecast answered"
    );

    Ok(())
}

/// Publishes the demo device list and a day of telemetry containing one
/// 45-minute outage.
async fn seed_building(store: &Arc<MemoryStore>, config: &CoreConfig) -> vpp_core::Result<()> {
    store
        .set(
            USER_DEVICES_KEY,
            json!([
                {
                    "entity_id": "heater_1",
                    "type": "space_heating",
                    "priority": 1,
                    "group": "high",
                    "preferences": {
                        "preferences_setpoint": {
                            "allweek": {
                                "days": [
                                    "MONDAY", "TUESDAY", "WEDNESDAY", "THURSDAY",
                                    "FRIDAY", "SATURDAY", "SUNDAY"
                                ],
                                "events": [
                                    {"time": "06:00", "value": 21.0},
                                    {"time": "22:00", "value": 17.0}
                                ]
                            }
                        }
                    }
                },
                {"entity_id": "wh_1", "type": "water_heater", "priority": 2},
                {"entity_id": "ev_1", "type": "on_off_ev_charger", "priority": 3, "group": "low"}
            ]),
        )
        .await?;

    let now = Utc::now();
    let gap_start = now - ChronoDuration::minutes(120);
    let gap_end = now - ChronoDuration::minutes(75);

    let mut net_points = Vec::new();
    let mut device_points = Vec::new();
    let mut cursor = now - ChronoDuration::hours(24);
    while cursor < now {
        // The outage: no samples inside the gap.
        if cursor < gap_start || cursor >= gap_end {
            net_points.push(DataPoint {
                timestamp: cursor,
                fields: BTreeMap::from([(config.grap.power_field.clone(), json!(-2.5))]),
            });
            device_points.push(DataPoint {
                timestamp: cursor,
                fields: BTreeMap::from([
                    ("power_heater_1".to_string(), json!(0.8)),
                    ("power_wh_1".to_string(), json!(0.4)),
                    ("power_ev_1".to_string(), json!(1.1)),
                ]),
            });
        }
        cursor += ChronoDuration::minutes(5);
    }

    store
        .append_points(&config.grap.power_measurement, &BTreeMap::new(), net_points)
        .await?;
    store
        .append_points(
            &config.forecast.device_power_measurement,
            &BTreeMap::new(),
            device_points,
        )
        .await?;
    Ok(())
}

/// Answers cold-load-pickup RPCs the way the external power-limit grid
/// service would.
async fn spawn_power_limit_stub(
    store: &Arc<MemoryStore>,
    config: &CoreConfig,
) -> vpp_core::Result<()> {
    let mut subscription = store.subscribe(&config.grap.request_channel).await?;
    let stub_store = Arc::clone(store);
    tokio::spawn(async move {
        while let Some(message) = subscription.next().await {
            let Ok(request) = serde_json::from_value::<rpc::Request>(message.payload) else {
                continue;
            };
            if request.method != COLD_LOAD_PICKUP_METHOD {
                continue;
            }
            let Ok(params) = serde_json::from_value::<CurtailmentRequest>(request.params.clone())
            else {
                continue;
            };
            let response = CurtailmentResponse {
                accepted: true,
                applied_limit_kw: params.power_cap_kw,
                duration_minutes: params.duration_minutes,
            };
            let payload = match serde_json::to_value(&response) {
                Ok(payload) => payload,
                Err(_) => continue,
            };
            let _ = rpc::reply(stub_store.as_ref(), &request, payload).await;
        }
    });
    Ok(())
}

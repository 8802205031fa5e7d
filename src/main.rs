use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::{mpsc, watch};

use fare_meter_rs::config::MeterConfig;
use fare_meter_rs::geo::{gps_loop, GpsEngine};
use fare_meter_rs::inputs::{
    passenger_loop, selector_loop, sos_loop, InputBackend, MockInputs, SysfsGpio,
};
use fare_meter_rs::meter::Meter;
use fare_meter_rs::sos::LogAlarm;
use fare_meter_rs::sync::RideSyncService;

#[derive(Parser, Debug)]
#[command(name = "fare_meter")]
#[command(about = "Vehicle fare meter core - GPS fares, mode selector, SOS", long_about = None)]
struct Args {
    /// NMEA serial device; simulation is used when it cannot be opened
    #[arg(long)]
    gps_device: Option<String>,

    /// Force the simulated GPS source and mock input lines
    #[arg(long)]
    simulate: bool,

    /// Fare rate per km (overrides config)
    #[arg(long)]
    rate: Option<f64>,

    /// Optional JSON config file
    #[arg(long)]
    config: Option<String>,

    /// Ride sync endpoint base URL
    #[arg(long)]
    sync_url: Option<String>,

    /// Driver id reported in sync payloads
    #[arg(long)]
    driver_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => MeterConfig::load(path)?,
        None => MeterConfig::default(),
    };
    if let Some(device) = args.gps_device {
        config.gps_device = device;
    }
    if let Some(rate) = args.rate {
        config.fare_rate_per_km = rate;
    }
    if let Some(url) = args.sync_url {
        config.sync_base_url = Some(url);
    }
    if let Some(driver_id) = args.driver_id {
        config.driver_id = driver_id;
    }

    log::info!(
        "[MAIN] fare meter starting, rate {:.2}/km, device {}",
        config.fare_rate_per_km,
        config.gps_device
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let (geo_tx, geo_rx) = mpsc::channel(64);
    let (input_tx, input_rx) = mpsc::channel(64);
    let (gps_cmd_tx, gps_cmd_rx) = mpsc::channel(8);

    // Source selection happens once at startup; a missing serial device
    // silently degrades to the simulated route.
    let engine = if args.simulate {
        GpsEngine::simulated()
    } else {
        GpsEngine::open(&config.gps_device)
    };
    tokio::spawn(gps_loop(
        engine,
        geo_tx,
        gps_cmd_rx,
        stop_rx.clone(),
        config.gps_sample_period_ms,
    ));

    let backend: Arc<dyn InputBackend> = if args.simulate {
        log::info!("[MAIN] using mock input lines");
        Arc::new(MockInputs::new())
    } else {
        Arc::new(SysfsGpio::new())
    };
    tokio::spawn(passenger_loop(
        Arc::clone(&backend),
        input_tx.clone(),
        stop_rx.clone(),
        config.passenger_poll_ms,
    ));
    tokio::spawn(selector_loop(
        Arc::clone(&backend),
        input_tx.clone(),
        stop_rx.clone(),
        config.selector_poll_ms,
    ));
    tokio::spawn(sos_loop(
        Arc::clone(&backend),
        input_tx,
        stop_rx.clone(),
        config.sos_poll_ms,
        config.sos_hold_poll_ms,
    ));

    let meter = Arc::new(Meter::new(config.clone(), gps_cmd_tx, Arc::new(LogAlarm)));

    if let Some(base_url) = &config.sync_base_url {
        RideSyncService::new(base_url, &config.driver_id).spawn(meter.subscribe());
    }

    // Stand-in for the display collaborator: tail the event surface.
    let mut events = meter.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let line = serde_json::to_string(&event).unwrap_or_default();
                    log::info!("[EVENT] {}", line);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let run = tokio::spawn(Arc::clone(&meter).run(geo_rx, input_rx, stop_rx));

    tokio::signal::ctrl_c().await?;
    log::info!("[MAIN] shutdown requested");
    let _ = stop_tx.send(true);
    let _ = run.await;
    log::info!("[MAIN] fare meter stopped");
    Ok(())
}

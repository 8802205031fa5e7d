use std::fs;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Buzzer/lamp timings for the emergency alarm pattern
/// (3 short pulses, 3 long pulses, 3 short pulses, repeat).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AlarmTimings {
    pub short_ms: u64,
    pub long_ms: u64,
    pub off_ms: u64,
    pub gap_ms: u64,
    pub cycle_pause_ms: u64,
}

impl Default for AlarmTimings {
    fn default() -> Self {
        AlarmTimings {
            short_ms: 200,
            long_ms: 600,
            off_ms: 200,
            gap_ms: 200,
            cycle_pause_ms: 1000,
        }
    }
}

/// Every runtime tunable of the meter. Defaults match the deployed
/// vehicle installation; a JSON file can override any subset and the
/// CLI can override that again.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    // Fare parameters
    pub fare_rate_per_km: f64,
    pub waiting_rate_per_minute: f64,
    pub waiting_speed_threshold_kmh: f64,
    /// Movement below this distance per tick is treated as GPS jitter.
    pub movement_noise_floor_km: f64,

    // Sampling cadences
    pub gps_sample_period_ms: u64,
    pub passenger_poll_ms: u64,
    pub selector_poll_ms: u64,
    pub sos_poll_ms: u64,
    pub sos_hold_poll_ms: u64,

    // Emergency system
    pub sos_countdown_secs: u8,
    pub alarm: AlarmTimings,

    // Collaborator endpoints
    pub gps_device: String,
    pub sync_base_url: Option<String>,
    pub driver_id: String,
}

impl Default for MeterConfig {
    fn default() -> Self {
        MeterConfig {
            fare_rate_per_km: 12.0,
            waiting_rate_per_minute: 2.0,
            waiting_speed_threshold_kmh: 2.0,
            movement_noise_floor_km: 0.005,
            gps_sample_period_ms: 1000,
            passenger_poll_ms: 100,
            selector_poll_ms: 200,
            sos_poll_ms: 50,
            sos_hold_poll_ms: 100,
            sos_countdown_secs: 5,
            alarm: AlarmTimings::default(),
            gps_device: "/dev/serial0".to_string(),
            sync_base_url: None,
            driver_id: "DRIVER-01".to_string(),
        }
    }
}

impl MeterConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path).with_context(|| format!("reading config {}", path))?;
        let config = serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path))?;
        Ok(config)
    }
}

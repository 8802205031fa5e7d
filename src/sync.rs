use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::events::{FareSlot, MeterEvent};
use crate::fare::RideRecord;
use crate::geo::Location;

const SYNC_TIMEOUT_SECS: u64 = 5;

/// Wire shape expected by the fleet backend.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FareSyncPayload {
    ride_id: String,
    driver_id: String,
    passenger_id: String,
    start_time: String,
    end_time: String,
    start_latitude: f64,
    start_longitude: f64,
    end_latitude: f64,
    end_longitude: f64,
    distance_km: f64,
    fare_amount: f64,
    fare_rate: f64,
}

fn coords(location: Option<Location>) -> (f64, f64) {
    location
        .map(|l| (l.latitude, l.longitude))
        .unwrap_or((0.0, 0.0))
}

fn build_payload(driver_id: &str, slot: FareSlot, record: &RideRecord) -> FareSyncPayload {
    let passenger_id = match slot {
        FareSlot::Sharing(index) => (index + 1).to_string(),
        FareSlot::Private => "private".to_string(),
    };
    let (start_latitude, start_longitude) = coords(record.start_location);
    let (end_latitude, end_longitude) = coords(record.end_location);
    FareSyncPayload {
        ride_id: record.ride_id.clone(),
        driver_id: driver_id.to_string(),
        passenger_id,
        start_time: record.start_time.to_rfc3339(),
        end_time: record.end_time.to_rfc3339(),
        start_latitude,
        start_longitude,
        end_latitude,
        end_longitude,
        distance_km: record.distance_km,
        fare_amount: record.fare_amount,
        fare_rate: record.fare_rate_per_km,
    }
}

/// Posts completed rides to the fleet backend. Strictly fire-and-forget:
/// failures are logged and dropped, the meter's own state is never
/// rolled back or retried, and nothing here can block the core.
pub struct RideSyncService {
    client: reqwest::Client,
    base_url: String,
    driver_id: String,
}

impl RideSyncService {
    pub fn new(base_url: &str, driver_id: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(SYNC_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        RideSyncService {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            driver_id: driver_id.to_string(),
        }
    }

    /// Subscribe to the meter's event stream and push each completed
    /// ride in its own task.
    pub fn spawn(self, mut events: broadcast::Receiver<MeterEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            log::info!("[SYNC] ride sync to {} enabled", self.base_url);
            loop {
                match events.recv().await {
                    Ok(MeterEvent::RideCompleted { slot, record }) => {
                        self.push(slot, &record).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        log::warn!("[SYNC] lagged, {} events skipped", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            log::info!("[SYNC] ride sync stopped");
        })
    }

    async fn push(&self, slot: FareSlot, record: &RideRecord) {
        let url = format!("{}/api/fares/autometer", self.base_url);
        let payload = build_payload(&self.driver_id, slot, record);
        match self.client.post(&url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                log::info!("[SYNC] ride {} synced", record.ride_id);
            }
            Ok(response) => {
                log::warn!(
                    "[SYNC] ride {} rejected: HTTP {}",
                    record.ride_id,
                    response.status()
                );
            }
            Err(e) => {
                log::warn!("[SYNC] ride {} not synced: {}", record.ride_id, e);
            }
        }
    }
}

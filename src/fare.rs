use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::MeterConfig;
use crate::events::FareSlot;
use crate::geo::{distance_km, Location};

/// Per-ride running state for one passenger slot (or the private trip).
/// Fare and distance only move while `onboard` is set and are zeroed
/// at every boarding transition.
#[derive(Clone, Debug, Default)]
pub struct TripLeg {
    pub onboard: bool,
    pub fare: f64,
    pub distance_km: f64,
    pub waiting_minutes: f64,
    pub start_location: Option<Location>,
    pub last_location: Option<Location>,
    pub start_time: Option<DateTime<Utc>>,
    pub ride_id: Option<String>,
}

impl TripLeg {
    fn board(&mut self, ride_id: String, location: Option<Location>, now: DateTime<Utc>) {
        self.onboard = true;
        self.fare = 0.0;
        self.distance_km = 0.0;
        self.waiting_minutes = 0.0;
        self.start_location = location;
        self.last_location = location;
        self.start_time = Some(now);
        self.ride_id = Some(ride_id);
    }

    fn reset(&mut self) {
        *self = TripLeg::default();
    }
}

/// Snapshot emitted exactly once per completed ride, after all fields
/// are finalized.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RideRecord {
    pub ride_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passenger_id: Option<u8>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_minutes: f64,
    /// Accumulated path distance, gated by the movement noise floor.
    pub distance_km: f64,
    /// Great-circle distance between the boarding and alighting points.
    pub straight_line_km: f64,
    pub fare_amount: f64,
    pub fare_rate_per_km: f64,
    pub waiting_minutes: f64,
    pub start_location: Option<Location>,
    pub end_location: Option<Location>,
    pub average_speed_kmh: f64,
    /// Unfiltered GPS trip accumulator, private rides only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gps_total_distance_km: Option<f64>,
    /// Highest sampled speed over the trip, private rides only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_speed_kmh: Option<f64>,
}

fn round_to(value: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (value * factor).round() / factor
}

/// Maintains three sharing-slot legs plus the private leg and applies
/// the per-tick charging rules to whichever are live.
pub struct FareEngine {
    legs: [TripLeg; 3],
    private: TripLeg,
    private_max_speed_kmh: f64,
    rate_per_km: f64,
    waiting_rate_per_minute: f64,
    waiting_speed_threshold_kmh: f64,
    noise_floor_km: f64,
}

impl FareEngine {
    pub fn new(config: &MeterConfig) -> Self {
        FareEngine {
            legs: Default::default(),
            private: TripLeg::default(),
            private_max_speed_kmh: 0.0,
            rate_per_km: config.fare_rate_per_km,
            waiting_rate_per_minute: config.waiting_rate_per_minute,
            waiting_speed_threshold_kmh: config.waiting_speed_threshold_kmh,
            noise_floor_km: config.movement_noise_floor_km,
        }
    }

    pub fn rate_per_km(&self) -> f64 {
        self.rate_per_km
    }

    /// Takes effect on the next tick; already-accumulated fares are
    /// never recomputed.
    pub fn set_rate(&mut self, rate: f64) {
        self.rate_per_km = rate;
        log::info!("[FARE] rate set to {:.2}/km", rate);
    }

    pub fn onboard(&self, slot: usize) -> bool {
        self.legs.get(slot).map(|leg| leg.onboard).unwrap_or(false)
    }

    pub fn private_active(&self) -> bool {
        self.private.onboard
    }

    pub fn leg_fare(&self, slot: usize) -> f64 {
        self.legs.get(slot).map(|leg| leg.fare).unwrap_or(0.0)
    }

    /// Boarding transition for a sharing slot. Returns false when the
    /// slot is unknown or already occupied.
    pub fn board(&mut self, slot: usize, location: Option<Location>, now: DateTime<Utc>) -> bool {
        let Some(leg) = self.legs.get_mut(slot) else {
            return false;
        };
        if leg.onboard {
            return false;
        }
        let ride_id = format!("RIDE-{}-{}", slot + 1, now.timestamp());
        leg.board(ride_id, location, now);
        log::info!("[FARE] passenger {} boarded at {:?}", slot + 1, location);
        true
    }

    /// Alighting transition for a sharing slot. Emits the completed-ride
    /// record exactly once, then resets the slot; alighting an empty
    /// slot is a no-op.
    pub fn alight(
        &mut self,
        slot: usize,
        location: Option<Location>,
        now: DateTime<Utc>,
    ) -> Option<RideRecord> {
        let leg = self.legs.get_mut(slot)?;
        if !leg.onboard {
            return None;
        }
        let record = Self::close_leg(leg, location, now, self.rate_per_km, Some(slot as u8 + 1));
        log::info!(
            "[FARE] passenger {} ride complete: {:.2} over {:.3} km",
            slot + 1,
            record.fare_amount,
            record.distance_km
        );
        Some(record)
    }

    /// Boarding semantics for the private leg; the caller is expected to
    /// reset the GPS trip counters alongside.
    pub fn start_private(&mut self, location: Option<Location>, now: DateTime<Utc>) -> bool {
        if self.private.onboard {
            return false;
        }
        let ride_id = format!("PRIVATE-{}", now.timestamp());
        self.private.board(ride_id, location, now);
        self.private_max_speed_kmh = 0.0;
        log::info!("[FARE] private trip started");
        true
    }

    /// Alighting semantics for the private leg, additionally reporting
    /// the unfiltered GPS accumulator and the observed maximum speed.
    pub fn stop_private(
        &mut self,
        location: Option<Location>,
        now: DateTime<Utc>,
        gps_total_distance_km: f64,
    ) -> Option<RideRecord> {
        if !self.private.onboard {
            return None;
        }
        let mut record = Self::close_leg(&mut self.private, location, now, self.rate_per_km, None);
        record.gps_total_distance_km = Some(round_to(gps_total_distance_km, 3));
        record.max_speed_kmh = Some(round_to(self.private_max_speed_kmh, 1));
        log::info!(
            "[FARE] private trip complete: {:.2} over {:.3} km ({:.3} km raw GPS)",
            record.fare_amount,
            record.distance_km,
            gps_total_distance_km
        );
        Some(record)
    }

    fn close_leg(
        leg: &mut TripLeg,
        location: Option<Location>,
        now: DateTime<Utc>,
        rate: f64,
        passenger_id: Option<u8>,
    ) -> RideRecord {
        let start_time = leg.start_time.unwrap_or(now);
        let duration_minutes = (now - start_time).num_milliseconds() as f64 / 60_000.0;
        let duration_hours = duration_minutes / 60.0;
        let average_speed_kmh = if duration_hours > 0.0 {
            leg.distance_km / duration_hours
        } else {
            0.0
        };
        let record = RideRecord {
            ride_id: leg.ride_id.clone().unwrap_or_default(),
            passenger_id,
            start_time,
            end_time: now,
            duration_minutes: round_to(duration_minutes, 1),
            distance_km: round_to(leg.distance_km, 3),
            straight_line_km: round_to(distance_km(leg.start_location, location), 3),
            fare_amount: round_to(leg.fare, 2),
            fare_rate_per_km: rate,
            waiting_minutes: round_to(leg.waiting_minutes, 1),
            start_location: leg.start_location,
            end_location: location,
            average_speed_kmh: round_to(average_speed_kmh, 1),
            gps_total_distance_km: None,
            max_speed_kmh: None,
        };
        leg.reset();
        record
    }

    /// Accumulation tick. Every live leg is charged against the same
    /// location/speed/delta; sharing legs only accumulate while the
    /// coordinator is in Sharing mode. Returns the slots whose fare
    /// changed, with their new amounts, in slot order.
    pub fn tick(
        &mut self,
        location: Location,
        speed_kmh: f64,
        dt_secs: f64,
        sharing_active: bool,
    ) -> Vec<(FareSlot, f64)> {
        let mut updates = Vec::new();
        if sharing_active {
            for slot in 0..self.legs.len() {
                let leg = &mut self.legs[slot];
                if leg.onboard
                    && Self::charge(
                        leg,
                        location,
                        speed_kmh,
                        dt_secs,
                        self.rate_per_km,
                        self.waiting_rate_per_minute,
                        self.waiting_speed_threshold_kmh,
                        self.noise_floor_km,
                    )
                {
                    updates.push((FareSlot::Sharing(slot), leg.fare));
                }
            }
        }
        if self.private.onboard {
            self.private_max_speed_kmh = self.private_max_speed_kmh.max(speed_kmh);
            if Self::charge(
                &mut self.private,
                location,
                speed_kmh,
                dt_secs,
                self.rate_per_km,
                self.waiting_rate_per_minute,
                self.waiting_speed_threshold_kmh,
                self.noise_floor_km,
            ) {
                updates.push((FareSlot::Private, self.private.fare));
            }
        }
        updates
    }

    /// One leg, one tick. The distance charge applies above the noise
    /// floor; the waiting charge applies below the speed threshold.
    /// The two are independent and can both land in the same tick.
    #[allow(clippy::too_many_arguments)]
    fn charge(
        leg: &mut TripLeg,
        location: Location,
        speed_kmh: f64,
        dt_secs: f64,
        rate_per_km: f64,
        waiting_rate_per_minute: f64,
        waiting_threshold_kmh: f64,
        noise_floor_km: f64,
    ) -> bool {
        let mut changed = false;
        match leg.last_location {
            None => {
                // First fix since boarding; nothing to charge yet.
                leg.last_location = Some(location);
                if leg.start_location.is_none() {
                    leg.start_location = Some(location);
                }
            }
            Some(last) => {
                let moved = distance_km(Some(last), Some(location));
                if moved > noise_floor_km {
                    leg.fare += moved * rate_per_km;
                    leg.distance_km += moved;
                    leg.last_location = Some(location);
                    changed = true;
                }
            }
        }
        if speed_kmh < waiting_threshold_kmh {
            let minutes = dt_secs / 60.0;
            leg.fare += minutes * waiting_rate_per_minute;
            leg.waiting_minutes += minutes;
            changed = true;
        }
        changed
    }
}

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration};

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Starting point used until the first fix arrives (Mumbai).
pub const DEFAULT_LOCATION: Location = Location {
    latitude: 19.0760,
    longitude: 72.8777,
};

/// Decimal-degree coordinate pair.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Location {
            latitude,
            longitude,
        }
    }
}

/// Great-circle distance between two points in km (haversine).
pub fn haversine_km(a: Location, b: Location) -> f64 {
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.latitude.to_radians().cos() * b.latitude.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

/// Distance tolerant of missing fixes: an absent endpoint counts as zero travel.
pub fn distance_km(a: Option<Location>, b: Option<Location>) -> f64 {
    match (a, b) {
        (Some(a), Some(b)) => haversine_km(a, b),
        _ => 0.0,
    }
}

/// One positioning sample, produced at a fixed cadence by the GPS task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GeoSample {
    pub location: Location,
    pub speed_kmh: f64,
    pub heading_deg: f64,
    pub altitude_m: f64,
    pub satellites: u32,
    pub fix_valid: bool,
    /// Unconditional trip accumulator snapshot, in km.
    pub total_distance_km: f64,
    /// Unix seconds.
    pub timestamp: f64,
}

/// Commands the orchestrator can send into the GPS task.
#[derive(Clone, Copy, Debug)]
pub enum GpsCommand {
    ResetTrip,
}

// ── NMEA sentence parsing ─────────────────────────────────────────────

struct GgaFix {
    location: Location,
    altitude_m: f64,
    satellites: u32,
}

/// ddmm.mmmm (or dddmm.mmmm) to signed decimal degrees.
fn parse_coordinate(raw: &str, hemisphere: &str, degree_digits: usize) -> Option<f64> {
    if !raw.is_ascii() || raw.len() <= degree_digits {
        return None;
    }
    let degrees: f64 = raw[..degree_digits].parse().ok()?;
    let minutes: f64 = raw[degree_digits..].parse().ok()?;
    let mut value = degrees + minutes / 60.0;
    if hemisphere == "S" || hemisphere == "W" {
        value = -value;
    }
    Some(value)
}

/// $GPGGA: position, fix quality, satellite count, altitude.
/// Returns None for malformed sentences or quality 0 (no fix).
fn parse_gga(sentence: &str) -> Option<GgaFix> {
    let parts: Vec<&str> = sentence.split(',').collect();
    if parts.len() < 15 {
        return None;
    }
    let (lat_raw, lat_dir, lon_raw, lon_dir) = (parts[2], parts[3], parts[4], parts[5]);
    if lat_raw.is_empty() || lon_raw.is_empty() || parts[6] == "0" {
        return None;
    }
    let latitude = parse_coordinate(lat_raw, lat_dir, 2)?;
    let longitude = parse_coordinate(lon_raw, lon_dir, 3)?;
    let satellites = parts[7].parse().unwrap_or(0);
    let altitude_m = parts[9].parse().unwrap_or(0.0);
    Some(GgaFix {
        location: Location::new(latitude, longitude),
        altitude_m,
        satellites,
    })
}

/// $GPVTG: ground speed in km/h (field 7).
fn parse_vtg(sentence: &str) -> Option<f64> {
    let parts: Vec<&str> = sentence.split(',').collect();
    if parts.len() > 7 && !parts[7].is_empty() {
        return parts[7].parse().ok();
    }
    None
}

/// $GPGSA: fix type, where 2 (2D) and 3 (3D) count as valid.
fn parse_gsa(sentence: &str) -> Option<bool> {
    let parts: Vec<&str> = sentence.split(',').collect();
    if parts.len() > 2 {
        return Some(parts[2] == "2" || parts[2] == "3");
    }
    None
}

// ── Simulated source ──────────────────────────────────────────────────

/// Waypoint loop around the default area, walked with deterministic jitter.
/// Used whenever the live serial source is unavailable.
struct SimulatedRoute {
    waypoints: [Location; 5],
    target: usize,
    progress: f64,
    tick: u64,
}

impl SimulatedRoute {
    fn new() -> Self {
        SimulatedRoute {
            waypoints: [
                Location::new(19.0760, 72.8777),
                Location::new(19.0800, 72.8800),
                Location::new(19.0850, 72.8750),
                Location::new(19.0820, 72.8720),
                Location::new(19.0790, 72.8760),
            ],
            target: 1,
            progress: 0.0,
            tick: 0,
        }
    }

    /// Advance one sample period and return the next jittered position.
    fn advance(&mut self) -> Location {
        self.tick += 1;
        // ~15 km/h over the ~500 m legs.
        self.progress += 0.008;
        if self.progress >= 1.0 {
            self.progress = 0.0;
            self.target = (self.target + 1) % self.waypoints.len();
        }
        let from = self.waypoints[(self.target + self.waypoints.len() - 1) % self.waypoints.len()];
        let to = self.waypoints[self.target];
        let t = self.tick as f64;
        let jitter_lat = (t * 0.7).sin() * 0.0001;
        let jitter_lon = (t * 1.1).cos() * 0.0001;
        Location::new(
            from.latitude + (to.latitude - from.latitude) * self.progress + jitter_lat,
            from.longitude + (to.longitude - from.longitude) * self.progress + jitter_lon,
        )
    }

    fn satellites(&self) -> u32 {
        6 + (self.tick % 7) as u32
    }

    fn altitude_m(&self) -> f64 {
        30.0 + (self.tick as f64 * 0.3).sin() * 20.0
    }
}

enum GpsSource {
    Live(BufReader<File>),
    Simulated(SimulatedRoute),
}

// ── Engine ────────────────────────────────────────────────────────────

/// Snapshot of receiver health for the display collaborator.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct GpsStatus {
    pub fix: bool,
    pub satellites: u32,
    pub altitude_m: f64,
    pub speed_kmh: f64,
    pub heading_deg: f64,
}

/// Maintains last-known position/speed/heading and the unconditional
/// trip-distance accumulator. Owns its source exclusively; the rest of
/// the system only ever sees the `GeoSample`s it emits.
pub struct GpsEngine {
    source: GpsSource,
    current_location: Location,
    previous_location: Option<Location>,
    speed_kmh: f64,
    heading_deg: f64,
    altitude_m: f64,
    satellites: u32,
    fix_valid: bool,
    total_distance_km: f64,
    trip_start: DateTime<Utc>,
    last_sample_at: Option<f64>,
}

impl GpsEngine {
    /// Try the live NMEA device first; fall back to simulation when it
    /// cannot be opened. The fallback is silent beyond a single log line.
    pub fn open(device: &str) -> Self {
        match File::open(device) {
            Ok(file) => {
                log::info!("[GPS] reading NMEA sentences from {}", device);
                Self::with_source(GpsSource::Live(BufReader::new(file)))
            }
            Err(e) => {
                log::warn!("[GPS] cannot open {} ({}), using simulated source", device, e);
                Self::simulated()
            }
        }
    }

    pub fn simulated() -> Self {
        Self::with_source(GpsSource::Simulated(SimulatedRoute::new()))
    }

    fn with_source(source: GpsSource) -> Self {
        GpsEngine {
            source,
            current_location: DEFAULT_LOCATION,
            previous_location: None,
            speed_kmh: 0.0,
            heading_deg: 0.0,
            altitude_m: 0.0,
            satellites: 0,
            fix_valid: false,
            total_distance_km: 0.0,
            trip_start: Utc::now(),
            last_sample_at: None,
        }
    }

    /// Produce the next sample. Live mode drains pending sentences from the
    /// device; malformed input keeps the previous state and is never an error.
    pub fn sample(&mut self) -> GeoSample {
        let now = unix_now();
        let dt = self
            .last_sample_at
            .map(|t| (now - t).max(0.1))
            .unwrap_or(1.0);
        self.last_sample_at = Some(now);

        if matches!(self.source, GpsSource::Live(_)) {
            self.poll_live();
        } else {
            self.poll_simulated(dt);
        }

        GeoSample {
            location: self.current_location,
            speed_kmh: self.speed_kmh,
            heading_deg: self.heading_deg,
            altitude_m: self.altitude_m,
            satellites: self.satellites,
            fix_valid: self.fix_valid,
            total_distance_km: self.total_distance_km,
            timestamp: now,
        }
    }

    fn poll_live(&mut self) {
        // Collect sentences first so the position update below can borrow
        // the rest of the engine mutably.
        let mut lines = Vec::new();
        if let GpsSource::Live(reader) = &mut self.source {
            for _ in 0..32 {
                let mut line = String::new();
                match reader.read_line(&mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let trimmed = line.trim().to_string();
                        let got_position = trimmed.starts_with("$GPGGA");
                        lines.push(trimmed);
                        if got_position {
                            break;
                        }
                    }
                }
            }
        }
        for line in lines {
            self.apply_sentence(&line);
        }
    }

    fn apply_sentence(&mut self, sentence: &str) {
        if sentence.starts_with("$GPGGA") {
            if let Some(fix) = parse_gga(sentence) {
                self.advance_position(fix.location);
                self.altitude_m = fix.altitude_m;
                self.satellites = fix.satellites;
                self.fix_valid = true;
            }
        } else if sentence.starts_with("$GPVTG") {
            if let Some(speed) = parse_vtg(sentence) {
                self.speed_kmh = speed;
            }
        } else if sentence.starts_with("$GPGSA") {
            if let Some(fix) = parse_gsa(sentence) {
                self.fix_valid = fix;
            }
        }
    }

    fn poll_simulated(&mut self, dt_secs: f64) {
        let (next, satellites, altitude) = match &mut self.source {
            GpsSource::Simulated(route) => (route.advance(), route.satellites(), route.altitude_m()),
            GpsSource::Live(_) => return,
        };
        let moved = haversine_km(self.current_location, next);
        let raw_kmh = moved * 3600.0 / dt_secs;
        let wobble = (self.total_distance_km * 40.0).sin() * 2.0;
        self.speed_kmh = (raw_kmh + wobble).clamp(5.0, 45.0);
        self.heading_deg = (self.heading_deg + (moved * 900.0).sin() * 5.0).rem_euclid(360.0);
        self.satellites = satellites;
        self.altitude_m = altitude;
        self.fix_valid = true;
        self.advance_position(next);
    }

    fn advance_position(&mut self, next: Location) {
        // No accumulation on the first fix (or the first after a trip
        // reset); the hop from the stale position is not travel.
        if self.previous_location.is_some() {
            self.total_distance_km += haversine_km(self.current_location, next);
        }
        self.previous_location = Some(self.current_location);
        self.current_location = next;
    }

    pub fn location(&self) -> Location {
        self.current_location
    }

    pub fn total_distance_km(&self) -> f64 {
        self.total_distance_km
    }

    pub fn trip_duration_minutes(&self) -> f64 {
        (Utc::now() - self.trip_start).num_milliseconds() as f64 / 60_000.0
    }

    pub fn status(&self) -> GpsStatus {
        GpsStatus {
            fix: self.fix_valid,
            satellites: self.satellites,
            altitude_m: self.altitude_m,
            speed_kmh: self.speed_kmh,
            heading_deg: self.heading_deg,
        }
    }

    /// Zero the trip accumulator and stamp a new trip start.
    /// Triggered from the orchestrator at a private-trip start.
    pub fn reset_trip(&mut self) {
        self.total_distance_km = 0.0;
        self.previous_location = None;
        self.trip_start = Utc::now();
        log::info!("[GPS] trip counters reset");
    }
}

pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Fixed-cadence sampling task. Emits one `GeoSample` per period and
/// handles orchestrator commands; exits within one period of the stop
/// signal flipping.
pub async fn gps_loop(
    mut engine: GpsEngine,
    tx: mpsc::Sender<GeoSample>,
    mut commands: mpsc::Receiver<GpsCommand>,
    mut stop: watch::Receiver<bool>,
    period_ms: u64,
) {
    let mut ticker = interval(Duration::from_millis(period_ms));
    let mut sample_count = 0u64;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let sample = engine.sample();
                sample_count += 1;
                if sample_count % 60 == 0 {
                    log::debug!("[GPS] {} samples, {:.3} km total", sample_count, sample.total_distance_km);
                }
                if tx.send(sample).await.is_err() {
                    break;
                }
            }
            Some(cmd) = commands.recv() => {
                match cmd {
                    GpsCommand::ResetTrip => engine.reset_trip(),
                }
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
            }
        }
    }
    log::info!("[GPS] sampling loop stopped after {} samples", sample_count);
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const GGA_VALID: &str =
        "$GPGGA,123519,1904.5600,N,07252.6620,E,1,08,0.9,545.4,M,46.9,M,,*47";

    #[test]
    fn haversine_zero_for_identical_points() {
        let a = Location::new(19.0760, 72.8777);
        assert_relative_eq!(haversine_km(a, a), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn haversine_is_symmetric() {
        let a = Location::new(19.0760, 72.8777);
        let b = Location::new(28.6139, 77.2090);
        assert_relative_eq!(haversine_km(a, b), haversine_km(b, a), epsilon = 1e-9);
    }

    #[test]
    fn haversine_known_distance() {
        // Mumbai to Delhi, roughly 1150 km.
        let a = Location::new(19.0760, 72.8777);
        let b = Location::new(28.6139, 77.2090);
        let d = haversine_km(a, b);
        assert!(d > 1100.0 && d < 1200.0, "got {}", d);
    }

    #[test]
    fn distance_treats_missing_endpoints_as_zero() {
        let a = Location::new(19.0, 72.0);
        assert_eq!(distance_km(None, Some(a)), 0.0);
        assert_eq!(distance_km(Some(a), None), 0.0);
        assert_eq!(distance_km(None, None), 0.0);
    }

    #[test]
    fn gga_parses_position_and_quality() {
        let fix = parse_gga(GGA_VALID).expect("valid sentence");
        assert_relative_eq!(fix.location.latitude, 19.0 + 4.56 / 60.0, epsilon = 1e-9);
        assert_relative_eq!(fix.location.longitude, 72.0 + 52.662 / 60.0, epsilon = 1e-9);
        assert_eq!(fix.satellites, 8);
        assert_relative_eq!(fix.altitude_m, 545.4, epsilon = 1e-9);
    }

    #[test]
    fn gga_southern_western_hemispheres_negate() {
        let s = "$GPGGA,123519,3348.1200,S,15112.3600,W,1,05,1.1,12.0,M,0.0,M,,*47";
        let fix = parse_gga(s).expect("valid sentence");
        assert!(fix.location.latitude < 0.0);
        assert!(fix.location.longitude < 0.0);
    }

    #[test]
    fn gga_rejects_no_fix_and_garbage() {
        let no_fix = "$GPGGA,123519,1904.5600,N,07252.6620,E,0,08,0.9,545.4,M,46.9,M,,*47";
        assert!(parse_gga(no_fix).is_none());
        assert!(parse_gga("$GPGGA,123519").is_none());
        assert!(parse_gga("$GPGGA,,,,,,,,,,,,,,").is_none());
        assert!(parse_gga("$GPGGA,123519,xx.yy,N,07252.6620,E,1,08,0.9,5,M,4,M,,*47").is_none());
    }

    #[test]
    fn vtg_extracts_speed() {
        let s = "$GPVTG,054.7,T,034.4,M,005.5,N,010.2,K*48";
        assert_relative_eq!(parse_vtg(s).expect("speed"), 10.2, epsilon = 1e-9);
        assert!(parse_vtg("$GPVTG,054.7,T").is_none());
    }

    #[test]
    fn gsa_fix_types() {
        assert_eq!(parse_gsa("$GPGSA,A,3,04,05,,09,12,,,24,,,,,2.5,1.3,2.1*39"), Some(true));
        assert_eq!(parse_gsa("$GPGSA,A,1,,,,,,,,,,,,,99.9,99.9,99.9*30"), Some(false));
        assert!(parse_gsa("$GPGSA").is_none());
    }

    #[test]
    fn simulated_engine_accumulates_and_resets() {
        let mut engine = GpsEngine::simulated();
        for _ in 0..10 {
            let sample = engine.sample();
            assert!(sample.fix_valid);
        }
        assert!(engine.total_distance_km() > 0.0);
        let status = engine.status();
        assert!(status.fix);
        assert!(status.satellites >= 6);
        assert!(engine.trip_duration_minutes() >= 0.0);

        engine.reset_trip();
        assert_eq!(engine.total_distance_km(), 0.0);
    }

    #[test]
    fn live_engine_applies_sentences() {
        let mut engine = GpsEngine::simulated();
        engine.apply_sentence(GGA_VALID);
        assert!(engine.fix_valid);
        assert_eq!(engine.satellites, 8);
        engine.apply_sentence("$GPVTG,054.7,T,034.4,M,005.5,N,023.4,K*48");
        assert_relative_eq!(engine.speed_kmh, 23.4, epsilon = 1e-9);
        // Garbage leaves state untouched.
        engine.apply_sentence("$GPGGA,not,a,sentence");
        assert!(engine.fix_valid);
    }
}

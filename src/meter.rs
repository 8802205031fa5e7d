use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep, Duration};

use crate::config::MeterConfig;
use crate::events::{FareSlot, MeterEvent};
use crate::fare::FareEngine;
use crate::geo::{GeoSample, GpsCommand, Location};
use crate::inputs::InputEvent;
use crate::mode::{ModeCoordinator, OperatingMode};
use crate::sos::{alarm_loop, AlarmSink, CountdownStep, PressAction, ReleaseAction, SosMachine};

/// Everything the sampling tasks are not allowed to touch directly:
/// trip legs, the active mode, and the emergency state. Guarded by a
/// single mutex; the lock is only ever held for a state transition,
/// never across a sleep or any I/O.
pub struct MeterState {
    pub fare: FareEngine,
    pub mode: ModeCoordinator,
    pub sos: SosMachine,
    last_fix: Option<GeoSample>,
    last_tick_ts: Option<f64>,
}

impl MeterState {
    fn location(&self) -> Option<Location> {
        self.last_fix.as_ref().map(|s| s.location)
    }

    fn gps_total_km(&self) -> f64 {
        self.last_fix.as_ref().map(|s| s.total_distance_km).unwrap_or(0.0)
    }
}

/// Live readout for the display collaborator, taken from the most
/// recent valid sample.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct MeterStats {
    pub speed_kmh: f64,
    pub total_distance_km: f64,
    pub gps_fix: bool,
    pub satellites: u32,
    pub location: Option<Location>,
}

/// Orchestrator. Owns the shared trip state, consumes sampler and GPS
/// events from their channels, and broadcasts the resulting
/// notifications to collaborators in commit order.
pub struct Meter {
    state: Mutex<MeterState>,
    events: broadcast::Sender<MeterEvent>,
    gps_commands: mpsc::Sender<GpsCommand>,
    alarm_active: watch::Sender<bool>,
    alarm_sink: Arc<dyn AlarmSink>,
    config: MeterConfig,
}

impl Meter {
    pub fn new(
        config: MeterConfig,
        gps_commands: mpsc::Sender<GpsCommand>,
        alarm_sink: Arc<dyn AlarmSink>,
    ) -> Self {
        let (events, _) = broadcast::channel(128);
        let (alarm_active, _) = watch::channel(false);
        Meter {
            state: Mutex::new(MeterState {
                fare: FareEngine::new(&config),
                mode: ModeCoordinator::new(),
                sos: SosMachine::new(config.sos_countdown_secs),
                last_fix: None,
                last_tick_ts: None,
            }),
            events,
            gps_commands,
            alarm_active,
            alarm_sink,
            config,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeterEvent> {
        self.events.subscribe()
    }

    pub fn current_mode(&self) -> OperatingMode {
        self.state
            .lock()
            .map(|st| st.mode.current())
            .unwrap_or(OperatingMode::ForHire)
    }

    /// Real-time statistics for on-screen widgets. Values go stale, not
    /// absent, when the fix degrades.
    pub fn real_time_stats(&self) -> MeterStats {
        let last_fix = self
            .state
            .lock()
            .ok()
            .and_then(|st| st.last_fix.clone());
        match last_fix {
            Some(sample) => MeterStats {
                speed_kmh: sample.speed_kmh,
                total_distance_km: sample.total_distance_km,
                gps_fix: sample.fix_valid,
                satellites: sample.satellites,
                location: Some(sample.location),
            },
            None => MeterStats {
                speed_kmh: 0.0,
                total_distance_km: 0.0,
                gps_fix: false,
                satellites: 0,
                location: None,
            },
        }
    }

    /// Runtime rate change; applies from the next tick.
    pub fn set_fare_rate(&self, rate: f64) {
        if let Ok(mut st) = self.state.lock() {
            st.fare.set_rate(rate);
        }
    }

    /// Manual SOS override from a collaborator. Idempotent.
    pub fn deactivate_sos(self: &Arc<Self>) {
        let action = match self.state.lock() {
            Ok(mut st) => st.sos.deactivate(),
            Err(_) => return,
        };
        self.apply_release_action(action);
    }

    fn emit(&self, event: MeterEvent) {
        // No receivers is fine; collaborators come and go.
        let _ = self.events.send(event);
    }

    /// Main event loop. Exits when the stop signal flips or both input
    /// channels close.
    pub async fn run(
        self: Arc<Self>,
        mut geo_rx: mpsc::Receiver<GeoSample>,
        mut input_rx: mpsc::Receiver<InputEvent>,
        mut stop: watch::Receiver<bool>,
    ) {
        log::info!("[METER] orchestrator running");
        loop {
            tokio::select! {
                sample = geo_rx.recv() => {
                    match sample {
                        Some(sample) => self.handle_sample(sample),
                        None => break,
                    }
                }
                event = input_rx.recv() => {
                    match event {
                        Some(event) => self.handle_input(&event),
                        None => break,
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
        // Silence the alarm on the way out.
        self.alarm_active.send_replace(false);
        log::info!("[METER] orchestrator stopped");
    }

    /// One accumulation tick. All onboard legs are charged against this
    /// same sample and time delta; events go out only after the whole
    /// mutation has committed.
    fn handle_sample(self: &Arc<Self>, sample: GeoSample) {
        if !sample.fix_valid {
            return;
        }
        let mut out = Vec::new();
        if let Ok(mut st) = self.state.lock() {
            let dt_secs = st
                .last_tick_ts
                .map(|t| (sample.timestamp - t).clamp(0.1, 10.0))
                .unwrap_or(self.config.gps_sample_period_ms as f64 / 1000.0);
            st.last_tick_ts = Some(sample.timestamp);

            out.push(MeterEvent::LocationUpdated {
                latitude: sample.location.latitude,
                longitude: sample.location.longitude,
            });
            out.push(MeterEvent::SpeedUpdated {
                kmh: sample.speed_kmh,
            });
            out.push(MeterEvent::DistanceUpdated {
                km: sample.total_distance_km,
            });

            let sharing = st.mode.current() == OperatingMode::Sharing;
            for (slot, amount) in st.fare.tick(sample.location, sample.speed_kmh, dt_secs, sharing)
            {
                out.push(MeterEvent::FareUpdated { slot, amount });
            }
            st.last_fix = Some(sample);
        }
        for event in out {
            self.emit(event);
        }
    }

    fn handle_input(self: &Arc<Self>, event: &InputEvent) {
        match event {
            InputEvent::Passenger { slot, onboard } => self.handle_passenger(*slot, *onboard),
            InputEvent::SelectorChanged(selector) => self.handle_selector(*selector),
            InputEvent::SosPressed => self.handle_sos_press(),
            InputEvent::SosReleased { .. } => self.handle_sos_release(),
        }
    }

    fn handle_passenger(self: &Arc<Self>, slot: usize, onboard: bool) {
        let mut out = vec![MeterEvent::PassengerChanged { slot, onboard }];
        if let Ok(mut st) = self.state.lock() {
            let location = st.location();
            let now = Utc::now();
            if onboard {
                if st.mode.current() == OperatingMode::Sharing {
                    if st.fare.board(slot, location, now) {
                        out.push(MeterEvent::FareUpdated {
                            slot: FareSlot::Sharing(slot),
                            amount: 0.0,
                        });
                    }
                } else {
                    log::info!(
                        "[METER] passenger {} switch closed outside Sharing mode, ignored",
                        slot + 1
                    );
                }
            } else if let Some(record) = st.fare.alight(slot, location, now) {
                out.push(MeterEvent::RideCompleted {
                    slot: FareSlot::Sharing(slot),
                    record,
                });
            }
        }
        for event in out {
            self.emit(event);
        }
    }

    fn handle_selector(self: &Arc<Self>, selector: crate::mode::SelectorState) {
        let mut out = Vec::new();
        if let Ok(mut st) = self.state.lock() {
            if let Some(change) = st.mode.apply(selector) {
                out.push(MeterEvent::ModeChanged { mode: change.to });
                let location = st.location();
                let now = Utc::now();
                if change.from == OperatingMode::Private {
                    let gps_total = st.gps_total_km();
                    if let Some(record) = st.fare.stop_private(location, now, gps_total) {
                        out.push(MeterEvent::RideCompleted {
                            slot: FareSlot::Private,
                            record,
                        });
                    }
                }
                if change.to == OperatingMode::Private && st.fare.start_private(location, now) {
                    // Non-blocking; a full command queue just skips the
                    // reset and the raw accumulator stays comparable.
                    if self.gps_commands.try_send(GpsCommand::ResetTrip).is_err() {
                        log::warn!("[METER] GPS reset command dropped");
                    }
                    out.push(MeterEvent::FareUpdated {
                        slot: FareSlot::Private,
                        amount: 0.0,
                    });
                }
            }
        }
        for event in out {
            self.emit(event);
        }
    }

    fn handle_sos_press(self: &Arc<Self>) {
        let action = match self.state.lock() {
            Ok(mut st) => st.sos.press(),
            Err(_) => return,
        };
        if let PressAction::StartCountdown {
            generation,
            seconds,
        } = action
        {
            self.emit(MeterEvent::SosStatus {
                message: format!("SOS countdown: {} seconds", seconds),
            });
            self.spawn_countdown(generation);
        }
    }

    fn handle_sos_release(self: &Arc<Self>) {
        let action = match self.state.lock() {
            Ok(mut st) => st.sos.release(),
            Err(_) => return,
        };
        self.apply_release_action(action);
    }

    fn apply_release_action(self: &Arc<Self>, action: ReleaseAction) {
        match action {
            ReleaseAction::Cancelled => {
                self.emit(MeterEvent::SosStatus {
                    message: "SOS cancelled".to_string(),
                });
            }
            ReleaseAction::Deactivated => {
                self.alarm_active.send_replace(false);
                self.emit(MeterEvent::SosDeactivated);
            }
            ReleaseAction::Ignored => {}
        }
    }

    fn countdown_live(&self, generation: u64) -> bool {
        self.state
            .lock()
            .map(|st| st.sos.generation() == generation && st.sos.in_countdown())
            .unwrap_or(false)
    }

    /// One countdown task per arming. Decrements once per second but
    /// checks for cancellation every 100 ms so an early release stops
    /// it promptly; the generation tag makes a raced task inert.
    fn spawn_countdown(self: &Arc<Self>, generation: u64) {
        let meter = Arc::clone(self);
        tokio::spawn(async move {
            'countdown: loop {
                for _ in 0..10 {
                    sleep(Duration::from_millis(100)).await;
                    if !meter.countdown_live(generation) {
                        break 'countdown;
                    }
                }
                let step = match meter.state.lock() {
                    Ok(mut st) => {
                        let location = st.location();
                        st.sos.countdown_tick(generation, location, Utc::now())
                    }
                    Err(_) => break,
                };
                match step {
                    CountdownStep::Continue(remaining) => {
                        meter.emit(MeterEvent::SosStatus {
                            message: format!("SOS countdown: {} seconds", remaining),
                        });
                    }
                    CountdownStep::Activated(record) => {
                        meter.alarm_active.send_replace(true);
                        tokio::spawn(alarm_loop(
                            Arc::clone(&meter.alarm_sink),
                            meter.alarm_active.subscribe(),
                            meter.config.alarm,
                        ));
                        meter.emit(MeterEvent::SosStatus {
                            message: "SOS ACTIVATED".to_string(),
                        });
                        meter.emit(MeterEvent::SosActivated { record });
                        break;
                    }
                    CountdownStep::Stale => break,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::unix_now;
    use crate::inputs::InputEvent;
    use crate::mode::SelectorState;
    use crate::sos::{LogAlarm, SosState};
    use tokio::time::timeout;

    fn sample_at(lat: f64, lon: f64, speed: f64, ts: f64) -> GeoSample {
        GeoSample {
            location: Location::new(lat, lon),
            speed_kmh: speed,
            heading_deg: 0.0,
            altitude_m: 12.0,
            satellites: 8,
            fix_valid: true,
            total_distance_km: 0.0,
            timestamp: ts,
        }
    }

    struct Rig {
        meter: Arc<Meter>,
        geo_tx: mpsc::Sender<GeoSample>,
        input_tx: mpsc::Sender<InputEvent>,
        events: broadcast::Receiver<MeterEvent>,
        _stop_tx: watch::Sender<bool>,
    }

    fn rig() -> Rig {
        let (gps_cmd_tx, _gps_cmd_rx) = mpsc::channel(8);
        let meter = Arc::new(Meter::new(MeterConfig::default(), gps_cmd_tx, Arc::new(LogAlarm)));
        let (geo_tx, geo_rx) = mpsc::channel(32);
        let (input_tx, input_rx) = mpsc::channel(32);
        let (stop_tx, stop_rx) = watch::channel(false);
        let events = meter.subscribe();
        tokio::spawn(Arc::clone(&meter).run(geo_rx, input_rx, stop_rx));
        Rig {
            meter,
            geo_tx,
            input_tx,
            events,
            _stop_tx: stop_tx,
        }
    }

    async fn next_event(rx: &mut broadcast::Receiver<MeterEvent>) -> MeterEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn sharing_ride_flows_through_event_loop_in_commit_order() {
        let mut rig = rig();
        let t0 = unix_now();

        // Select Sharing, then board slot 0.
        rig.input_tx
            .send(InputEvent::SelectorChanged(SelectorState {
                sharing: true,
                ..Default::default()
            }))
            .await
            .expect("send");
        assert!(matches!(
            next_event(&mut rig.events).await,
            MeterEvent::ModeChanged { mode: OperatingMode::Sharing }
        ));

        rig.geo_tx
            .send(sample_at(19.0760, 72.8777, 15.0, t0))
            .await
            .expect("send");
        // Location, speed, distance notifications for the tick.
        assert!(matches!(next_event(&mut rig.events).await, MeterEvent::LocationUpdated { .. }));
        assert!(matches!(next_event(&mut rig.events).await, MeterEvent::SpeedUpdated { .. }));
        assert!(matches!(next_event(&mut rig.events).await, MeterEvent::DistanceUpdated { .. }));

        let stats = rig.meter.real_time_stats();
        assert!(stats.gps_fix);
        assert_eq!(stats.speed_kmh, 15.0);
        assert!(stats.location.is_some());

        rig.input_tx
            .send(InputEvent::Passenger { slot: 0, onboard: true })
            .await
            .expect("send");
        assert!(matches!(
            next_event(&mut rig.events).await,
            MeterEvent::PassengerChanged { slot: 0, onboard: true }
        ));
        match next_event(&mut rig.events).await {
            MeterEvent::FareUpdated { slot: FareSlot::Sharing(0), amount } => {
                assert_eq!(amount, 0.0);
            }
            other => panic!("expected boarding fare reset, got {:?}", other),
        }

        // One 20 m tick charges distance fare.
        rig.geo_tx
            .send(sample_at(19.0760 + 0.00018, 72.8777, 15.0, t0 + 1.0))
            .await
            .expect("send");
        assert!(matches!(next_event(&mut rig.events).await, MeterEvent::LocationUpdated { .. }));
        assert!(matches!(next_event(&mut rig.events).await, MeterEvent::SpeedUpdated { .. }));
        assert!(matches!(next_event(&mut rig.events).await, MeterEvent::DistanceUpdated { .. }));
        match next_event(&mut rig.events).await {
            MeterEvent::FareUpdated { slot: FareSlot::Sharing(0), amount } => {
                assert!(amount > 0.0);
            }
            other => panic!("expected fare update, got {:?}", other),
        }

        // Alight: exactly one completed-ride record.
        rig.input_tx
            .send(InputEvent::Passenger { slot: 0, onboard: false })
            .await
            .expect("send");
        assert!(matches!(
            next_event(&mut rig.events).await,
            MeterEvent::PassengerChanged { slot: 0, onboard: false }
        ));
        match next_event(&mut rig.events).await {
            MeterEvent::RideCompleted { slot: FareSlot::Sharing(0), record } => {
                assert!(record.fare_amount > 0.0);
                assert!(record.ride_id.starts_with("RIDE-1-"));
            }
            other => panic!("expected ride record, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn boarding_outside_sharing_mode_is_ignored() {
        let mut rig = rig();
        rig.input_tx
            .send(InputEvent::Passenger { slot: 2, onboard: true })
            .await
            .expect("send");
        assert!(matches!(
            next_event(&mut rig.events).await,
            MeterEvent::PassengerChanged { slot: 2, onboard: true }
        ));
        // No boarding side effects in ForHire mode.
        assert!(timeout(Duration::from_millis(100), rig.events.recv()).await.is_err());
        assert!(!rig.meter.state.lock().unwrap().fare.onboard(2));
    }

    #[tokio::test]
    async fn private_mode_round_trip_emits_record_with_gps_total() {
        let mut rig = rig();
        let t0 = unix_now();
        let mut sample = sample_at(19.0760, 72.8777, 10.0, t0);
        sample.total_distance_km = 1.5;
        rig.geo_tx.send(sample).await.expect("send");
        for _ in 0..3 {
            next_event(&mut rig.events).await;
        }

        rig.input_tx
            .send(InputEvent::SelectorChanged(SelectorState {
                private: true,
                ..Default::default()
            }))
            .await
            .expect("send");
        assert!(matches!(
            next_event(&mut rig.events).await,
            MeterEvent::ModeChanged { mode: OperatingMode::Private }
        ));
        assert!(matches!(
            next_event(&mut rig.events).await,
            MeterEvent::FareUpdated { slot: FareSlot::Private, amount: _ }
        ));

        // Back to ForHire: the private ride closes out.
        rig.input_tx
            .send(InputEvent::SelectorChanged(SelectorState::default()))
            .await
            .expect("send");
        assert!(matches!(
            next_event(&mut rig.events).await,
            MeterEvent::ModeChanged { mode: OperatingMode::ForHire }
        ));
        match next_event(&mut rig.events).await {
            MeterEvent::RideCompleted { slot: FareSlot::Private, record } => {
                assert!(record.ride_id.starts_with("PRIVATE-"));
                assert!(record.gps_total_distance_km.is_some());
                assert!(record.max_speed_kmh.is_some());
            }
            other => panic!("expected private record, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn sos_release_during_countdown_cancels() {
        let mut rig = rig();
        rig.input_tx.send(InputEvent::SosPressed).await.expect("send");
        match next_event(&mut rig.events).await {
            MeterEvent::SosStatus { message } => assert!(message.contains("5")),
            other => panic!("expected countdown status, got {:?}", other),
        }

        rig.input_tx
            .send(InputEvent::SosReleased { held: Duration::from_secs(1) })
            .await
            .expect("send");
        match next_event(&mut rig.events).await {
            MeterEvent::SosStatus { message } => assert!(message.contains("cancelled")),
            other => panic!("expected cancellation status, got {:?}", other),
        }
        assert_eq!(rig.meter.state.lock().unwrap().sos.state(), SosState::Normal);
    }

    #[tokio::test]
    async fn manual_deactivate_from_normal_is_a_no_op() {
        let rig = rig();
        rig.meter.deactivate_sos();
        let mut events = rig.meter.subscribe();
        assert!(timeout(Duration::from_millis(100), events.recv()).await.is_err());
    }
}

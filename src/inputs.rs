use std::collections::HashMap;
use std::fs;
use std::sync::Mutex;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, Duration, Instant};

use crate::mode::SelectorState;

/// Number of sharing-mode passenger switches.
pub const PASSENGER_SLOTS: usize = 3;

// BCM pin assignments from the vehicle wiring loom.
const PASSENGER_PINS: [u8; PASSENGER_SLOTS] = [6, 13, 19];
const MODE_PRIVATE_PIN: u8 = 7;
const MODE_SHARING_PIN: u8 = 8;
const MODE_WAITING_PIN: u8 = 18;
const MODE_FOR_HIRE_PIN: u8 = 23;
const SOS_BUTTON_PIN: u8 = 12;

/// Raw electrical level. All lines are pulled high at idle and grounded
/// when asserted, so asserted == Low.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineLevel {
    High,
    Low,
}

impl LineLevel {
    pub fn asserted(self) -> bool {
        self == LineLevel::Low
    }
}

/// Named binary input lines the sampler watches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InputLine {
    Passenger(usize),
    ModePrivate,
    ModeSharing,
    ModeWaiting,
    ModeForHire,
    SosButton,
}

impl InputLine {
    pub fn bcm(self) -> u8 {
        match self {
            InputLine::Passenger(slot) => PASSENGER_PINS[slot.min(PASSENGER_SLOTS - 1)],
            InputLine::ModePrivate => MODE_PRIVATE_PIN,
            InputLine::ModeSharing => MODE_SHARING_PIN,
            InputLine::ModeWaiting => MODE_WAITING_PIN,
            InputLine::ModeForHire => MODE_FOR_HIRE_PIN,
            InputLine::SosButton => SOS_BUTTON_PIN,
        }
    }
}

/// Discrete events emitted on input transitions. Steady state never
/// produces an event.
#[derive(Clone, Debug)]
pub enum InputEvent {
    Passenger { slot: usize, onboard: bool },
    SelectorChanged(SelectorState),
    SosPressed,
    SosReleased { held: Duration },
}

/// Level source behind the sampler. Implementations own the device
/// access; the sampler owns all debounce and edge state.
pub trait InputBackend: Send + Sync {
    fn read_line(&self, line: InputLine) -> LineLevel;
}

/// Reads exported GPIO value files under /sys/class/gpio. A line that
/// cannot be read reports its idle level; the failure is logged once
/// per line and never retried per sample.
pub struct SysfsGpio {
    base: String,
    warned: Mutex<Vec<u8>>,
}

impl SysfsGpio {
    pub fn new() -> Self {
        Self::with_base("/sys/class/gpio")
    }

    pub fn with_base(base: &str) -> Self {
        SysfsGpio {
            base: base.to_string(),
            warned: Mutex::new(Vec::new()),
        }
    }
}

impl Default for SysfsGpio {
    fn default() -> Self {
        Self::new()
    }
}

impl InputBackend for SysfsGpio {
    fn read_line(&self, line: InputLine) -> LineLevel {
        let pin = line.bcm();
        let path = format!("{}/gpio{}/value", self.base, pin);
        match fs::read_to_string(&path) {
            Ok(value) => {
                if value.trim() == "0" {
                    LineLevel::Low
                } else {
                    LineLevel::High
                }
            }
            Err(e) => {
                if let Ok(mut warned) = self.warned.lock() {
                    if !warned.contains(&pin) {
                        warned.push(pin);
                        log::warn!("[INPUT] gpio{} unreadable ({}), reporting idle", pin, e);
                    }
                }
                LineLevel::High
            }
        }
    }
}

/// Scriptable backend for simulation runs and tests. Lines default to
/// the idle (High) level.
pub struct MockInputs {
    levels: Mutex<HashMap<InputLine, LineLevel>>,
}

impl MockInputs {
    pub fn new() -> Self {
        MockInputs {
            levels: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_level(&self, line: InputLine, level: LineLevel) {
        if let Ok(mut levels) = self.levels.lock() {
            levels.insert(line, level);
        }
    }

    /// Ground the line (assert it).
    pub fn assert_line(&self, line: InputLine) {
        self.set_level(line, LineLevel::Low);
    }

    /// Return the line to its pulled-up idle level.
    pub fn release_line(&self, line: InputLine) {
        self.set_level(line, LineLevel::High);
    }
}

impl Default for MockInputs {
    fn default() -> Self {
        Self::new()
    }
}

impl InputBackend for MockInputs {
    fn read_line(&self, line: InputLine) -> LineLevel {
        self.levels
            .lock()
            .ok()
            .and_then(|levels| levels.get(&line).copied())
            .unwrap_or(LineLevel::High)
    }
}

fn stopped(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow()
}

/// Passenger presence poll group. Edge-triggered: emits only when a
/// switch changes state.
pub async fn passenger_loop(
    backend: std::sync::Arc<dyn InputBackend>,
    tx: mpsc::Sender<InputEvent>,
    mut stop: watch::Receiver<bool>,
    period_ms: u64,
) {
    let mut ticker = interval(Duration::from_millis(period_ms));
    let mut onboard = [false; PASSENGER_SLOTS];
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for slot in 0..PASSENGER_SLOTS {
                    let now = backend.read_line(InputLine::Passenger(slot)).asserted();
                    if now != onboard[slot] {
                        onboard[slot] = now;
                        if tx.send(InputEvent::Passenger { slot, onboard: now }).await.is_err() {
                            return;
                        }
                    }
                }
            }
            _ = stop.changed() => {
                if stopped(&stop) {
                    break;
                }
            }
        }
    }
    log::info!("[INPUT] passenger poll loop stopped");
}

/// Rotary selector poll group. Emits the raw four-line snapshot on any
/// change; resolution to a mode happens in the coordinator.
pub async fn selector_loop(
    backend: std::sync::Arc<dyn InputBackend>,
    tx: mpsc::Sender<InputEvent>,
    mut stop: watch::Receiver<bool>,
    period_ms: u64,
) {
    let mut ticker = interval(Duration::from_millis(period_ms));
    let mut last: Option<SelectorState> = None;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let state = SelectorState {
                    private: backend.read_line(InputLine::ModePrivate).asserted(),
                    sharing: backend.read_line(InputLine::ModeSharing).asserted(),
                    waiting: backend.read_line(InputLine::ModeWaiting).asserted(),
                    for_hire: backend.read_line(InputLine::ModeForHire).asserted(),
                };
                if last != Some(state) {
                    last = Some(state);
                    if tx.send(InputEvent::SelectorChanged(state)).await.is_err() {
                        return;
                    }
                }
            }
            _ = stop.changed() => {
                if stopped(&stop) {
                    break;
                }
            }
        }
    }
    log::info!("[INPUT] selector poll loop stopped");
}

/// Emergency button poll group. The 50 ms outer scan catches the press
/// edge; while the line stays grounded a 100 ms inner poll measures the
/// continuous hold so the release event carries its duration.
pub async fn sos_loop(
    backend: std::sync::Arc<dyn InputBackend>,
    tx: mpsc::Sender<InputEvent>,
    mut stop: watch::Receiver<bool>,
    period_ms: u64,
    hold_poll_ms: u64,
) {
    let mut ticker = interval(Duration::from_millis(period_ms));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if backend.read_line(InputLine::SosButton).asserted() {
                    let pressed_at = Instant::now();
                    if tx.send(InputEvent::SosPressed).await.is_err() {
                        return;
                    }
                    while backend.read_line(InputLine::SosButton).asserted() {
                        if stopped(&stop) {
                            return;
                        }
                        sleep(Duration::from_millis(hold_poll_ms)).await;
                    }
                    let held = pressed_at.elapsed();
                    log::debug!("[INPUT] SOS button released after {:.1}s", held.as_secs_f64());
                    if tx.send(InputEvent::SosReleased { held }).await.is_err() {
                        return;
                    }
                }
            }
            _ = stop.changed() => {
                if stopped(&stop) {
                    break;
                }
            }
        }
    }
    log::info!("[INPUT] SOS poll loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::timeout;

    fn channels() -> (
        mpsc::Sender<InputEvent>,
        mpsc::Receiver<InputEvent>,
        watch::Sender<bool>,
        watch::Receiver<bool>,
    ) {
        let (tx, rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);
        (tx, rx, stop_tx, stop_rx)
    }

    #[tokio::test]
    async fn passenger_edges_emit_once() {
        let backend = Arc::new(MockInputs::new());
        let (tx, mut rx, _stop_tx, stop_rx) = channels();
        tokio::spawn(passenger_loop(backend.clone(), tx, stop_rx, 10));

        backend.assert_line(InputLine::Passenger(1));
        let ev = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open");
        match ev {
            InputEvent::Passenger { slot, onboard } => {
                assert_eq!(slot, 1);
                assert!(onboard);
            }
            other => panic!("unexpected event {:?}", other),
        }

        // Steady state: no further events while the switch stays closed.
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());

        backend.release_line(InputLine::Passenger(1));
        let ev = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open");
        assert!(matches!(ev, InputEvent::Passenger { slot: 1, onboard: false }));
    }

    #[tokio::test]
    async fn selector_snapshot_emitted_on_change() {
        let backend = Arc::new(MockInputs::new());
        let (tx, mut rx, _stop_tx, stop_rx) = channels();
        tokio::spawn(selector_loop(backend.clone(), tx, stop_rx, 10));

        // Initial snapshot: everything idle.
        let ev = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open");
        match ev {
            InputEvent::SelectorChanged(state) => assert_eq!(state, SelectorState::default()),
            other => panic!("unexpected event {:?}", other),
        }

        backend.assert_line(InputLine::ModeSharing);
        let ev = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open");
        match ev {
            InputEvent::SelectorChanged(state) => assert!(state.sharing),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn sos_press_and_release_carry_hold_duration() {
        let backend = Arc::new(MockInputs::new());
        let (tx, mut rx, _stop_tx, stop_rx) = channels();
        tokio::spawn(sos_loop(backend.clone(), tx, stop_rx, 10, 10));

        backend.assert_line(InputLine::SosButton);
        let ev = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open");
        assert!(matches!(ev, InputEvent::SosPressed));

        sleep(Duration::from_millis(120)).await;
        backend.release_line(InputLine::SosButton);
        let ev = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open");
        match ev {
            InputEvent::SosReleased { held } => assert!(held >= Duration::from_millis(100)),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn unreadable_sysfs_line_reads_idle() {
        let backend = SysfsGpio::with_base("/nonexistent/gpio");
        assert_eq!(backend.read_line(InputLine::SosButton), LineLevel::High);
        assert!(!backend.read_line(InputLine::Passenger(0)).asserted());
    }
}

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{sleep, Duration};

use crate::config::AlarmTimings;
use crate::geo::Location;

/// Emergency alert state. Countdown is transient and cancellable;
/// Active persists until an explicit deactivation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SosState {
    Normal,
    Countdown(u8),
    Active,
}

/// Emitted once at the moment of activation. A missing location is not
/// an error; the field is simply absent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SosRecord {
    pub activated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PressAction {
    /// Begin a hold-to-arm countdown; the generation tags the task so a
    /// stale one can never touch a newer countdown.
    StartCountdown { generation: u64, seconds: u8 },
    Ignored,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseAction {
    Cancelled,
    Deactivated,
    Ignored,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CountdownStep {
    /// Seconds remaining after the decrement.
    Continue(u8),
    Activated(SosRecord),
    /// The countdown this task belonged to no longer exists.
    Stale,
}

/// Hold-to-arm emergency state machine. Pure transitions only; the
/// orchestrator owns the timing tasks that drive `countdown_tick`.
pub struct SosMachine {
    state: SosState,
    generation: u64,
    countdown_secs: u8,
}

impl SosMachine {
    pub fn new(countdown_secs: u8) -> Self {
        SosMachine {
            state: SosState::Normal,
            generation: 0,
            countdown_secs,
        }
    }

    pub fn state(&self) -> SosState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn in_countdown(&self) -> bool {
        matches!(self.state, SosState::Countdown(_))
    }

    pub fn is_active(&self) -> bool {
        self.state == SosState::Active
    }

    /// Button pressed. Only arms from Normal; a press during a running
    /// countdown or while active changes nothing.
    pub fn press(&mut self) -> PressAction {
        match self.state {
            SosState::Normal => {
                self.generation += 1;
                self.state = SosState::Countdown(self.countdown_secs);
                log::warn!("[SOS] button pressed, countdown started");
                PressAction::StartCountdown {
                    generation: self.generation,
                    seconds: self.countdown_secs,
                }
            }
            _ => PressAction::Ignored,
        }
    }

    /// Button released. Cancels a running countdown or deactivates an
    /// active alarm; anything else is a no-op.
    pub fn release(&mut self) -> ReleaseAction {
        match self.state {
            SosState::Countdown(_) => {
                self.generation += 1;
                self.state = SosState::Normal;
                log::info!("[SOS] countdown cancelled, button released early");
                ReleaseAction::Cancelled
            }
            SosState::Active => {
                self.state = SosState::Normal;
                log::warn!("[SOS] deactivated");
                ReleaseAction::Deactivated
            }
            SosState::Normal => ReleaseAction::Ignored,
        }
    }

    /// External manual override; idempotent from Normal.
    pub fn deactivate(&mut self) -> ReleaseAction {
        self.release()
    }

    /// One-second decrement driven by the countdown task. A mismatched
    /// generation means the countdown was cancelled or replaced and the
    /// step must not mutate anything.
    pub fn countdown_tick(
        &mut self,
        generation: u64,
        location: Option<Location>,
        now: DateTime<Utc>,
    ) -> CountdownStep {
        if generation != self.generation {
            return CountdownStep::Stale;
        }
        match self.state {
            SosState::Countdown(1) => {
                self.state = SosState::Active;
                log::warn!("[SOS] ACTIVATED at {:?}", location);
                CountdownStep::Activated(SosRecord {
                    activated_at: now,
                    location,
                })
            }
            SosState::Countdown(n) => {
                self.state = SosState::Countdown(n - 1);
                CountdownStep::Continue(n - 1)
            }
            _ => CountdownStep::Stale,
        }
    }
}

/// Output device the alarm pattern drives (buzzer and lamp on the
/// vehicle roof).
pub trait AlarmSink: Send + Sync {
    fn set(&self, on: bool);
}

/// Default sink when no hardware is bound: logs edge transitions.
pub struct LogAlarm;

impl AlarmSink for LogAlarm {
    fn set(&self, on: bool) {
        log::debug!("[SOS] alarm output {}", if on { "ON" } else { "OFF" });
    }
}

/// Expand the distress pattern into (level, duration_ms) steps:
/// 3 short pulses, pause, 3 long pulses, pause, 3 short pulses, then a
/// longer pause before the cycle repeats.
pub fn alarm_schedule(timings: &AlarmTimings) -> Vec<(bool, u64)> {
    let mut steps = Vec::new();
    let mut burst = |on_ms: u64, steps: &mut Vec<(bool, u64)>| {
        for _ in 0..3 {
            steps.push((true, on_ms));
            steps.push((false, timings.off_ms));
        }
    };
    burst(timings.short_ms, &mut steps);
    steps.push((false, timings.gap_ms));
    burst(timings.long_ms, &mut steps);
    steps.push((false, timings.gap_ms));
    burst(timings.short_ms, &mut steps);
    steps.push((false, timings.cycle_pause_ms));
    steps
}

/// Repeats the distress pattern until the watch flag drops. Runs on its
/// own timing track, independent of the state machine; cancellation is
/// checked at 100 ms granularity so deactivation silences the output
/// promptly.
pub async fn alarm_loop(
    sink: Arc<dyn AlarmSink>,
    mut active: watch::Receiver<bool>,
    timings: AlarmTimings,
) {
    let schedule = alarm_schedule(&timings);
    'pattern: loop {
        for (on, duration_ms) in &schedule {
            if !*active.borrow() {
                break 'pattern;
            }
            sink.set(*on);
            let mut remaining = *duration_ms;
            while remaining > 0 {
                let slice = remaining.min(100);
                sleep(Duration::from_millis(slice)).await;
                remaining -= slice;
                if !*active.borrow() {
                    break 'pattern;
                }
            }
        }
    }
    sink.set(false);
    log::info!("[SOS] alarm pattern stopped");
}

use serde::Serialize;

use crate::fare::RideRecord;
use crate::mode::OperatingMode;
use crate::sos::SosRecord;

/// Which fare stream an amount belongs to: one of the three sharing
/// slots, or the single private trip.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FareSlot {
    Sharing(usize),
    Private,
}

/// Notifications pushed to external collaborators (display, ride sync).
/// Payload shapes are fixed; consumers must never feed anything back
/// into the core through this surface.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum MeterEvent {
    LocationUpdated { latitude: f64, longitude: f64 },
    SpeedUpdated { kmh: f64 },
    DistanceUpdated { km: f64 },
    FareUpdated { slot: FareSlot, amount: f64 },
    RideCompleted { slot: FareSlot, record: RideRecord },
    ModeChanged { mode: OperatingMode },
    PassengerChanged { slot: usize, onboard: bool },
    SosStatus { message: String },
    SosActivated { record: SosRecord },
    SosDeactivated,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_tag_with_kebab_case_names() {
        let ev = MeterEvent::FareUpdated {
            slot: FareSlot::Sharing(0),
            amount: 1.5,
        };
        let json = serde_json::to_value(&ev).expect("serialize");
        assert_eq!(json["event"], "fare-updated");

        let ev = MeterEvent::SosDeactivated;
        let json = serde_json::to_value(&ev).expect("serialize");
        assert_eq!(json["event"], "sos-deactivated");
    }
}

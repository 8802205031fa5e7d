use std::fmt;

use serde::{Deserialize, Serialize};

/// Vehicle operating mode, driven by the rotary selector.
/// Exactly one is active at any time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatingMode {
    ForHire,
    Private,
    Sharing,
    Waiting,
}

impl OperatingMode {
    pub fn name(self) -> &'static str {
        match self {
            OperatingMode::ForHire => "For Hire",
            OperatingMode::Private => "Private",
            OperatingMode::Sharing => "Sharing",
            OperatingMode::Waiting => "Waiting",
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Raw selector-line snapshot from the sampler. `true` means the line
/// reads asserted (grounded by the rotary switch).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SelectorState {
    pub private: bool,
    pub sharing: bool,
    pub waiting: bool,
    pub for_hire: bool,
}

impl SelectorState {
    /// Resolve to exactly one mode. Correct wiring asserts at most one
    /// line; conflicting reads resolve by fixed priority
    /// Private > Sharing > Waiting > ForHire, and no line asserted
    /// falls back to ForHire.
    pub fn resolve(self) -> OperatingMode {
        if self.private {
            OperatingMode::Private
        } else if self.sharing {
            OperatingMode::Sharing
        } else if self.waiting {
            OperatingMode::Waiting
        } else {
            OperatingMode::ForHire
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModeChange {
    pub from: OperatingMode,
    pub to: OperatingMode,
}

/// Pure reducer from selector snapshots to the single active mode.
pub struct ModeCoordinator {
    current: OperatingMode,
}

impl ModeCoordinator {
    pub fn new() -> Self {
        ModeCoordinator {
            current: OperatingMode::ForHire,
        }
    }

    pub fn current(&self) -> OperatingMode {
        self.current
    }

    /// Apply a selector snapshot; returns the transition when the
    /// resolved mode differs from the current one.
    pub fn apply(&mut self, selector: SelectorState) -> Option<ModeChange> {
        let next = selector.resolve();
        if next == self.current {
            return None;
        }
        let change = ModeChange {
            from: self.current,
            to: next,
        };
        self.current = next;
        log::info!("[MODE] {} -> {}", change.from, change.to);
        Some(change)
    }
}

impl Default for ModeCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_line_asserted_defaults_to_for_hire() {
        assert_eq!(SelectorState::default().resolve(), OperatingMode::ForHire);
    }

    #[test]
    fn single_line_resolves_deterministically() {
        let cases = [
            (
                SelectorState {
                    private: true,
                    ..Default::default()
                },
                OperatingMode::Private,
            ),
            (
                SelectorState {
                    sharing: true,
                    ..Default::default()
                },
                OperatingMode::Sharing,
            ),
            (
                SelectorState {
                    waiting: true,
                    ..Default::default()
                },
                OperatingMode::Waiting,
            ),
            (
                SelectorState {
                    for_hire: true,
                    ..Default::default()
                },
                OperatingMode::ForHire,
            ),
        ];
        for (state, expected) in cases {
            assert_eq!(state.resolve(), expected);
        }
    }

    #[test]
    fn conflicting_lines_use_fixed_priority() {
        let all = SelectorState {
            private: true,
            sharing: true,
            waiting: true,
            for_hire: true,
        };
        assert_eq!(all.resolve(), OperatingMode::Private);

        let no_private = SelectorState {
            sharing: true,
            waiting: true,
            for_hire: true,
            ..Default::default()
        };
        assert_eq!(no_private.resolve(), OperatingMode::Sharing);
    }

    #[test]
    fn coordinator_reports_transitions_once() {
        let mut coord = ModeCoordinator::new();
        assert_eq!(coord.current(), OperatingMode::ForHire);

        let sharing = SelectorState {
            sharing: true,
            ..Default::default()
        };
        let change = coord.apply(sharing).expect("transition");
        assert_eq!(change.from, OperatingMode::ForHire);
        assert_eq!(change.to, OperatingMode::Sharing);

        // Same snapshot again: no transition.
        assert!(coord.apply(sharing).is_none());
        assert_eq!(coord.current(), OperatingMode::Sharing);
    }
}

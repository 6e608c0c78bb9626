//! Panic-shake gesture recognizer.
//! Counts distinct high-magnitude pulses; three inside the reset window fire.

use std::time::Instant;

use tracing::debug;

use crate::config::ShakeConfig;
use crate::sensor::Sample;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShakeEvent {
    /// Magnitude of the pulse that completed the gesture.
    pub magnitude: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShakeState {
    pub last_pulse_at: Option<Instant>,
    pub pulse_count: u8,
}

pub struct ShakeDetector {
    config: ShakeConfig,
    state: ShakeState,
}

impl ShakeDetector {
    pub fn new(config: ShakeConfig) -> Self {
        Self {
            config,
            state: ShakeState::default(),
        }
    }

    pub fn state(&self) -> ShakeState {
        self.state
    }

    pub fn reset(&mut self) {
        self.state = ShakeState::default();
    }

    pub fn observe(&mut self, sample: &Sample) -> Option<ShakeEvent> {
        let now = sample.timestamp;

        // Lazy reset: a partial gesture expires after a quiet window
        if let Some(last) = self.state.last_pulse_at {
            if self.state.pulse_count > 0
                && now.saturating_duration_since(last) > self.config.reset_after
            {
                debug!(pulses = self.state.pulse_count, "shake gesture expired");
                self.state.pulse_count = 0;
            }
        }

        if sample.magnitude <= self.config.threshold {
            return None;
        }

        // Still inside the previous pulse
        if let Some(last) = self.state.last_pulse_at {
            if now.saturating_duration_since(last) < self.config.debounce {
                return None;
            }
        }

        self.state.last_pulse_at = Some(now);
        self.state.pulse_count += 1;
        debug!(
            pulses = self.state.pulse_count,
            magnitude = sample.magnitude,
            "shake pulse"
        );

        if self.state.pulse_count >= self.config.pulses {
            self.state.pulse_count = 0;
            return Some(ShakeEvent {
                magnitude: sample.magnitude,
            });
        }

        None
    }
}

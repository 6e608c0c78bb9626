//! Detection thresholds.
//!
//! Magnitudes are in m/s² (gravity included, ~9.8 at rest). The values are
//! empirical and uncalibrated; every one of them can be overridden from the
//! command line.

use std::time::Duration;

pub const SHAKE_THRESHOLD: f64 = 15.0;
pub const SHAKE_DEBOUNCE_MS: u64 = 500;
pub const SHAKE_RESET_MS: u64 = 3000;
pub const SHAKE_PULSES: u8 = 3;

pub const FREEFALL_THRESHOLD: f64 = 0.5;
pub const FREEFALL_TIME_MS: u64 = 300;
pub const IMPACT_THRESHOLD: f64 = 25.0;
pub const INACTIVITY_TIME_MS: u64 = 3000;
pub const INACTIVITY_THRESHOLD: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShakeConfig {
    /// Magnitude a sample must exceed to count as a pulse.
    pub threshold: f64,
    /// Pulses closer together than this are the same pulse.
    pub debounce: Duration,
    /// Quiet time after which a partial gesture is forgotten.
    pub reset_after: Duration,
    /// Pulses that make up the gesture.
    pub pulses: u8,
}

impl Default for ShakeConfig {
    fn default() -> Self {
        Self {
            threshold: SHAKE_THRESHOLD,
            debounce: Duration::from_millis(SHAKE_DEBOUNCE_MS),
            reset_after: Duration::from_millis(SHAKE_RESET_MS),
            pulses: SHAKE_PULSES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FallConfig {
    pub freefall_threshold: f64,
    /// Weightlessness must last longer than this before an impact counts.
    pub freefall_time: Duration,
    pub impact_threshold: f64,
    /// Settling period after the impact.
    pub inactivity_time: Duration,
    pub inactivity_threshold: f64,
}

impl Default for FallConfig {
    fn default() -> Self {
        Self {
            freefall_threshold: FREEFALL_THRESHOLD,
            freefall_time: Duration::from_millis(FREEFALL_TIME_MS),
            impact_threshold: IMPACT_THRESHOLD,
            inactivity_time: Duration::from_millis(INACTIVITY_TIME_MS),
            inactivity_threshold: INACTIVITY_THRESHOLD,
        }
    }
}

//! Three-stage fall detector.
//!
//! A fall is sustained weightlessness, then a hard impact, then the body
//! settling. Each stage is timed against sample timestamps; nothing here
//! runs on a timer of its own.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::FallConfig;
use crate::sensor::Sample;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallPhase {
    Idle,
    Freefall { since: Instant },
    Impact { since: Instant },
}

impl FallPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallPhase::Idle => "idle",
            FallPhase::Freefall { .. } => "freefall",
            FallPhase::Impact { .. } => "impact",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FallEvent {
    /// Time from impact to the settling verdict.
    pub settled_after: Duration,
}

pub struct FallDetector {
    config: FallConfig,
    phase: FallPhase,
}

impl FallDetector {
    pub fn new(config: FallConfig) -> Self {
        Self {
            config,
            phase: FallPhase::Idle,
        }
    }

    pub fn phase(&self) -> FallPhase {
        self.phase
    }

    pub fn reset(&mut self) {
        self.phase = FallPhase::Idle;
    }

    pub fn observe(&mut self, sample: &Sample) -> Option<FallEvent> {
        let now = sample.timestamp;
        let mag = sample.magnitude;

        let (next, event) = match self.phase {
            FallPhase::Idle => {
                if mag < self.config.freefall_threshold {
                    (FallPhase::Freefall { since: now }, None)
                } else {
                    (FallPhase::Idle, None)
                }
            }
            FallPhase::Freefall { since } => {
                // No verdict until the weightless window has fully elapsed
                if now.saturating_duration_since(since) <= self.config.freefall_time {
                    (self.phase, None)
                } else if mag > self.config.impact_threshold {
                    (FallPhase::Impact { since: now }, None)
                } else if mag >= self.config.freefall_threshold {
                    (FallPhase::Idle, None)
                } else {
                    (self.phase, None)
                }
            }
            FallPhase::Impact { since } => {
                let elapsed = now.saturating_duration_since(since);
                if elapsed <= self.config.inactivity_time {
                    (self.phase, None)
                } else if mag < self.config.inactivity_threshold {
                    let event = FallEvent {
                        settled_after: elapsed,
                    };
                    (FallPhase::Idle, Some(event))
                } else {
                    info!(magnitude = mag, "impact without settling, ignoring");
                    (FallPhase::Idle, None)
                }
            }
        };

        if next != self.phase {
            debug!(
                from = self.phase.as_str(),
                to = next.as_str(),
                magnitude = mag,
                "fall phase"
            );
            self.phase = next;
        }

        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const STEP_MS: u64 = 50;

    struct Feed {
        origin: Instant,
        t: u64,
        events: usize,
    }

    impl Feed {
        fn new() -> Self {
            Self {
                origin: Instant::now(),
                t: 0,
                events: 0,
            }
        }

        fn sample(&self, magnitude: f64) -> Sample {
            Sample {
                magnitude,
                timestamp: self.origin + Duration::from_millis(self.t),
            }
        }

        /// Holds `magnitude` for `ms`, one sample every STEP_MS, starting now.
        fn hold(&mut self, det: &mut FallDetector, magnitude: f64, ms: u64) {
            let end = self.t + ms;
            while self.t <= end {
                self.once(det, magnitude);
            }
        }

        fn once(&mut self, det: &mut FallDetector, magnitude: f64) {
            if det.observe(&self.sample(magnitude)).is_some() {
                self.events += 1;
                assert_eq!(det.phase(), FallPhase::Idle);
            }
            self.t += STEP_MS;
        }
    }

    fn fall_pattern(feed: &mut Feed, det: &mut FallDetector) {
        feed.hold(det, 0.2, 350);
        feed.once(det, 30.0);
        feed.hold(det, 0.1, 3100);
    }

    #[test]
    fn freefall_impact_settle_emits_once() {
        let mut det = FallDetector::new(FallConfig::default());
        let mut feed = Feed::new();
        fall_pattern(&mut feed, &mut det);
        assert_eq!(feed.events, 1);
    }

    #[test]
    fn repeated_falls_emit_once_each() {
        let mut det = FallDetector::new(FallConfig::default());
        let mut feed = Feed::new();
        for round in 1..=3 {
            feed.hold(&mut det, 9.8, 1000);
            assert_eq!(det.phase(), FallPhase::Idle);
            fall_pattern(&mut feed, &mut det);
            assert_eq!(feed.events, round);
        }
        feed.hold(&mut det, 9.8, 500);
        assert_eq!(det.phase(), FallPhase::Idle);
    }

    #[test]
    fn short_freefall_is_noise() {
        let mut det = FallDetector::new(FallConfig::default());
        let mut feed = Feed::new();
        feed.hold(&mut det, 0.2, 150);
        // Impact arrives before the window elapsed: still freefall
        feed.once(&mut det, 30.0);
        assert!(matches!(det.phase(), FallPhase::Freefall { .. }));
        feed.hold(&mut det, 9.8, 400);
        assert_eq!(det.phase(), FallPhase::Idle);
        assert_eq!(feed.events, 0);
    }

    #[test]
    fn freefall_without_impact_returns_to_idle() {
        let mut det = FallDetector::new(FallConfig::default());
        let mut feed = Feed::new();
        feed.hold(&mut det, 0.2, 400);
        feed.once(&mut det, 12.0);
        assert_eq!(det.phase(), FallPhase::Idle);
    }

    #[test]
    fn movement_after_impact_is_a_false_positive() {
        let mut det = FallDetector::new(FallConfig::default());
        let mut feed = Feed::new();
        feed.hold(&mut det, 0.2, 350);
        feed.once(&mut det, 30.0);
        assert!(matches!(det.phase(), FallPhase::Impact { .. }));
        feed.hold(&mut det, 9.8, 3100);
        assert_eq!(feed.events, 0);
        assert_eq!(det.phase(), FallPhase::Idle);
    }

    #[test]
    fn impact_phase_waits_out_inactivity_window() {
        let mut det = FallDetector::new(FallConfig::default());
        let mut feed = Feed::new();
        feed.hold(&mut det, 0.2, 350);
        feed.once(&mut det, 30.0);
        feed.hold(&mut det, 12.0, 2500);
        assert!(matches!(det.phase(), FallPhase::Impact { .. }));
    }

    #[test]
    fn reset_returns_to_idle() {
        let mut det = FallDetector::new(FallConfig::default());
        let mut feed = Feed::new();
        feed.hold(&mut det, 0.2, 100);
        assert!(matches!(det.phase(), FallPhase::Freefall { .. }));
        det.reset();
        assert_eq!(det.phase(), FallPhase::Idle);
    }

    proptest! {
        #[test]
        fn never_leaves_idle_above_freefall_threshold(
            steps in prop::collection::vec((0.5f64..80.0, 1u64..500), 1..200)
        ) {
            let mut det = FallDetector::new(FallConfig::default());
            let origin = Instant::now();
            let mut t = 0;
            for (magnitude, dt) in steps {
                t += dt;
                let sample = Sample { magnitude, timestamp: origin + Duration::from_millis(t) };
                prop_assert!(det.observe(&sample).is_none());
                prop_assert_eq!(det.phase(), FallPhase::Idle);
            }
        }
    }
}

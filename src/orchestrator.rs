//! Emergency orchestrator: the single armed/disarmed flag and the alert sequence.
//!
//! Triggers can arrive from the sample thread (detections) and from the user
//! surface (manual alert, voice command) at the same time. The episode slot is
//! checked and set under one lock; the first trigger wins and later ones are
//! absorbed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::effects::Effectors;
use crate::error::EffectorError;

pub const CANCEL_ANNOUNCEMENT: &str = "Emergency alert cancelled.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmergencyEpisode {
    pub reason: String,
    pub started_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A new episode began. Effector failures are reported, not fatal.
    Armed { failures: Vec<EffectorError> },
    /// An episode was already live; nothing happened.
    Absorbed { active_reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    Disarmed {
        episode: EmergencyEpisode,
        failures: Vec<EffectorError>,
    },
    NotArmed,
}

pub fn announcement_for(reason: &str) -> String {
    format!("{reason}. Emergency alert initiated. Calling for help.")
}

pub struct EmergencyOrchestrator {
    effectors: Arc<dyn Effectors>,
    episode: Mutex<Option<EmergencyEpisode>>,
    /// Bumped on every cancel; lets late results detect they are stale.
    epoch: AtomicU64,
}

impl EmergencyOrchestrator {
    pub fn new(effectors: Arc<dyn Effectors>) -> Self {
        Self {
            effectors,
            episode: Mutex::new(None),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn effectors(&self) -> &Arc<dyn Effectors> {
        &self.effectors
    }

    fn slot(&self) -> MutexGuard<'_, Option<EmergencyEpisode>> {
        self.episode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_armed(&self) -> bool {
        self.slot().is_some()
    }

    pub fn episode(&self) -> Option<EmergencyEpisode> {
        self.slot().clone()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn trigger(&self, reason: impl Into<String>) -> TriggerOutcome {
        let reason = reason.into();
        // Held across the effector calls so a concurrent cancel cannot slip in
        // between arming and starting the siren.
        let mut slot = self.slot();
        if let Some(active) = slot.as_ref() {
            debug!(%reason, active = %active.reason, "trigger absorbed, episode already live");
            return TriggerOutcome::Absorbed {
                active_reason: active.reason.clone(),
            };
        }

        *slot = Some(EmergencyEpisode {
            reason: reason.clone(),
            started_at: Instant::now(),
        });
        info!(%reason, "emergency armed");

        let fx = &self.effectors;
        let failures: Vec<EffectorError> = [
            fx.announce(&announcement_for(&reason)),
            fx.start_siren(),
            fx.start_haptics(),
            fx.notify(&reason),
        ]
        .into_iter()
        .filter_map(Result::err)
        .collect();

        for failure in &failures {
            warn!("alert effector: {failure}");
        }
        TriggerOutcome::Armed { failures }
    }

    /// Disarm the live episode. Invalid (and silent) when nothing is armed.
    pub fn cancel(&self) -> CancelOutcome {
        let mut slot = self.slot();
        let Some(episode) = slot.take() else {
            debug!("cancel ignored, not armed");
            return CancelOutcome::NotArmed;
        };
        self.epoch.fetch_add(1, Ordering::SeqCst);

        let fx = &self.effectors;
        let failures: Vec<EffectorError> = [
            fx.stop_siren(),
            fx.stop_haptics(),
            fx.announce(CANCEL_ANNOUNCEMENT),
        ]
        .into_iter()
        .filter_map(Result::err)
        .collect();

        for failure in &failures {
            warn!("alert effector: {failure}");
        }
        info!(
            reason = %episode.reason,
            armed_for_ms = episode.started_at.elapsed().as_millis() as u64,
            "emergency cancelled"
        );
        CancelOutcome::Disarmed { episode, failures }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::tests::{Call, RecordingEffectors};
    use std::thread;

    fn orchestrator() -> (Arc<RecordingEffectors>, EmergencyOrchestrator) {
        let fx = Arc::new(RecordingEffectors::default());
        let orch = EmergencyOrchestrator::new(fx.clone());
        (fx, orch)
    }

    #[test]
    fn trigger_runs_effectors_in_order() {
        let (fx, orch) = orchestrator();
        assert_eq!(
            orch.trigger("Fall detected"),
            TriggerOutcome::Armed { failures: vec![] }
        );
        assert_eq!(
            fx.calls(),
            vec![
                Call::Announce(announcement_for("Fall detected")),
                Call::StartSiren,
                Call::StartHaptics,
                Call::Notify("Fall detected".into()),
            ]
        );
        assert_eq!(orch.episode().unwrap().reason, "Fall detected");
    }

    #[test]
    fn second_trigger_is_absorbed() {
        let (fx, orch) = orchestrator();
        orch.trigger("Panic shake detected");
        let second = orch.trigger("Manual emergency alert");
        assert_eq!(
            second,
            TriggerOutcome::Absorbed {
                active_reason: "Panic shake detected".into()
            }
        );
        assert_eq!(fx.calls().len(), 4);
        assert_eq!(orch.episode().unwrap().reason, "Panic shake detected");
    }

    #[test]
    fn concurrent_triggers_arm_once() {
        let (fx, orch) = orchestrator();
        let orch = Arc::new(orch);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let orch = orch.clone();
                thread::spawn(move || orch.trigger(format!("source {i}")))
            })
            .collect();
        let armed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| matches!(o, TriggerOutcome::Armed { .. }))
            .count();
        assert_eq!(armed, 1);
        let notifies = fx
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Notify(_)))
            .count();
        assert_eq!(notifies, 1);
    }

    #[test]
    fn failing_effector_does_not_stop_the_rest() {
        let fx = Arc::new(RecordingEffectors {
            fail_notify: Some(EffectorError::GeolocationDenied),
            ..Default::default()
        });
        let orch = EmergencyOrchestrator::new(fx.clone());
        let outcome = orch.trigger("Fall detected");
        assert_eq!(
            outcome,
            TriggerOutcome::Armed {
                failures: vec![EffectorError::GeolocationDenied]
            }
        );
        assert!(orch.is_armed());
        assert_eq!(fx.calls().len(), 4);
    }

    #[test]
    fn cancel_when_disarmed_touches_nothing() {
        let (fx, orch) = orchestrator();
        assert_eq!(orch.cancel(), CancelOutcome::NotArmed);
        assert!(fx.calls().is_empty());
        assert_eq!(orch.epoch(), 0);
    }

    #[test]
    fn cancel_stops_alerts_and_allows_new_episode() {
        let (fx, orch) = orchestrator();
        orch.trigger("Fall detected");
        let outcome = orch.cancel();
        assert!(matches!(outcome, CancelOutcome::Disarmed { ref episode, .. } if episode.reason == "Fall detected"));
        assert!(!orch.is_armed());
        assert_eq!(orch.epoch(), 1);
        assert_eq!(
            fx.calls()[4..],
            [
                Call::StopSiren,
                Call::StopHaptics,
                Call::Announce(CANCEL_ANNOUNCEMENT.into())
            ]
        );

        assert!(matches!(
            orch.trigger("Manual emergency alert"),
            TriggerOutcome::Armed { .. }
        ));
    }
}

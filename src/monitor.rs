//! Monitor state: the sampler, both detectors and the command ticket, with the
//! shared orchestrator. All mutation goes through `&mut Guardian`; only the
//! orchestrator is shared with other threads.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::classifier::CommandResult;
use crate::config::{FallConfig, ShakeConfig};
use crate::error::{ClassifyError, SensorError};
use crate::fall::{FallDetector, FallEvent, FallPhase};
use crate::orchestrator::{CancelOutcome, EmergencyOrchestrator, TriggerOutcome};
use crate::sensor::{MotionSource, Sample, SignalSampler};
use crate::shake::{ShakeDetector, ShakeEvent};

pub const FALL_REASON: &str = "Fall detected";
pub const SHAKE_REASON: &str = "Panic shake detected";
pub const MANUAL_REASON: &str = "Manual emergency alert";

#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    Fall(FallEvent),
    Shake(ShakeEvent),
}

impl Detection {
    pub fn reason(&self) -> &'static str {
        match self {
            Detection::Fall(_) => FALL_REASON,
            Detection::Shake(_) => SHAKE_REASON,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Detection::Fall(_) => "fall",
            Detection::Shake(_) => "shake",
        }
    }
}

/// Issued when a command is handed to the classifier; redeemed with its result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTicket {
    pub text: String,
    epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Triggered { text: String, trigger: TriggerOutcome },
    Unclear { guidance: String },
    Rejected(ClassifyError),
    /// The user cancelled an emergency while this command was being classified.
    Stale { text: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Busy;

pub struct Guardian {
    sampler: SignalSampler,
    shake: ShakeDetector,
    fall: FallDetector,
    orchestrator: Arc<EmergencyOrchestrator>,
    command_in_flight: bool,
    run: u64,
}

impl Guardian {
    pub fn new(orchestrator: Arc<EmergencyOrchestrator>, shake: ShakeConfig, fall: FallConfig) -> Self {
        Self {
            sampler: SignalSampler::new(),
            shake: ShakeDetector::new(shake),
            fall: FallDetector::new(fall),
            orchestrator,
            command_in_flight: false,
            run: 0,
        }
    }

    pub fn orchestrator(&self) -> &Arc<EmergencyOrchestrator> {
        &self.orchestrator
    }

    pub fn is_monitoring(&self) -> bool {
        self.sampler.is_active()
    }

    pub fn fall_phase(&self) -> FallPhase {
        self.fall.phase()
    }

    pub fn shake_pulses(&self) -> u8 {
        self.shake.state().pulse_count
    }

    pub fn command_in_flight(&self) -> bool {
        self.command_in_flight
    }

    /// Id of the current monitoring run. Samples carry the id of the run that produced them.
    pub fn run(&self) -> u64 {
        self.run
    }

    /// Start sampling. `observer` receives each sample with the id of this run.
    pub fn start_monitoring<S, F>(&mut self, source: S, mut observer: F) -> Result<(), SensorError>
    where
        S: MotionSource,
        F: FnMut(u64, Sample) + Send + 'static,
    {
        if self.is_monitoring() {
            return Ok(());
        }
        self.reset_detectors();
        let run = self.run + 1;
        self.sampler
            .start(source, move |sample| observer(run, sample))?;
        self.run = run;
        info!(run, "monitoring started");
        if let Err(e) = self.orchestrator.effectors().announce("Monitoring started.") {
            warn!("alert effector: {e}");
        }
        Ok(())
    }

    /// Full stop: no more samples, both detectors back to idle.
    pub fn stop_monitoring(&mut self) {
        if self.halt_monitoring() {
            if let Err(e) = self.orchestrator.effectors().announce("Monitoring stopped.") {
                warn!("alert effector: {e}");
            }
        }
    }

    fn halt_monitoring(&mut self) -> bool {
        if !self.is_monitoring() {
            return false;
        }
        self.sampler.stop();
        self.reset_detectors();
        info!(run = self.run, "monitoring stopped");
        true
    }

    fn reset_detectors(&mut self) {
        self.shake.reset();
        self.fall.reset();
    }

    /// Run both detectors over one sample. Samples queued before a stop, or left
    /// over from an earlier run, are dropped.
    pub fn observe(&mut self, run: u64, sample: Sample) -> Vec<(Detection, TriggerOutcome)> {
        if !self.is_monitoring() {
            return Vec::new();
        }
        if run != self.run {
            debug!(run, current = self.run, "dropping sample from a previous run");
            return Vec::new();
        }

        let mut detections = Vec::new();
        if let Some(event) = self.shake.observe(&sample) {
            detections.push(Detection::Shake(event));
        }
        if let Some(event) = self.fall.observe(&sample) {
            detections.push(Detection::Fall(event));
        }

        detections
            .into_iter()
            .map(|detection| {
                match &detection {
                    Detection::Fall(e) => info!(
                        settled_after_ms = e.settled_after.as_millis() as u64,
                        "fall detected"
                    ),
                    Detection::Shake(e) => info!(magnitude = e.magnitude, "panic shake detected"),
                }
                let outcome = self.orchestrator.trigger(detection.reason());
                (detection, outcome)
            })
            .collect()
    }

    pub fn manual_alert(&self) -> TriggerOutcome {
        self.orchestrator.trigger(MANUAL_REASON)
    }

    /// Disarm and halt motion monitoring. A no-op when not armed.
    ///
    /// Monitoring is halted without its own announcement; a new utterance would
    /// cut off the cancellation.
    pub fn cancel(&mut self) -> CancelOutcome {
        let outcome = self.orchestrator.cancel();
        if matches!(outcome, CancelOutcome::Disarmed { .. }) {
            self.halt_monitoring();
        }
        outcome
    }

    /// Reserve the command surface for one classification.
    pub fn begin_command(&mut self, text: &str) -> Result<CommandTicket, Busy> {
        if self.command_in_flight {
            debug!("command rejected, classification outstanding");
            return Err(Busy);
        }
        self.command_in_flight = true;
        Ok(CommandTicket {
            text: text.to_string(),
            epoch: self.orchestrator.epoch(),
        })
    }

    pub fn finish_command(
        &mut self,
        ticket: CommandTicket,
        result: Result<CommandResult, ClassifyError>,
    ) -> CommandOutcome {
        self.command_in_flight = false;

        let result = match result {
            Ok(result) => result,
            Err(e) => {
                warn!(text = %ticket.text, "command not classified: {e}");
                return CommandOutcome::Rejected(e);
            }
        };

        if !result.is_clear {
            info!(guidance = %result.normalized_text, "command unclear");
            return CommandOutcome::Unclear {
                guidance: result.normalized_text,
            };
        }

        if ticket.epoch != self.orchestrator.epoch() {
            info!(text = %result.normalized_text, "discarding command result, emergency was cancelled meanwhile");
            return CommandOutcome::Stale {
                text: result.normalized_text,
            };
        }

        let trigger = self.orchestrator.trigger(result.normalized_text.clone());
        CommandOutcome::Triggered {
            text: result.normalized_text,
            trigger,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::tests::StubClassifier;
    use crate::classifier::CommandFilter;
    use crate::effects::tests::{Call, RecordingEffectors};
    use crate::orchestrator::CANCEL_ANNOUNCEMENT;
    use crate::sensor::tests::{reading, VecSource};
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn guardian() -> (Arc<RecordingEffectors>, Guardian) {
        let fx = Arc::new(RecordingEffectors::default());
        let orch = Arc::new(EmergencyOrchestrator::new(fx.clone()));
        let g = Guardian::new(orch, ShakeConfig::default(), FallConfig::default());
        (fx, g)
    }

    fn monitoring() -> (Arc<RecordingEffectors>, Guardian) {
        let (fx, mut g) = guardian();
        g.start_monitoring(VecSource::new(Vec::new()), |_, _| {}).unwrap();
        (fx, g)
    }

    fn sample(origin: Instant, ms: u64, magnitude: f64) -> Sample {
        Sample {
            magnitude,
            timestamp: origin + Duration::from_millis(ms),
        }
    }

    fn shake(g: &mut Guardian, origin: Instant) -> Vec<(Detection, TriggerOutcome)> {
        [0, 600, 1200]
            .into_iter()
            .flat_map(|ms| g.observe(g.run(), sample(origin, ms, 20.0)))
            .collect()
    }

    #[test]
    fn samples_ignored_while_stopped() {
        let (fx, mut g) = guardian();
        let origin = Instant::now();
        assert!(shake(&mut g, origin).is_empty());
        assert!(fx.calls().is_empty());
        assert_eq!(g.fall_phase(), FallPhase::Idle);
    }

    #[test]
    fn shake_arms_with_its_reason() {
        let (_fx, mut g) = monitoring();
        let detections = shake(&mut g, Instant::now());
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].0.kind(), "shake");
        assert!(matches!(detections[0].1, TriggerOutcome::Armed { .. }));
        assert_eq!(g.orchestrator().episode().unwrap().reason, SHAKE_REASON);
    }

    #[test]
    fn manual_alert_after_detection_is_absorbed() {
        let (fx, mut g) = monitoring();
        shake(&mut g, Instant::now());
        let before = fx.calls().len();
        assert!(matches!(g.manual_alert(), TriggerOutcome::Absorbed { .. }));
        assert_eq!(fx.calls().len(), before);
    }

    #[test]
    fn cancel_halts_monitoring_and_resets_detectors() {
        let (fx, mut g) = monitoring();
        let origin = Instant::now();
        g.observe(g.run(), sample(origin, 0, 0.2));
        assert!(matches!(g.fall_phase(), FallPhase::Freefall { .. }));
        g.manual_alert();

        assert!(matches!(g.cancel(), CancelOutcome::Disarmed { .. }));
        assert!(!g.is_monitoring());
        assert_eq!(g.fall_phase(), FallPhase::Idle);
        assert!(!fx.calls().contains(&Call::Announce("Monitoring stopped.".into())));
    }

    #[test]
    fn cancellation_is_the_last_announcement() {
        let (fx, mut g) = monitoring();
        g.manual_alert();
        g.cancel();

        let last = fx
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Announce(text) => Some(text),
                _ => None,
            })
            .last();
        assert_eq!(last.as_deref(), Some(CANCEL_ANNOUNCEMENT));
    }

    #[test]
    fn stop_still_announces() {
        let (fx, mut g) = monitoring();
        g.stop_monitoring();
        assert_eq!(
            fx.calls().last(),
            Some(&Call::Announce("Monitoring stopped.".into()))
        );
    }

    #[test]
    fn samples_from_an_earlier_run_are_dropped() {
        let (_fx, mut g) = monitoring();
        let stale_run = g.run();
        g.stop_monitoring();
        g.start_monitoring(VecSource::new(Vec::new()), |_, _| {}).unwrap();
        assert_ne!(g.run(), stale_run);

        let origin = Instant::now();
        assert!(g.observe(stale_run, sample(origin, 0, 0.2)).is_empty());
        assert_eq!(g.fall_phase(), FallPhase::Idle);

        g.observe(g.run(), sample(origin, 0, 0.2));
        assert!(matches!(g.fall_phase(), FallPhase::Freefall { .. }));
    }

    #[test]
    fn cancel_when_disarmed_keeps_monitoring() {
        let (fx, mut g) = monitoring();
        let before = fx.calls().len();
        assert_eq!(g.cancel(), CancelOutcome::NotArmed);
        assert!(g.is_monitoring());
        assert_eq!(fx.calls().len(), before);
    }

    #[test]
    fn sensor_failure_leaves_manual_path_working() {
        let (_fx, mut g) = guardian();
        let mut source = VecSource::new(Vec::new());
        source.open_result = Err(SensorError::Unavailable("no accelerometer".into()));
        assert!(g.start_monitoring(source, |_, _| {}).is_err());
        assert!(!g.is_monitoring());
        assert!(matches!(g.manual_alert(), TriggerOutcome::Armed { .. }));
    }

    #[test]
    fn clear_voice_command_arms_with_its_text() {
        let (_fx, mut g) = guardian();
        let filter = CommandFilter::new(StubClassifier::clear("Call 911"));
        let ticket = g.begin_command("Call 911").unwrap();
        let outcome = g.finish_command(ticket, filter.classify("Call 911"));
        assert!(matches!(outcome, CommandOutcome::Triggered { ref text, .. } if text == "Call 911"));
        assert_eq!(g.orchestrator().episode().unwrap().reason, "Call 911");
    }

    #[test]
    fn empty_voice_command_is_rejected() {
        let (fx, mut g) = guardian();
        let filter = CommandFilter::new(StubClassifier::clear("Call 911"));
        let ticket = g.begin_command("").unwrap();
        let outcome = g.finish_command(ticket, filter.classify(""));
        assert_eq!(outcome, CommandOutcome::Rejected(ClassifyError::EmptyInput));
        assert!(!g.orchestrator().is_armed());
        assert!(fx.calls().is_empty());
        assert!(!g.command_in_flight());
    }

    #[test]
    fn unclear_command_does_not_arm() {
        let (_fx, mut g) = guardian();
        let ticket = g.begin_command("what now").unwrap();
        let outcome = g.finish_command(
            ticket,
            Ok(CommandResult {
                is_clear: false,
                normalized_text: "Please repeat".into(),
            }),
        );
        assert_eq!(
            outcome,
            CommandOutcome::Unclear {
                guidance: "Please repeat".into()
            }
        );
        assert!(!g.orchestrator().is_armed());
    }

    #[test]
    fn one_command_at_a_time() {
        let (_fx, mut g) = guardian();
        let ticket = g.begin_command("sos").unwrap();
        assert_eq!(g.begin_command("sos again"), Err(Busy));
        g.finish_command(ticket, Err(ClassifyError::Failed("timeout".into())));
        assert!(g.begin_command("sos again").is_ok());
    }

    #[test]
    fn result_after_cancel_is_stale() {
        let (_fx, mut g) = guardian();
        let ticket = g.begin_command("Call 911").unwrap();
        g.manual_alert();
        g.cancel();

        let outcome = g.finish_command(
            ticket,
            Ok(CommandResult {
                is_clear: true,
                normalized_text: "Call 911".into(),
            }),
        );
        assert_eq!(
            outcome,
            CommandOutcome::Stale {
                text: "Call 911".into()
            }
        );
        assert!(!g.orchestrator().is_armed());
    }

    #[test]
    fn sampler_samples_flow_through_observer() {
        let (_fx, mut g) = guardian();
        let origin = Instant::now();
        let readings = [0u64, 600, 1200]
            .into_iter()
            .map(|ms| {
                let at = origin + Duration::from_millis(ms);
                reading(at, Some(20.0), Some(0.0), Some(0.0))
            })
            .collect();
        let (tx, rx) = mpsc::channel();
        g.start_monitoring(VecSource::new(readings), move |run, s| {
            let _ = tx.send((run, s));
        })
        .unwrap();

        let detections: Vec<_> = rx.iter().flat_map(|(run, s)| g.observe(run, s)).collect();
        assert_eq!(detections.len(), 1);
        assert!(g.orchestrator().is_armed());
    }
}

//! Alert effectors: speech, siren, haptics and the outward notification.
//!
//! Every call is fire-and-forget. A failure is returned to the orchestrator
//! for reporting and never blocks the remaining effectors.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};
use url::Url;

use crate::error::EffectorError;

/// On/off vibration durations in milliseconds, repeated while armed.
pub const HAPTIC_PATTERN_MS: [u64; 5] = [500, 200, 500, 200, 500];

const SIREN_BELL_INTERVAL: Duration = Duration::from_secs(1);

pub trait Effectors: Send + Sync {
    /// Speak `text`, superseding any utterance in flight.
    fn announce(&self, text: &str) -> Result<(), EffectorError>;
    fn start_siren(&self) -> Result<(), EffectorError>;
    fn stop_siren(&self) -> Result<(), EffectorError>;
    fn start_haptics(&self) -> Result<(), EffectorError>;
    fn stop_haptics(&self) -> Result<(), EffectorError>;
    /// Dial the emergency number and message the contact.
    fn notify(&self, reason: &str) -> Result<(), EffectorError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub emergency_number: String,
    pub sms_contact: String,
    pub last_location: Option<Location>,
}

pub fn maps_link(location: Location) -> String {
    let query = format!("{},{}", location.latitude, location.longitude);
    Url::parse_with_params(
        "https://www.google.com/maps/search/",
        &[("api", "1"), ("query", query.as_str())],
    )
    .map(String::from)
    .unwrap_or_else(|_| format!("https://www.google.com/maps/search/?api=1&query={query}"))
}

pub fn sms_body(reason: &str, location: Option<Location>) -> String {
    match location {
        Some(loc) => format!(
            "EMERGENCY: {reason}. I need help. My last known location: {}",
            maps_link(loc)
        ),
        None => format!("EMERGENCY: {reason}. I need help. My location is unavailable."),
    }
}

pub fn dial_uri(number: &str) -> String {
    format!("tel:{number}")
}

pub fn sms_uri(contact: &str, body: &str) -> Result<Url, url::ParseError> {
    Url::parse_with_params(&format!("sms:{contact}"), &[("body", body)])
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Desktop implementation ──────────────────────────────────────────────────

/// Effectors backed by the host OS: a TTS command, an audio player loop, and
/// URI handlers for `tel:`/`sms:` intents.
pub struct SystemEffectors {
    notify: NotifyConfig,
    siren_sound: Option<PathBuf>,
    speech: Mutex<Option<Child>>,
    siren: Mutex<Option<Arc<AtomicBool>>>,
    haptics: AtomicBool,
}

impl SystemEffectors {
    pub fn new(notify: NotifyConfig, siren_sound: Option<PathBuf>) -> Self {
        Self {
            notify,
            siren_sound,
            speech: Mutex::new(None),
            siren: Mutex::new(None),
            haptics: AtomicBool::new(false),
        }
    }

    fn speech_command() -> &'static str {
        if cfg!(target_os = "macos") {
            "say"
        } else {
            "espeak"
        }
    }

    fn player_command() -> &'static str {
        if cfg!(target_os = "macos") {
            "afplay"
        } else {
            "paplay"
        }
    }

    fn opener_command() -> &'static str {
        if cfg!(target_os = "macos") {
            "open"
        } else {
            "xdg-open"
        }
    }

    fn open_uri(&self, effector: &'static str, uri: &str) -> Result<(), EffectorError> {
        info!(%uri, "{effector} intent");
        let child = Command::new(Self::opener_command())
            .arg(uri)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| EffectorError::launch(effector, e))?;
        reap(effector, child).map_err(|e| EffectorError::launch(effector, e))?;
        Ok(())
    }
}

impl Effectors for SystemEffectors {
    fn announce(&self, text: &str) -> Result<(), EffectorError> {
        let mut current = lock(&self.speech);
        if let Some(mut previous) = current.take() {
            let _ = previous.kill();
            let _ = previous.wait();
        }
        info!(%text, "speaking");
        let child = Command::new(Self::speech_command())
            .arg(text)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| EffectorError::launch("speech", e))?;
        *current = Some(child);
        Ok(())
    }

    fn start_siren(&self) -> Result<(), EffectorError> {
        let mut slot = lock(&self.siren);
        if slot.is_some() {
            return Ok(());
        }

        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let sound = self.siren_sound.clone();
        thread::Builder::new()
            .name("siren".into())
            .spawn(move || siren_loop(flag, sound))
            .map_err(|e| EffectorError::launch("siren", e))?;

        info!("siren started");
        *slot = Some(running);
        Ok(())
    }

    fn stop_siren(&self) -> Result<(), EffectorError> {
        if let Some(running) = lock(&self.siren).take() {
            running.store(false, Ordering::SeqCst);
            info!("siren stopped");
        }
        Ok(())
    }

    fn start_haptics(&self) -> Result<(), EffectorError> {
        if !self.haptics.swap(true, Ordering::SeqCst) {
            // No vibration motor on the desktop; the pattern is only logged.
            info!(pattern_ms = ?HAPTIC_PATTERN_MS, "haptic pattern started");
        }
        Ok(())
    }

    fn stop_haptics(&self) -> Result<(), EffectorError> {
        if self.haptics.swap(false, Ordering::SeqCst) {
            info!("haptic pattern stopped");
        }
        Ok(())
    }

    fn notify(&self, reason: &str) -> Result<(), EffectorError> {
        let dialed = self.open_uri("dial", &dial_uri(&self.notify.emergency_number));

        let location = self.notify.last_location;
        let body = sms_body(reason, location);
        let texted = sms_uri(&self.notify.sms_contact, &body)
            .map_err(|e| EffectorError::launch("sms", e))
            .and_then(|uri| self.open_uri("sms", uri.as_str()));

        dialed?;
        texted?;
        match location {
            Some(_) => Ok(()),
            None => Err(EffectorError::GeolocationDenied),
        }
    }
}

/// Wait for a detached helper process on its own thread so it does not linger as a zombie.
fn reap(effector: &'static str, mut child: Child) -> std::io::Result<JoinHandle<Option<ExitStatus>>> {
    thread::Builder::new()
        .name(format!("reap-{effector}"))
        .spawn(move || match child.wait() {
            Ok(status) => {
                debug!(%status, "{effector} helper exited");
                Some(status)
            }
            Err(e) => {
                warn!("{effector} helper wait failed: {e}");
                None
            }
        })
}

fn siren_loop(running: Arc<AtomicBool>, sound: Option<PathBuf>) {
    while running.load(Ordering::SeqCst) {
        match &sound {
            Some(path) => {
                let status = Command::new(SystemEffectors::player_command())
                    .arg(path)
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status();
                if let Err(e) = status {
                    warn!(path = %path.display(), "siren playback failed, falling back to bell: {e}");
                    ring_bell_until_stopped(&running);
                    break;
                }
            }
            None => {
                ring_bell_until_stopped(&running);
                break;
            }
        }
    }
    debug!("siren loop exited");
}

fn ring_bell_until_stopped(running: &AtomicBool) {
    while running.load(Ordering::SeqCst) {
        let mut err = std::io::stderr();
        let _ = err.write_all(b"\x07");
        let _ = err.flush();
        thread::sleep(SIREN_BELL_INTERVAL);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Call {
        Announce(String),
        StartSiren,
        StopSiren,
        StartHaptics,
        StopHaptics,
        Notify(String),
    }

    /// Records every call; `notify` can be made to fail.
    #[derive(Default)]
    pub(crate) struct RecordingEffectors {
        pub calls: Mutex<Vec<Call>>,
        pub fail_notify: Option<EffectorError>,
    }

    impl RecordingEffectors {
        pub(crate) fn calls(&self) -> Vec<Call> {
            lock(&self.calls).clone()
        }

        fn record(&self, call: Call) {
            lock(&self.calls).push(call);
        }
    }

    impl Effectors for RecordingEffectors {
        fn announce(&self, text: &str) -> Result<(), EffectorError> {
            self.record(Call::Announce(text.to_string()));
            Ok(())
        }

        fn start_siren(&self) -> Result<(), EffectorError> {
            self.record(Call::StartSiren);
            Ok(())
        }

        fn stop_siren(&self) -> Result<(), EffectorError> {
            self.record(Call::StopSiren);
            Ok(())
        }

        fn start_haptics(&self) -> Result<(), EffectorError> {
            self.record(Call::StartHaptics);
            Ok(())
        }

        fn stop_haptics(&self) -> Result<(), EffectorError> {
            self.record(Call::StopHaptics);
            Ok(())
        }

        fn notify(&self, reason: &str) -> Result<(), EffectorError> {
            self.record(Call::Notify(reason.to_string()));
            match &self.fail_notify {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        }
    }

    #[cfg(unix)]
    #[test]
    fn helper_processes_are_reaped() {
        let child = Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
        let status = reap("dial", child).unwrap().join().unwrap().unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[test]
    fn sms_body_carries_maps_link() {
        let body = sms_body(
            "Fall detected",
            Some(Location {
                latitude: 40.7128,
                longitude: -74.006,
            }),
        );
        assert!(body.starts_with("EMERGENCY: Fall detected."));
        assert!(body.contains("https://www.google.com/maps/search/?api=1&query=40.7128%2C-74.006"));
    }

    #[test]
    fn sms_body_without_location_says_so() {
        let body = sms_body("Manual emergency alert", None);
        assert!(body.contains("location is unavailable"));
        assert!(!body.contains("maps"));
    }

    #[test]
    fn intents_are_well_formed() {
        assert_eq!(dial_uri("8778124700"), "tel:8778124700");
        let uri = sms_uri("8778124700", "help me now").unwrap();
        assert_eq!(uri.scheme(), "sms");
        let body: Vec<_> = uri.query_pairs().collect();
        assert_eq!(body.len(), 1);
        assert_eq!(body[0].0, "body");
        assert_eq!(body[0].1, "help me now");
    }

    #[test]
    fn haptics_and_siren_stop_are_idempotent() {
        let fx = SystemEffectors::new(
            NotifyConfig {
                emergency_number: "911".into(),
                sms_contact: "911".into(),
                last_location: None,
            },
            None,
        );
        assert!(fx.stop_siren().is_ok());
        assert!(fx.stop_haptics().is_ok());
        assert!(fx.start_haptics().is_ok());
        assert!(fx.start_haptics().is_ok());
        assert!(fx.stop_haptics().is_ok());
        assert!(!fx.haptics.load(Ordering::SeqCst));
    }
}

mod classifier;
mod config;
mod console;
mod effects;
mod error;
mod fall;
#[cfg(target_os = "macos")]
mod hid;
mod monitor;
mod orchestrator;
mod sensor;
mod shake;

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use classifier::{Classifier, CommandFilter, CommandResult, KeywordClassifier, LlmClassifier};
use config::{FallConfig, ShakeConfig};
use console::{emit, ConsoleCommand, Notice};
use effects::{Location, NotifyConfig, SystemEffectors};
use error::ClassifyError;
use monitor::{CommandTicket, Guardian};
use orchestrator::EmergencyOrchestrator;
use sensor::{MotionSource, ReplaySource, Sample, UnsupportedSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SourceKind {
    /// Built-in accelerometer (Apple Silicon macOS, needs root)
    Hid,
    /// Recorded JSON-lines file
    Replay,
    /// No motion source: manual and voice alerts only
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ClassifierKind {
    /// llama.cpp-compatible completion server
    Llm,
    /// Offline keyword matching
    Keywords,
}

/// Personal-safety monitor: fall and panic-shake detection with an emergency alert sequence.
#[derive(Parser, Debug)]
#[command(name = "guardian", version, about, long_about = None)]
struct Cli {
    /// Motion source
    #[arg(long, value_enum, env = "GUARDIAN_SOURCE", default_value = "hid")]
    source: SourceKind,

    /// Replay file for `--source replay`
    #[arg(long, env = "GUARDIAN_REPLAY")]
    replay: Option<PathBuf>,

    /// Replay as fast as possible instead of at recorded pace
    #[arg(long)]
    fast_replay: bool,

    /// Start monitoring immediately
    #[arg(long)]
    monitor: bool,

    /// Voice command classifier
    #[arg(long, value_enum, env = "GUARDIAN_CLASSIFIER", default_value = "llm")]
    classifier: ClassifierKind,

    /// Classifier server base URL
    #[arg(long, env = "GUARDIAN_CLASSIFIER_URL", default_value = "http://127.0.0.1:8080")]
    classifier_url: String,

    /// Classifier request timeout in seconds
    #[arg(long, default_value_t = 15)]
    classifier_timeout: u64,

    /// Number dialed when an emergency is armed
    #[arg(long, env = "GUARDIAN_EMERGENCY_NUMBER", default_value = "8778124700")]
    emergency_number: String,

    /// SMS recipient (defaults to the emergency number)
    #[arg(long, env = "GUARDIAN_SMS_CONTACT")]
    sms_contact: Option<String>,

    /// Last known latitude for the SMS map link
    #[arg(long, env = "GUARDIAN_LATITUDE", requires = "longitude", allow_hyphen_values = true)]
    latitude: Option<f64>,

    /// Last known longitude for the SMS map link
    #[arg(long, env = "GUARDIAN_LONGITUDE", requires = "latitude", allow_hyphen_values = true)]
    longitude: Option<f64>,

    /// Sound file looped as the siren (terminal bell if absent)
    #[arg(long, env = "GUARDIAN_SIREN")]
    siren: Option<PathBuf>,

    #[arg(long, default_value_t = config::SHAKE_THRESHOLD)]
    shake_threshold: f64,
    #[arg(long, default_value_t = config::SHAKE_DEBOUNCE_MS)]
    shake_debounce_ms: u64,
    #[arg(long, default_value_t = config::SHAKE_RESET_MS)]
    shake_reset_ms: u64,
    #[arg(long, default_value_t = config::FREEFALL_THRESHOLD)]
    freefall_threshold: f64,
    #[arg(long, default_value_t = config::FREEFALL_TIME_MS)]
    freefall_ms: u64,
    #[arg(long, default_value_t = config::IMPACT_THRESHOLD)]
    impact_threshold: f64,
    #[arg(long, default_value_t = config::INACTIVITY_TIME_MS)]
    inactivity_ms: u64,
    #[arg(long, default_value_t = config::INACTIVITY_THRESHOLD)]
    inactivity_threshold: f64,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, env = "GUARDIAN_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log as JSON
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn shake_config(&self) -> ShakeConfig {
        ShakeConfig {
            threshold: self.shake_threshold,
            debounce: Duration::from_millis(self.shake_debounce_ms),
            reset_after: Duration::from_millis(self.shake_reset_ms),
            ..ShakeConfig::default()
        }
    }

    fn fall_config(&self) -> FallConfig {
        FallConfig {
            freefall_threshold: self.freefall_threshold,
            freefall_time: Duration::from_millis(self.freefall_ms),
            impact_threshold: self.impact_threshold,
            inactivity_time: Duration::from_millis(self.inactivity_ms),
            inactivity_threshold: self.inactivity_threshold,
        }
    }

    fn notify_config(&self) -> NotifyConfig {
        let last_location = match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(Location {
                latitude,
                longitude,
            }),
            _ => None,
        };
        NotifyConfig {
            emergency_number: self.emergency_number.clone(),
            sms_contact: self
                .sms_contact
                .clone()
                .unwrap_or_else(|| self.emergency_number.clone()),
            last_location,
        }
    }

    fn motion_source(&self) -> Box<dyn MotionSource> {
        match (self.source, &self.replay) {
            (SourceKind::Replay, Some(path)) => Box::new(ReplaySource::new(path, !self.fast_replay)),
            (SourceKind::Replay, None) => Box::new(UnsupportedSource("--source replay needs --replay <FILE>")),
            (SourceKind::Hid, _) => hid_source(),
            (SourceKind::None, _) => Box::new(UnsupportedSource("no motion source configured")),
        }
    }

    fn command_filter(&self) -> CommandFilter<Box<dyn Classifier>> {
        let classifier: Box<dyn Classifier> = match self.classifier {
            ClassifierKind::Llm => {
                let llm = LlmClassifier::new(
                    &self.classifier_url,
                    Duration::from_secs(self.classifier_timeout),
                );
                llm.probe();
                Box::new(llm)
            }
            ClassifierKind::Keywords => Box::new(KeywordClassifier),
        };
        CommandFilter::new(classifier)
    }
}

#[cfg(target_os = "macos")]
fn hid_source() -> Box<dyn MotionSource> {
    Box::new(hid::HidAccelerometer::new())
}

#[cfg(not(target_os = "macos"))]
fn hid_source() -> Box<dyn MotionSource> {
    Box::new(UnsupportedSource(
        "built-in accelerometer is only supported on Apple Silicon macOS",
    ))
}

enum Event {
    Motion { run: u64, sample: Sample },
    Console(String),
    Classified {
        ticket: CommandTicket,
        result: Result<CommandResult, ClassifyError>,
    },
    Shutdown,
}

fn init_tracing(cli: &Cli) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| cli.log_level.clone().into());

    if cli.log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn start_monitoring(guardian: &mut Guardian, cli: &Cli, tx: &mpsc::Sender<Event>) -> Notice {
    if guardian.is_monitoring() {
        return Notice::MonitoringStarted;
    }
    let tx = tx.clone();
    match guardian.start_monitoring(cli.motion_source(), move |run, sample| {
        let _ = tx.send(Event::Motion { run, sample });
    }) {
        Ok(()) => Notice::MonitoringStarted,
        Err(e) => {
            warn!("monitoring unavailable, manual alerts only: {e}");
            Notice::SensorUnavailable {
                message: e.to_string(),
            }
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let effectors = Arc::new(SystemEffectors::new(cli.notify_config(), cli.siren.clone()));
    let orchestrator = Arc::new(EmergencyOrchestrator::new(effectors));
    let mut guardian = Guardian::new(orchestrator, cli.shake_config(), cli.fall_config());
    let filter = Arc::new(cli.command_filter());

    let (tx, rx) = mpsc::channel::<Event>();

    let shutdown_tx = tx.clone();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(Event::Shutdown);
    })
    .context("failed to set Ctrl+C handler")?;

    // Console input on its own thread; the event loop owns all state.
    let console_tx = tx.clone();
    thread::Builder::new()
        .name("console".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if console_tx.send(Event::Console(line)).is_err() {
                    break;
                }
            }
            debug!("console input closed");
        })
        .context("failed to spawn console thread")?;

    info!("guardian ready: start | stop | toggle | alert | cancel | status | say <text> | quit");
    if cli.monitor {
        emit([start_monitoring(&mut guardian, &cli, &tx)]);
    }

    while let Ok(event) = rx.recv() {
        match event {
            Event::Motion { run, sample } => {
                for (detection, outcome) in guardian.observe(run, sample) {
                    emit(Notice::from_detection(&detection, &outcome));
                }
            }
            Event::Classified { ticket, result } => {
                let outcome = guardian.finish_command(ticket, result);
                emit(Notice::from_command(&outcome));
            }
            Event::Console(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let command = match ConsoleCommand::parse(&line) {
                    Ok(command) => command,
                    Err(message) => {
                        emit([Notice::Unknown { message }]);
                        continue;
                    }
                };
                match command {
                    ConsoleCommand::Start => emit([start_monitoring(&mut guardian, &cli, &tx)]),
                    ConsoleCommand::Stop => {
                        guardian.stop_monitoring();
                        emit([Notice::MonitoringStopped]);
                    }
                    ConsoleCommand::Toggle => {
                        if guardian.is_monitoring() {
                            guardian.stop_monitoring();
                            emit([Notice::MonitoringStopped]);
                        } else {
                            emit([start_monitoring(&mut guardian, &cli, &tx)]);
                        }
                    }
                    ConsoleCommand::Alert => {
                        let outcome = guardian.manual_alert();
                        emit(Notice::from_trigger(monitor::MANUAL_REASON, &outcome));
                    }
                    ConsoleCommand::Cancel => {
                        let was_monitoring = guardian.is_monitoring();
                        let mut notices = Notice::from_cancel(&guardian.cancel());
                        if was_monitoring && !guardian.is_monitoring() {
                            notices.push(Notice::MonitoringStopped);
                        }
                        emit(notices);
                    }
                    ConsoleCommand::Status => {
                        let episode = guardian.orchestrator().episode();
                        emit([Notice::Status {
                            monitoring: guardian.is_monitoring(),
                            armed: episode.is_some(),
                            reason: episode.map(|e| e.reason),
                            fall_phase: guardian.fall_phase().as_str(),
                            shake_pulses: guardian.shake_pulses(),
                            command_pending: guardian.command_in_flight(),
                        }]);
                    }
                    ConsoleCommand::Say(text) => {
                        let ticket = match guardian.begin_command(&text) {
                            Ok(ticket) => ticket,
                            Err(_) => {
                                emit([Notice::CommandBusy]);
                                continue;
                            }
                        };
                        let filter = filter.clone();
                        let reply_tx = tx.clone();
                        thread::spawn(move || {
                            let result = filter.classify(&text);
                            let _ = reply_tx.send(Event::Classified { ticket, result });
                        });
                    }
                    ConsoleCommand::Quit => break,
                }
            }
            Event::Shutdown => {
                info!("shutting down");
                break;
            }
        }
    }

    guardian.stop_monitoring();
    let fx = guardian.orchestrator().effectors();
    let _ = fx.stop_siren();
    let _ = fx.stop_haptics();
    Ok(())
}

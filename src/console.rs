//! Line-oriented user surface. Commands arrive on stdin; every state change is
//! printed to stdout as one JSON object per line.

use std::io::Write;

use serde::Serialize;

use crate::monitor::{CommandOutcome, Detection};
use crate::orchestrator::{CancelOutcome, TriggerOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Start,
    Stop,
    Toggle,
    Alert,
    Cancel,
    Status,
    Say(String),
    Quit,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };
        match verb.to_ascii_lowercase().as_str() {
            "start" => Ok(ConsoleCommand::Start),
            "stop" => Ok(ConsoleCommand::Stop),
            "toggle" => Ok(ConsoleCommand::Toggle),
            "alert" | "sos" => Ok(ConsoleCommand::Alert),
            "cancel" => Ok(ConsoleCommand::Cancel),
            "status" => Ok(ConsoleCommand::Status),
            "say" => Ok(ConsoleCommand::Say(rest.to_string())),
            "quit" | "exit" => Ok(ConsoleCommand::Quit),
            _ => Err(format!("unknown command: {line}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notice {
    MonitoringStarted,
    MonitoringStopped,
    SensorUnavailable { message: String },
    Detected { kind: &'static str, reason: &'static str },
    Armed { reason: String },
    Absorbed { reason: String, active_reason: String },
    Cancelled { reason: String },
    NotArmed,
    EffectorFailed { message: String },
    CommandClear { text: String },
    CommandUnclear { guidance: String },
    CommandFailed { message: String },
    CommandStale { text: String },
    CommandBusy,
    Status {
        monitoring: bool,
        armed: bool,
        reason: Option<String>,
        fall_phase: &'static str,
        shake_pulses: u8,
        command_pending: bool,
    },
    Unknown { message: String },
}

impl Notice {
    pub fn from_trigger(reason: &str, outcome: &TriggerOutcome) -> Vec<Notice> {
        match outcome {
            TriggerOutcome::Armed { failures } => std::iter::once(Notice::Armed {
                reason: reason.to_string(),
            })
            .chain(failures.iter().map(|f| Notice::EffectorFailed {
                message: f.to_string(),
            }))
            .collect(),
            TriggerOutcome::Absorbed { active_reason } => vec![Notice::Absorbed {
                reason: reason.to_string(),
                active_reason: active_reason.clone(),
            }],
        }
    }

    pub fn from_detection(detection: &Detection, outcome: &TriggerOutcome) -> Vec<Notice> {
        let mut notices = vec![Notice::Detected {
            kind: detection.kind(),
            reason: detection.reason(),
        }];
        notices.extend(Notice::from_trigger(detection.reason(), outcome));
        notices
    }

    pub fn from_cancel(outcome: &CancelOutcome) -> Vec<Notice> {
        match outcome {
            CancelOutcome::Disarmed { episode, failures } => std::iter::once(Notice::Cancelled {
                reason: episode.reason.clone(),
            })
            .chain(failures.iter().map(|f| Notice::EffectorFailed {
                message: f.to_string(),
            }))
            .collect(),
            CancelOutcome::NotArmed => vec![Notice::NotArmed],
        }
    }

    pub fn from_command(outcome: &CommandOutcome) -> Vec<Notice> {
        match outcome {
            CommandOutcome::Triggered { text, trigger } => {
                let mut notices = vec![Notice::CommandClear { text: text.clone() }];
                notices.extend(Notice::from_trigger(text, trigger));
                notices
            }
            CommandOutcome::Unclear { guidance } => vec![Notice::CommandUnclear {
                guidance: guidance.clone(),
            }],
            CommandOutcome::Rejected(e) => vec![Notice::CommandFailed {
                message: e.to_string(),
            }],
            CommandOutcome::Stale { text } => vec![Notice::CommandStale { text: text.clone() }],
        }
    }
}

/// Print notices as JSON lines.
pub fn emit(notices: impl IntoIterator<Item = Notice>) {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for notice in notices {
        if let Ok(json) = serde_json::to_string(&notice) {
            let _ = writeln!(out, "{json}");
        }
    }
    let _ = out.flush();
}

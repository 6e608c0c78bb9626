//! Motion sampling: raw accelerometer readings in, magnitude samples out.
//!
//! A `MotionSource` is opened on the caller's thread so that permission and
//! availability failures reach whoever asked for monitoring. Readings are then
//! pulled on a dedicated thread and pushed to an observer closure.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::SensorError;

// ── Public types ────────────────────────────────────────────────────────────

/// One accelerometer event as delivered by the platform. Any axis may be absent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub at: Instant,
}

/// Normalized sample consumed by the detectors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub magnitude: f64,
    pub timestamp: Instant,
}

impl Sample {
    /// Euclidean norm of the three axes. Readings with a missing axis are dropped,
    /// not zero-filled.
    pub fn from_reading(reading: &Reading) -> Option<Sample> {
        let (x, y, z) = (reading.x?, reading.y?, reading.z?);
        let magnitude = (x * x + y * y + z * z).sqrt();
        if !magnitude.is_finite() {
            return None;
        }
        Some(Sample {
            magnitude,
            timestamp: reading.at,
        })
    }
}

pub trait MotionSource: Send + 'static {
    fn name(&self) -> &'static str;

    /// Acquire the underlying device. Called on the thread that asked to start.
    fn open(&mut self) -> Result<(), SensorError>;

    /// Block until the next reading. `None` once the source is exhausted or closed.
    fn next_reading(&mut self) -> Option<Reading>;
}

impl<S: MotionSource + ?Sized> MotionSource for Box<S> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn open(&mut self) -> Result<(), SensorError> {
        (**self).open()
    }

    fn next_reading(&mut self) -> Option<Reading> {
        (**self).next_reading()
    }
}

// ── Sampler ─────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct SignalSampler {
    active: Option<Arc<AtomicBool>>,
    worker: Option<JoinHandle<()>>,
}

impl SignalSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Open `source` and forward its samples to `observer` until `stop()`.
    /// Starting while already active is a no-op.
    pub fn start<S, F>(&mut self, mut source: S, mut observer: F) -> Result<(), SensorError>
    where
        S: MotionSource,
        F: FnMut(Sample) + Send + 'static,
    {
        if self.is_active() {
            debug!("sampler already active");
            return Ok(());
        }

        source.open()?;
        let name = source.name();
        info!(source = name, "motion source open");

        // Each run gets its own flag so a lingering worker from an earlier run
        // can never forward into a later one.
        let active = Arc::new(AtomicBool::new(true));
        let flag = active.clone();
        let worker = thread::Builder::new()
            .name(format!("sampler-{name}"))
            .spawn(move || {
                let mut dropped = 0u64;
                while flag.load(Ordering::SeqCst) {
                    let Some(reading) = source.next_reading() else {
                        info!(source = name, "motion source exhausted");
                        break;
                    };
                    if !flag.load(Ordering::SeqCst) {
                        break;
                    }
                    match Sample::from_reading(&reading) {
                        Some(sample) => observer(sample),
                        None => dropped += 1,
                    }
                }
                if dropped > 0 {
                    debug!(dropped, "readings with missing axes discarded");
                }
            })
            .map_err(|e| SensorError::Unavailable(format!("failed to spawn sampler thread: {e}")))?;

        self.active = Some(active);
        self.worker = Some(worker);
        Ok(())
    }

    /// Halt delivery. Detector state is untouched; the caller resets it.
    pub fn stop(&mut self) {
        if let Some(flag) = self.active.take() {
            flag.store(false, Ordering::SeqCst);
        }
        // A worker blocked inside the source is left to exit on its next reading.
        if let Some(worker) = self.worker.take() {
            if worker.is_finished() {
                let _ = worker.join();
            }
        }
    }
}

impl Drop for SignalSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Replay source ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ReplayLine {
    t_ms: u64,
    x: Option<f64>,
    y: Option<f64>,
    z: Option<f64>,
}

/// Replays recorded readings from a JSON-lines file:
/// `{"t_ms": 120, "x": 0.1, "y": null, "z": 9.7}`.
pub struct ReplaySource {
    path: PathBuf,
    paced: bool,
    lines: Option<std::io::Lines<BufReader<File>>>,
    origin: Instant,
    line_no: usize,
}

impl ReplaySource {
    pub fn new(path: impl AsRef<Path>, paced: bool) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            paced,
            lines: None,
            origin: Instant::now(),
            line_no: 0,
        }
    }
}

impl MotionSource for ReplaySource {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn open(&mut self) -> Result<(), SensorError> {
        let file = File::open(&self.path).map_err(|e| {
            SensorError::Unavailable(format!("cannot open replay {}: {e}", self.path.display()))
        })?;
        self.lines = Some(BufReader::new(file).lines());
        self.origin = Instant::now();
        Ok(())
    }

    fn next_reading(&mut self) -> Option<Reading> {
        let lines = self.lines.as_mut()?;
        loop {
            let line = match lines.next()? {
                Ok(line) => line,
                Err(e) => {
                    warn!(path = %self.path.display(), "replay read failed: {e}");
                    return None;
                }
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let parsed: ReplayLine = match serde_json::from_str(&line) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(line = self.line_no, "skipping malformed replay line: {e}");
                    continue;
                }
            };
            let at = self.origin + Duration::from_millis(parsed.t_ms);
            if self.paced {
                let wait = at.saturating_duration_since(Instant::now());
                if !wait.is_zero() {
                    thread::sleep(wait);
                }
            }
            return Some(Reading {
                x: parsed.x,
                y: parsed.y,
                z: parsed.z,
                at,
            });
        }
    }
}

/// Stand-in for platforms without a supported accelerometer.
pub struct UnsupportedSource(pub &'static str);

impl MotionSource for UnsupportedSource {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn open(&mut self) -> Result<(), SensorError> {
        Err(SensorError::Unavailable(self.0.to_string()))
    }

    fn next_reading(&mut self) -> Option<Reading> {
        None
    }
}

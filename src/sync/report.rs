//! Run log and progress reporting.
//!
//! The engine never prints directly. Messages go through a [`SyncLog`],
//! byte progress of single file copies through a [`ProgressReporter`], so the
//! CLI can render them and tests can capture them.

use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};

use crate::sync::error::SyncError;

/// Minimum interval between progress bar redraws.
const PROGRESS_UPDATE_INTERVAL: Duration = Duration::from_millis(100);

/// Severity of a run log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Verbose,
    Warning,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Verbose => "INFO",
            Self::Warning => "WARN",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
        }
    }
}

/// Sink for the messages produced during a run.
pub trait SyncLog {
    fn write(&mut self, level: LogLevel, message: &str);

    fn error_count(&self) -> usize;

    fn warning_count(&self) -> usize;

    fn info(&mut self, message: &str) {
        self.write(LogLevel::Verbose, message);
    }

    fn warning(&mut self, message: &str) {
        self.write(LogLevel::Warning, message);
    }

    fn error(&mut self, message: &str) {
        self.write(LogLevel::Error, message);
    }

    /// Log an error value at the severity its variant implies.
    fn write_error(&mut self, error: &SyncError) {
        let level = if error.is_fatal() {
            LogLevel::Fatal
        } else {
            LogLevel::Error
        };
        self.write(level, &error.to_string());
    }
}

/// Log that forwards to `tracing` and keeps counters for the summary.
#[derive(Debug, Default)]
pub struct RunLog {
    errors: usize,
    warnings: usize,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SyncLog for RunLog {
    fn write(&mut self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Verbose => tracing::info!("{}", message),
            LogLevel::Warning => {
                self.warnings += 1;
                tracing::warn!("{}", message);
            }
            LogLevel::Error | LogLevel::Fatal => {
                self.errors += 1;
                tracing::error!("{}", message);
            }
        }
    }

    fn error_count(&self) -> usize {
        self.errors
    }

    fn warning_count(&self) -> usize {
        self.warnings
    }
}

/// In-memory log, mostly for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryLog {
    entries: Vec<(LogLevel, String)>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[(LogLevel, String)] {
        &self.entries
    }

    /// Messages logged at exactly `level`.
    pub fn messages(&self, level: LogLevel) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m.as_str())
            .collect()
    }

    /// Whether any message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.entries.iter().any(|(_, m)| m.contains(needle))
    }
}

impl SyncLog for MemoryLog {
    fn write(&mut self, level: LogLevel, message: &str) {
        self.entries.push((level, message.to_string()));
    }

    fn error_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|(l, _)| *l >= LogLevel::Error)
            .count()
    }

    fn warning_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|(l, _)| *l == LogLevel::Warning)
            .count()
    }
}

/// Byte progress of one file copy.
pub trait ProgressReporter {
    fn start(&mut self, total: u64, label: &str);

    /// Report the number of bytes copied so far.
    fn update(&mut self, done: u64);

    fn stop(&mut self);
}

/// Discards progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn start(&mut self, _total: u64, _label: &str) {}

    fn update(&mut self, _done: u64) {}

    fn stop(&mut self) {}
}

/// Terminal progress bar, redrawn at most every 100ms.
#[derive(Default)]
pub struct BarProgress {
    bar: Option<ProgressBar>,
    last_update: Option<Instant>,
}

impl BarProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressReporter for BarProgress {
    fn start(&mut self, total: u64, label: &str) {
        self.stop();

        let pb = ProgressBar::new(total);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{msg}\n[{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb.set_message(format!("Copying: {}", label));

        self.bar = Some(pb);
        self.last_update = Some(Instant::now());
    }

    fn update(&mut self, done: u64) {
        let Some(pb) = &self.bar else { return };
        let now = Instant::now();
        let due = self
            .last_update
            .map_or(true, |last| now.duration_since(last) >= PROGRESS_UPDATE_INTERVAL);
        if due {
            pb.set_position(done);
            self.last_update = Some(now);
        }
    }

    fn stop(&mut self) {
        if let Some(pb) = self.bar.take() {
            pb.finish_and_clear();
        }
        self.last_update = None;
    }
}

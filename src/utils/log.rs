//! Simple logging module.

use std::fmt::Display;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Log level for filtering messages.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Level::Info => write!(f, "INFO"),
            Level::Warn => write!(f, "WARN"),
            Level::Error => write!(f, "ERROR"),
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);

/// Initialize the logger with the given level.
pub fn init(level: Level) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Returns true if the given level should be logged.
#[inline]
fn enabled(level: Level) -> bool {
    level as u8 >= LOG_LEVEL.load(Ordering::Relaxed)
}

/// Process start reference for elapsed-time prefixes.
fn start_instant() -> Instant {
    use std::sync::OnceLock;
    static START: OnceLock<Instant> = OnceLock::new();
    *START.get_or_init(Instant::now)
}

/// Internal logging function with optional identifier prefix.
fn log_with_id(level: Level, id: Option<&str>, message: &str) {
    if enabled(level) {
        let elapsed = start_instant().elapsed();
        let secs = elapsed.as_secs();
        let millis = elapsed.subsec_millis();
        match id {
            Some(id) => eprintln!("{:6}.{:03} [{:5}] [{}] {}", secs, millis, level, id, message),
            None => eprintln!("{:6}.{:03} [{:5}] {}", secs, millis, level, message),
        }
    }
}

/// Thread-safe logger instance with an identifier prefix.
///
/// Each logger instance carries an ID that is prepended to all log messages,
/// allowing differentiation between components (e.g., deck vs. pilot).
#[derive(Clone)]
pub struct Logger {
    pub id: Arc<str>,
}

impl Logger {
    /// Creates a new logger with the given identifier.
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self { id: id.into() }
    }

    /// Logs an info-level message.
    pub fn info(&self, message: &str) {
        log_with_id(Level::Info, Some(&self.id), message);
    }

    /// Logs a warning-level message.
    pub fn warn(&self, message: &str) {
        log_with_id(Level::Warn, Some(&self.id), message);
    }

    /// Logs an error-level message.
    pub fn error(&self, message: &str) {
        log_with_id(Level::Error, Some(&self.id), message);
    }
}

//! Leveled file logging for the execution engine.
//!
//! Log levels:
//! - ERROR: A run or attempt could not proceed (spawn failures, git errors)
//! - WARN: Recoverable trouble (failed verification, escalations, dropped signals)
//! - INFO: Run lifecycle (start, pause, resume, completion) and task completions
//! - DEBUG: Scheduling decisions and status transitions
//! - TRACE: Raw signal ingestion (output chunks, file events, head polling)
//!
//! The threshold comes from `CONDUCTOR_LOG` (`error` .. `trace`);
//! `CONDUCTOR_DEBUG=1` is shorthand for `debug`. Each line names the module
//! that wrote it:
//!
//! ```text
//! [14:02:11.512] [WARN ] orchestration::controller: Task T-003 blocked: ...
//! ```

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

use crate::config::Config;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    const ALL: [LogLevel; 5] = [
        LogLevel::Error,
        LogLevel::Warn,
        LogLevel::Info,
        LogLevel::Debug,
        LogLevel::Trace,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn current() -> Self {
        let raw = LOG_LEVEL.load(Ordering::Relaxed);
        Self::ALL.get(raw as usize).copied().unwrap_or(LogLevel::Trace)
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| format!("unknown log level: {}", s))
    }
}

/// Threshold from the environment: `CONDUCTOR_LOG`, then `CONDUCTOR_DEBUG`.
fn level_from_env<F>(lookup: F) -> Option<LogLevel>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(level) = lookup("CONDUCTOR_LOG").and_then(|v| v.parse().ok()) {
        return Some(level);
    }
    lookup("CONDUCTOR_DEBUG")
        .filter(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .map(|_| LogLevel::Debug)
}

/// Log to `~/.conductor/conductor.log`, honouring the environment.
///
/// Safe to call more than once; only the first call opens (and truncates)
/// the file.
pub fn init() {
    if let Some(level) = level_from_env(|key| std::env::var(key).ok()) {
        set_level(level);
    }
    if let Ok(dir) = Config::conductor_dir() {
        init_at(&dir.join("conductor.log"));
    }
}

/// Log to an explicit file. Later calls keep the first path.
pub fn init_at(path: &Path) {
    if LOG_PATH.get().is_some() {
        return;
    }
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if LOG_PATH.set(path.to_path_buf()).is_ok() {
        let _ = std::fs::write(path, "");
    }
}

/// Path of the active log file, if logging was initialized.
pub fn log_path() -> Option<&'static Path> {
    LOG_PATH.get().map(PathBuf::as_path)
}

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

pub fn enabled(level: LogLevel) -> bool {
    level <= LogLevel::current()
}

/// `conductor::orchestration::monitor` -> `orchestration::monitor`.
fn short_target(module: &str) -> &str {
    module
        .strip_prefix(concat!(env!("CARGO_CRATE_NAME"), "::"))
        .unwrap_or(module)
}

fn format_line(level: LogLevel, module: &str, msg: &str) -> String {
    format!(
        "[{}] [{:<5}] {}: {}",
        chrono::Local::now().format("%H:%M:%S%.3f"),
        level.as_str(),
        short_target(module),
        msg
    )
}

/// Write one line. Used by the `clog*` macros.
pub fn write(level: LogLevel, module: &str, msg: &str) {
    if !enabled(level) {
        return;
    }
    let Some(path) = LOG_PATH.get() else {
        return;
    };
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(file, "{}", format_line(level, module, msg));
    }
}

#[macro_export]
macro_rules! clog {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::LogLevel::Info, module_path!(), &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! clog_error {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::LogLevel::Error, module_path!(), &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! clog_warn {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::LogLevel::Warn, module_path!(), &format!($($arg)*))
    };
}

/// Only written at `debug` and above.
#[macro_export]
macro_rules! clog_debug {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::LogLevel::Debug, module_path!(), &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! clog_trace {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::LogLevel::Trace, module_path!(), &format!($($arg)*))
    };
}

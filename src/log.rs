//! Diagnostic file logging for keystone.
//!
//! This is the operator-facing trace of what the engine did and why. It is
//! separate from a project's execution log, which is part of the persisted
//! project record.
//!
//! Levels, most to least severe:
//! - ERROR: a run halted or a record could not be loaded/saved
//! - WARN: accepted overruns, task failures, rejected plan edits
//! - INFO: run lifecycle (start, terminal outcome, interrupts)
//! - DEBUG: gate evaluations, dispatch details, decisions asked
//! - TRACE: every execution-log append
//!
//! Nothing is written until `init_with_debug` or `init_at` is called, so the
//! library and its tests stay silent. The level comes from `--debug`,
//! `KEYSTONE_DEBUG=1`, or an explicit `KEYSTONE_LOG=<level>`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};

static SINK: OnceLock<Sink> = OnceLock::new();
static LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

struct Sink {
    path: PathBuf,
    file: Mutex<File>,
}

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
        let raw = LEVEL.load(Ordering::Relaxed) as usize;
        Self::ALL[raw.min(Self::ALL.len() - 1)]
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown log level: {}", s))
    }
}

/// Level chosen by the CLI flag and the environment. An explicit
/// `KEYSTONE_LOG` wins over the debug switches.
fn resolve_level(debug_flag: bool, env_debug: Option<&str>, env_level: Option<&str>) -> LogLevel {
    if let Some(level) = env_level.and_then(|v| v.parse().ok()) {
        return level;
    }
    let env_debug = env_debug.is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    if debug_flag || env_debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

/// Log to `~/.keystone/keystone.log`. Silently stays disabled when there is
/// no home directory or the file cannot be opened.
pub fn init_with_debug(debug: bool) {
    if let Some(dir) = dirs::home_dir().map(|h| h.join(".keystone")) {
        if std::fs::create_dir_all(&dir).is_ok() {
            init_at(&dir.join("keystone.log"), debug);
        }
    }
}

/// Log to an explicit file, truncating it. Only the first call takes effect.
pub fn init_at(path: &Path, debug: bool) {
    let level = resolve_level(
        debug,
        std::env::var("KEYSTONE_DEBUG").ok().as_deref(),
        std::env::var("KEYSTONE_LOG").ok().as_deref(),
    );
    LEVEL.store(level as u8, Ordering::SeqCst);

    let Ok(file) = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
    else {
        return;
    };
    let _ = SINK.set(Sink {
        path: path.to_path_buf(),
        file: Mutex::new(file),
    });
}

/// Where diagnostics are going, once initialized.
pub fn path() -> Option<&'static Path> {
    SINK.get().map(|sink| sink.path.as_path())
}

pub fn enabled(level: LogLevel) -> bool {
    SINK.get().is_some() && level <= LogLevel::current()
}

/// Write one line: time, level, originating module, message.
pub fn write(level: LogLevel, target: &str, msg: &str) {
    if !enabled(level) {
        return;
    }
    let Some(sink) = SINK.get() else {
        return;
    };
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    let target = target.strip_prefix("keystone::").unwrap_or(target);
    if let Ok(mut file) = sink.file.lock() {
        let _ = writeln!(file, "{} {:<5} {}: {}", timestamp, level.as_str(), target, msg);
    }
}

#[macro_export]
macro_rules! klog {
    ($($arg:tt)*) => {
        $crate::klog_at!($crate::log::LogLevel::Info, $($arg)*)
    };
}

#[macro_export]
macro_rules! klog_error {
    ($($arg:tt)*) => {
        $crate::klog_at!($crate::log::LogLevel::Error, $($arg)*)
    };
}

#[macro_export]
macro_rules! klog_warn {
    ($($arg:tt)*) => {
        $crate::klog_at!($crate::log::LogLevel::Warn, $($arg)*)
    };
}

#[macro_export]
macro_rules! klog_debug {
    ($($arg:tt)*) => {
        $crate::klog_at!($crate::log::LogLevel::Debug, $($arg)*)
    };
}

#[macro_export]
macro_rules! klog_trace {
    ($($arg:tt)*) => {
        $crate::klog_at!($crate::log::LogLevel::Trace, $($arg)*)
    };
}

/// Formats only when the level is enabled.
#[doc(hidden)]
#[macro_export]
macro_rules! klog_at {
    ($level:expr, $($arg:tt)*) => {
        if $crate::log::enabled($level) {
            $crate::log::write($level, module_path!(), &format!($($arg)*))
        }
    };
}

use std::sync::atomic::{AtomicU8, Ordering};

/// Verbosity threshold for runner output. Selected on the CLI with
/// `--log-level` and stored process-wide; the macros below consult it before
/// writing anything to stderr.
///
/// Stderr is deliberate: stdout belongs to the `list`/`validate` commands'
/// machine-readable output, and the agent-facing protocol lives in workspace
/// files, never on the runner's streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

static THRESHOLD: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

impl LogLevel {
    fn from_repr(value: u8) -> LogLevel {
        match value {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            _ => LogLevel::Debug,
        }
    }

    /// Tag prepended to every emitted line.
    pub fn tag(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tag())
    }
}

pub fn set_threshold(level: LogLevel) {
    THRESHOLD.store(level as u8, Ordering::Relaxed);
}

pub fn threshold() -> LogLevel {
    LogLevel::from_repr(THRESHOLD.load(Ordering::Relaxed))
}

/// True when a message at `level` passes the current threshold.
pub fn enabled(level: LogLevel) -> bool {
    level <= threshold()
}

/// Emit one tagged line at an explicit level. The leveled wrappers below are
/// what call sites normally use.
#[macro_export]
macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {
        if $crate::log::enabled($level) {
            eprintln!("{}: {}", $level.tag(), format_args!($($arg)*))
        }
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => { $crate::log_at!($crate::log::LogLevel::Error, $($arg)*) };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => { $crate::log_at!($crate::log::LogLevel::Warn, $($arg)*) };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => { $crate::log_at!($crate::log::LogLevel::Info, $($arg)*) };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => { $crate::log_at!($crate::log::LogLevel::Debug, $($arg)*) };
}

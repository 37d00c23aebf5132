//! Serial-backed kernel logger.
//!
//! Early boot code runs before the logger is installed; every call site
//! goes through [`try_get_logger`] and no-ops on `None` rather than
//! panicking, so initialization order is not safety-critical.

use crate::arch::x86_64::serial;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl LogLevel {
    fn tag(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    fn from_u8(v: u8) -> LogLevel {
        match v {
            0 => LogLevel::Trace,
            1 => LogLevel::Debug,
            2 => LogLevel::Info,
            3 => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }
}

pub struct Logger {
    min_level: AtomicU8,
}

static LOGGER_READY: AtomicBool = AtomicBool::new(false);
static LOGGER: Logger = Logger {
    min_level: AtomicU8::new(LogLevel::Debug as u8),
};

impl Logger {
    pub fn set_min_level(&self, level: LogLevel) {
        self.min_level.store(level as u8, Ordering::Relaxed);
    }

    pub fn min_level(&self) -> LogLevel {
        LogLevel::from_u8(self.min_level.load(Ordering::Relaxed))
    }

    /// Logs a pre-formatted line. Never blocks: if the serial port is
    /// contended (re-entrant call from an interrupt) the line is dropped
    /// rather than deadlocking the handler.
    pub fn log(&self, target: &str, level: LogLevel, args: core::fmt::Arguments) {
        if level < self.min_level() {
            return;
        }
        serial::try_print(format_args!("[{}] {}: {}\n", level.tag(), target, args));
    }
}

/// Installs the logger. Safe to call exactly once during early boot,
/// after `serial::init()`.
pub fn init() {
    LOGGER_READY.store(true, Ordering::Release);
}

pub fn try_get_logger() -> Option<&'static Logger> {
    if LOGGER_READY.load(Ordering::Acquire) {
        Some(&LOGGER)
    } else {
        None
    }
}

pub fn log_dbg(target: &str, args: core::fmt::Arguments) {
    if let Some(l) = try_get_logger() {
        l.log(target, LogLevel::Debug, args);
    }
}

pub fn log_info(target: &str, args: core::fmt::Arguments) {
    if let Some(l) = try_get_logger() {
        l.log(target, LogLevel::Info, args);
    }
}

pub fn log_warn(target: &str, args: core::fmt::Arguments) {
    if let Some(l) = try_get_logger() {
        l.log(target, LogLevel::Warn, args);
    }
}

pub fn log_err(target: &str, args: core::fmt::Arguments) {
    if let Some(l) = try_get_logger() {
        l.log(target, LogLevel::Error, args);
    }
}

#[macro_export]
macro_rules! kdebug {
    ($target:expr, $($arg:tt)*) => {
        $crate::log::logger::log_dbg($target, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kinfo {
    ($target:expr, $($arg:tt)*) => {
        $crate::log::logger::log_info($target, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kwarn {
    ($target:expr, $($arg:tt)*) => {
        $crate::log::logger::log_warn($target, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kerror {
    ($target:expr, $($arg:tt)*) => {
        $crate::log::logger::log_err($target, format_args!($($arg)*))
    };
}

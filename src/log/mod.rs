//! Kernel logging subsystem.
//!
//! A small serial-backed logger, reachable even before the heap exists and
//! safe to call from interrupt context (it never blocks on a contended
//! lock — see `logger::Logger::log`).

pub mod logger;

pub use logger::{
    init as init_logger, log_dbg, log_err, log_info, log_warn, try_get_logger, Logger, LogLevel,
};

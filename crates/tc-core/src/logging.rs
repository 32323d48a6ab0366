//! Logging infrastructure for the tricell emulator

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log verbosity selected by the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Initialize the logging system at the given level
pub fn init(level: LogLevel) {
    let level = match level {
        LogLevel::Off => return,
        LogLevel::Error => Level::ERROR,
        LogLevel::Warn => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Trace => Level::TRACE,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true),
        )
        .try_init();
}

/// Initialize logging with default settings (for tests and quick starts)
pub fn init_default() {
    let filter = EnvFilter::from_default_env().add_directive(Level::INFO.into());

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

// Convenience macros for component-specific logging

/// Log a VM trace message
#[macro_export]
macro_rules! vm_trace {
    ($($arg:tt)*) => {
        tracing::trace!(target: "vm", $($arg)*)
    };
}

/// Log a VM debug message
#[macro_export]
macro_rules! vm_debug {
    ($($arg:tt)*) => {
        tracing::debug!(target: "vm", $($arg)*)
    };
}

/// Log a CPU trace message
#[macro_export]
macro_rules! cpu_trace {
    ($($arg:tt)*) => {
        tracing::trace!(target: "cpu", $($arg)*)
    };
}

/// Log a CPU debug message
#[macro_export]
macro_rules! cpu_debug {
    ($($arg:tt)*) => {
        tracing::debug!(target: "cpu", $($arg)*)
    };
}

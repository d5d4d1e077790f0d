//! Logging shims shared by all dialoglern crates.
//!
//! With the `telemetry` feature the macros forward to `tracing`; without it
//! warnings are written to stderr and debug output is dropped.

#[cfg(feature = "telemetry")]
#[doc(hidden)]
pub use tracing as __tracing;

/// Emits a warning.
#[cfg(feature = "telemetry")]
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => { $crate::log::__tracing::warn!($($arg)*) };
}

/// Emits a warning.
#[cfg(not(feature = "telemetry"))]
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => { eprintln!("warning: {}", format_args!($($arg)*)) };
}

/// Emits a debug event.
#[cfg(feature = "telemetry")]
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => { $crate::log::__tracing::debug!($($arg)*) };
}

/// Emits a debug event.
#[cfg(not(feature = "telemetry"))]
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        let _ = format_args!($($arg)*);
    }};
}

// src/macros.rs

//! Leveled logging macros.
//!
//! With the default `logging` feature on, each macro forwards to the
//! matching `tracing` level. With it off, `log_error!` still reaches
//! stderr and the rest compile to nothing.

#[cfg(feature = "logging")]
macro_rules! log_error {
    ($($arg:tt)*) => { tracing::error!($($arg)*) };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_error {
    ($($arg:tt)*) => { eprintln!($($arg)*) };
}

#[cfg(feature = "logging")]
macro_rules! log_warn {
    ($($arg:tt)*) => { tracing::warn!($($arg)*) };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_warn {
    ($($arg:tt)*) => {};
}

#[cfg(feature = "logging")]
macro_rules! log_debug {
    ($($arg:tt)*) => { tracing::debug!($($arg)*) };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_debug {
    ($($arg:tt)*) => {};
}

// Info level is only emitted by the AMQP transport (connection and
// consumer lifecycle), so it exists only in that build.
#[cfg(all(feature = "transport_amqp", feature = "logging"))]
macro_rules! log_info {
    ($($arg:tt)*) => { tracing::info!($($arg)*) };
}

#[cfg(all(feature = "transport_amqp", not(feature = "logging")))]
macro_rules! log_info {
    ($($arg:tt)*) => {};
}

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_warn;

#[cfg(feature = "transport_amqp")]
pub(crate) use log_info;

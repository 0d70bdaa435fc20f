//! Tracing infrastructure for debugging the receive path.
//!
//! Event macros come from `tracing` and are always compiled in; without a
//! subscriber installed they cost a single branch. The optional
//! `tracing-subscriber` feature pulls in the subscriber crate for the
//! [`init_tracing`] helper used by tests and host binaries.

/// Initialize the tracing subscriber with timestamps.
///
/// Call this at the start of tests or the host binary to enable trace output.
/// Does nothing if the `tracing-subscriber` feature is not enabled.
#[cfg(feature = "tracing-subscriber")]
pub fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("weir=debug"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(false)
                .with_line_number(false)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .init();
}

#[cfg(not(feature = "tracing-subscriber"))]
pub const fn init_tracing() {}

pub(crate) use tracing::{debug, error, trace, warn};

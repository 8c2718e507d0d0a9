use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Structured logging with environment-based filtering.
///
/// Defaults to `info,order_events=debug`; override with `RUST_LOG`,
/// e.g. `RUST_LOG=order_events=trace`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,order_events=debug"));

    // A second call (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(filter)
        .try_init();
}

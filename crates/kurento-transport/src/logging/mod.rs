//! `tracing` setup.
//!
//! The transport logs with structured fields under the `kurento_transport`
//! target: `info` for open/close, `warn` for abnormal close causes, `debug` for
//! routing decisions (including dropped frames), `trace` for raw frame bodies.

pub mod test_utils;

pub use test_utils::{CapturedLogs, capture_logs};

/// Install a global stderr subscriber.
///
/// `RUST_LOG` takes precedence over `level`. Subsequent calls are no-ops.
pub fn init_subscriber(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact();

    let _ = subscriber.try_init();
}

/// Like [`init_subscriber`], but emits newline-delimited JSON.
pub fn init_json_subscriber(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .json()
        .try_init();
}

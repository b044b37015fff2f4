//! Tracing setup for the node binary
//!
//! `RUST_LOG` selects the filter (default `info`). `FOGSYNC_LOG_JSON=1`
//! switches to one JSON object per line.

use tracing_subscriber::EnvFilter;

pub fn json_requested() -> bool {
    std::env::var("FOGSYNC_LOG_JSON")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false)
}

/// Install the global subscriber. Calling it twice is harmless.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

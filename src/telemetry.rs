//! Tracing initialization for the binary.
//!
//! Exercise-visible diagnostics go to the event log as `ERROR:`/`WARNING:`
//! lines; tracing carries engine-level diagnostics only, so the default
//! filter is quiet unless raised with `-v` or `PKTDRILL_LOG`.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// `verbose` counts `-v` flags: 0 = warn, 1 = info, 2 = debug, 3+ = trace.
/// The `PKTDRILL_LOG` environment variable overrides the flag entirely.
pub fn init(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "packet_drill=info",
        2 => "packet_drill=debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("PKTDRILL_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

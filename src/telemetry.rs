//! Tracing setup for hosts that do not install their own subscriber.

use tracing_subscriber::fmt::format::FmtSpan;

/// Install a fmt subscriber at DEBUG or INFO.
///
/// Returns false when a global subscriber was already installed.
pub fn init_tracing(debug: bool) -> bool {
    let log_level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .try_init()
        .is_ok()
}

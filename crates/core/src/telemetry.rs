//! Logging bootstrap for hosts embedding the session core.

use tracing::Level;

/// Installs a global `fmt` subscriber with RFC 3339 local timestamps.
///
/// Returns `false` if the host already installed a subscriber, which is left untouched.
pub fn init_tracing(level: Level) -> bool {
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .try_init()
        .is_ok()
}

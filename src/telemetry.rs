//! Tracing setup for the binary.

use tracing_subscriber::EnvFilter;

/// Initialises the global subscriber. `RUST_LOG` wins when set; otherwise the
/// `-v` count picks the level.
pub fn init(verbosity: u8) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("filemesh={default_level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

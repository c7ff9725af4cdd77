//! Logging setup for the provider binary.
//!
//! Everything goes to **stderr**. Stdout carries only the handshake line the
//! driver reads on startup.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: filter directives, e.g. `info` or `hemmer_provider_strava=debug`
//!
//! ```bash
//! # Trace every Strava API call
//! RUST_LOG=hemmer_provider_strava=debug ./hemmer-provider-strava
//! ```

use tracing_subscriber::{fmt, prelude::*, util::TryInitError, EnvFilter};

/// Level used when `RUST_LOG` is unset or unparseable.
pub const DEFAULT_LEVEL: &str = "info";

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

fn try_init_with(default_level: &str) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false),
        )
        .try_init()
}

/// Install the stderr subscriber at [`DEFAULT_LEVEL`].
///
/// A second call is ignored.
pub fn init_logging() {
    init_logging_with_default(DEFAULT_LEVEL);
}

/// Like [`init_logging`], with `default_level` used when `RUST_LOG` is unset.
pub fn init_logging_with_default(default_level: &str) {
    if let Err(e) = try_init_with(default_level) {
        eprintln!("logging already initialized: {}", e);
    }
}

/// Install the subscriber, returning `false` if one was already set.
pub fn try_init_logging() -> bool {
    try_init_with(DEFAULT_LEVEL).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_filter_directives() {
        assert!(EnvFilter::try_new(DEFAULT_LEVEL).is_ok());
        assert!(EnvFilter::try_new("hemmer_provider_strava=debug").is_ok());
        assert!(EnvFilter::try_new("warn,hemmer_provider_strava=trace").is_ok());
    }

    #[test]
    fn test_second_init_reports_already_set() {
        // The first call may lose to another test; the second always loses.
        try_init_logging();
        assert!(!try_init_logging());
    }
}

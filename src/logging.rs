//! Logging setup.
//!
//! The crate emits `tracing` events under the `rtkit::*` targets. Nothing is
//! printed until a subscriber is installed, either by the embedding
//! application or through [`init_logging`].

use crate::config::LogLevel;

/// Install a compact fmt subscriber filtered at `level`.
///
/// `RTKIT_LOG`, then `RUST_LOG`, override the level when set. Returns without
/// error if a global subscriber already exists.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_env("RTKIT_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(format!("rtkit={}", level.as_str())));

    fmt()
        .with_env_filter(filter)
        .compact()
        .try_init()
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init_logging(LogLevel::Debug);
        init_logging(LogLevel::Off);
        tracing::debug!(target: "rtkit::tests", "logging initialized");
    }
}

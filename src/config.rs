//! Runtime configuration.
//!
//! Configuration can be built programmatically or loaded from the
//! environment:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `RTKIT_MAX_INSTANCES` | Capacity of the process-wide instance registry | 2048 |
//! | `RTKIT_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//!
//! ```ignore
//! let config = rtkit::RuntimeConfig::builder()
//!     .max_instances(4096)
//!     .build()?;
//! rtkit::init(&config)?;
//! ```

use std::env;

use crate::error::{Error, Result};

/// Default capacity of the process-wide instance registry.
pub const DEFAULT_MAX_INSTANCES: usize = 2048;

/// Largest registry capacity accepted by [`RuntimeConfig::validate`].
pub const MAX_INSTANCES_LIMIT: usize = 65536;

/// Log level for runtime logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Parse a log level, case-insensitively. Numeric levels 0-5 are accepted.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "off" | "none" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Settings applied when the process-wide registry is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Number of instance ids, i.e. the most `ThreadLocal`s alive at once.
    pub max_instances: usize,
    pub log_level: LogLevel,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_instances: DEFAULT_MAX_INSTANCES,
            log_level: LogLevel::Info,
        }
    }
}

impl RuntimeConfig {
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Defaults overridden by any parsable `RTKIT_*` variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = parse_env_usize("RTKIT_MAX_INSTANCES") {
            config.max_instances = n;
        }
        if let Some(level) = env::var("RTKIT_LOG_LEVEL")
            .ok()
            .and_then(|s| LogLevel::parse(&s))
        {
            config.log_level = level;
        }
        config
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_instances == 0 || self.max_instances > MAX_INSTANCES_LIMIT {
            return Err(Error::InvalidConfig(format!(
                "max_instances must be in 1..={MAX_INSTANCES_LIMIT}, got {}",
                self.max_instances
            )));
        }
        Ok(())
    }
}

/// Builder for [`RuntimeConfig`].
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_instances(mut self, n: usize) -> Self {
        self.config.max_instances = n;
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log_level = level;
        self
    }

    /// Build and validate.
    pub fn build(self) -> Result<RuntimeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build without validation.
    pub fn build_unchecked(self) -> RuntimeConfig {
        self.config
    }
}

fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_instances, 2048);
        assert_eq!(config.log_level, LogLevel::Info);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::builder()
            .max_instances(64)
            .log_level(LogLevel::Debug)
            .build()
            .unwrap();
        assert_eq!(config.max_instances, 64);
        assert_eq!(config.log_level, LogLevel::Debug);
    }

    #[test]
    fn test_validation_rejects_out_of_range() {
        let zero = RuntimeConfig::builder().max_instances(0).build();
        assert!(matches!(zero, Err(Error::InvalidConfig(_))));

        let huge = RuntimeConfig::builder()
            .max_instances(MAX_INSTANCES_LIMIT + 1)
            .build();
        assert!(matches!(huge, Err(Error::InvalidConfig(_))));

        let unchecked = RuntimeConfig::builder().max_instances(0).build_unchecked();
        assert_eq!(unchecked.max_instances, 0);
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("WARN"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse(" trace "), Some(LogLevel::Trace));
        assert_eq!(LogLevel::parse("0"), Some(LogLevel::Off));
        assert_eq!(LogLevel::parse("verbose"), None);
        assert_eq!(LogLevel::Error.as_str(), "error");
    }
}

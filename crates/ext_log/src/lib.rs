//! Diagnostic logging: level parsing and subscriber installation.

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Environment variable overriding the configured log filter
pub const LOG_ENV_VAR: &str = "BREAKER_LOG";

#[derive(Debug, Error)]
pub enum LogError {
    #[error("[7600] Invalid log level: {0}")]
    InvalidLevel(String),
}

pub fn parse_level(level: &str) -> Result<Level, LogError> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(LogError::InvalidLevel(other.to_string())),
    }
}

/// Filter from `env_var` when set and valid, otherwise `default_level`
pub fn env_filter(env_var: &str, default_level: Level) -> EnvFilter {
    EnvFilter::try_from_env(env_var)
        .unwrap_or_else(|_| EnvFilter::new(default_level.as_str().to_ascii_lowercase()))
}

/// Install the global fmt subscriber. Returns false when one is already set.
pub fn init(env_var: &str, default_level: Level) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(env_var, default_level))
        .with_target(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("INFO").unwrap(), Level::INFO);
        assert_eq!(parse_level("warning").unwrap(), Level::WARN);
        assert_eq!(parse_level("trace").unwrap(), Level::TRACE);

        let err = parse_level("loud").unwrap_err();
        assert!(err.to_string().contains("loud"));
    }

    #[test]
    fn test_env_filter_falls_back_to_default() {
        let filter = env_filter("BREAKER_LOG_TEST_UNSET_VARIABLE", Level::DEBUG);
        assert_eq!(
            filter.max_level_hint(),
            Some(tracing_subscriber::filter::LevelFilter::DEBUG)
        );
    }
}

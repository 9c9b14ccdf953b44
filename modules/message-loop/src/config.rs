use std::env;
use std::str::FromStr;

use tracing::{info, warn};

/// Loop tuning knobs. Everything has a default; the environment can override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    /// Catch panics from hooks and handlers and route them to the exception
    /// handler. When off, the panic resumes once the loop's own state is
    /// consistent again.
    pub catch_panics: bool,

    /// Warn when a single loop run drains more entries than this. 0 = never.
    pub run_warn_threshold: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            catch_panics: true,
            run_warn_threshold: 10_000,
        }
    }
}

impl LoopConfig {
    /// Load overrides from `MESSAGE_LOOP_*` environment variables.
    /// Unparseable values keep the default and log a warning.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            catch_panics: env_or("MESSAGE_LOOP_CATCH_PANICS", defaults.catch_panics),
            run_warn_threshold: env_or(
                "MESSAGE_LOOP_RUN_WARN_THRESHOLD",
                defaults.run_warn_threshold,
            ),
        }
    }

    pub fn log_summary(&self) {
        info!("Message loop config:");
        info!("  MESSAGE_LOOP_CATCH_PANICS: {}", self.catch_panics);
        info!(
            "  MESSAGE_LOOP_RUN_WARN_THRESHOLD: {}",
            match self.run_warn_threshold {
                0 => "<disabled>".to_string(),
                n => n.to_string(),
            }
        );
    }
}

fn env_or<T: FromStr + Copy + std::fmt::Display>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => parse_or(key, &raw, default),
        Err(_) => default,
    }
}

fn parse_or<T: FromStr + Copy + std::fmt::Display>(key: &str, raw: &str, default: T) -> T {
    raw.trim().parse().unwrap_or_else(|_| {
        warn!(key, value = raw, %default, "invalid value, using default");
        default
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_catch_panics() {
        let config = LoopConfig::default();
        assert!(config.catch_panics);
        assert_eq!(config.run_warn_threshold, 10_000);
    }

    #[test]
    fn parse_or_accepts_valid_values() {
        assert!(!parse_or("MESSAGE_LOOP_CATCH_PANICS", "false", true));
        assert_eq!(parse_or("MESSAGE_LOOP_RUN_WARN_THRESHOLD", " 0 ", 10usize), 0);
    }

    #[test]
    fn parse_or_falls_back_on_garbage() {
        assert!(parse_or("MESSAGE_LOOP_CATCH_PANICS", "sometimes", true));
        assert_eq!(parse_or("MESSAGE_LOOP_RUN_WARN_THRESHOLD", "-3", 10usize), 10);
    }
}

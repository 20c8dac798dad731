//! Worker configuration with layered loading.
//!
//! Settings come from a TOML file first, then environment variables
//! prefixed with `COURIER_` (double underscore as the section separator,
//! e.g. `COURIER_RUNNER__PER_INTERVAL=4`).

use std::path::Path;

use figment::{
    providers::{Env, Format, Toml},
    Error as FigmentError, Figment,
};
use serde::Deserialize;
use thiserror::Error;

use crate::limiter::RunnerConfig;
use crate::transport::TransportDefaults;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Figment(Box<FigmentError>),

    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<FigmentError> for ConfigError {
    fn from(err: FigmentError) -> Self {
        Self::Figment(Box::new(err))
    }
}

/// Top-level worker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Name of the shared request queue to consume.
    #[serde(default = "default_queue")]
    pub queue: String,

    /// Rate limiter settings.
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Ambient transport defaults.
    #[serde(default)]
    pub transport: TransportDefaults,
}

fn default_queue() -> String {
    "courier".to_owned()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue: default_queue(),
            runner: RunnerConfig::default(),
            transport: TransportDefaults::default(),
        }
    }
}

impl WorkerConfig {
    /// Loads configuration from the default path (`courier.toml`).
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("courier.toml")
    }

    /// Loads configuration from the specified file path.
    ///
    /// Environment variables prefixed with `COURIER_` override file
    /// settings.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let figment = Figment::new().merge(Toml::file(path)).merge(
            Env::prefixed("COURIER_").split("__").lowercase(false),
        );
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::new().merge(Toml::string(content)).extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.is_empty() {
            return Err(ConfigError::Invalid("queue name must not be empty".to_owned()));
        }
        if self.runner.per_interval == 0 {
            return Err(ConfigError::Invalid(
                "runner.per_interval must be at least 1".to_owned(),
            ));
        }
        if self.runner.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "runner.concurrency must be at least 1".to_owned(),
            ));
        }
        if self.runner.interval.is_zero() {
            return Err(ConfigError::Invalid(
                "runner.interval must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::SpillPolicy;
    use std::time::Duration;

    #[test]
    fn defaults_apply_when_sections_are_absent() {
        let config = WorkerConfig::parse("").unwrap();
        assert_eq!(config.queue, "courier");
        assert_eq!(config.runner.per_interval, 10);
        assert!(config.runner.autostart);
        assert!(config.transport.base_url.is_none());
    }

    #[test]
    fn full_document_parses() {
        let config = WorkerConfig::parse(
            r#"
            queue = "api-jobs"

            [runner]
            interval = "250ms"
            per_interval = 4
            concurrency = 2
            autostart = false
            spill = "queue"

            [transport]
            base_url = "https://api.example"
            timeout = "30s"
            user_agent = "courier-worker"

            [transport.headers]
            accept = "application/json"
            "#,
        )
        .unwrap();

        assert_eq!(config.queue, "api-jobs");
        assert_eq!(config.runner.interval, Duration::from_millis(250));
        assert_eq!(config.runner.per_interval, 4);
        assert_eq!(config.runner.spill, SpillPolicy::Queue);
        assert!(!config.runner.autostart);
        assert_eq!(config.transport.base_url.as_deref(), Some("https://api.example"));
        assert_eq!(config.transport.timeout, Some(Duration::from_secs(30)));
        assert_eq!(
            config.transport.headers.get("accept").map(String::as_str),
            Some("application/json")
        );
    }

    #[test]
    fn invalid_limits_are_rejected() {
        let err = WorkerConfig::parse("[runner]\nper_interval = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = WorkerConfig::parse("queue = \"\"").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}

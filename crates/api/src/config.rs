//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use saga::{RetryPolicy, SagaConfig};
use thiserror::Error;

/// An environment variable that is set but cannot be parsed.
#[derive(Debug, Error)]
#[error("invalid value for {var}: {value:?}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

/// Log output format of the binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `info`)
/// - `LOG_FORMAT`: `text` or `json` (default `text`)
/// - `DATABASE_URL`: Postgres connection string; unset runs on in-memory stores
/// - `DATABASE_MAX_CONNECTIONS` (default `10`)
/// - `SAGA_TIMEOUT_MS`, `SAGA_STEP_TIMEOUT_MS`, `SAGA_STEP_MAX_ATTEMPTS`,
///   `SAGA_RETRY_INITIAL_BACKOFF_MS`, `SAGA_RETRY_MAX_BACKOFF_MS`
/// - `OUTBOX_POLL_INTERVAL_MS`, `OUTBOX_BATCH_SIZE`, `OUTBOX_MAX_RETRIES`
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub saga_timeout: Duration,
    pub step_timeout: Duration,
    pub step_max_attempts: u32,
    pub retry_initial_backoff: Duration,
    pub retry_max_backoff: Duration,
    pub outbox_poll_interval: Duration,
    pub outbox_batch_size: usize,
    pub outbox_max_retries: i32,
}

impl Config {
    /// Loads configuration from environment variables, falling back to
    /// defaults for unset ones.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Loads configuration through `lookup`, which returns the value of a
    /// variable if it is set.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let log_format = match get("LOG_FORMAT") {
            None => defaults.log_format,
            Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            Some(v) if v.eq_ignore_ascii_case("text") => LogFormat::Text,
            Some(value) => {
                return Err(ConfigError {
                    var: "LOG_FORMAT",
                    value,
                });
            }
        };

        Ok(Self {
            host: get("HOST").unwrap_or(defaults.host),
            port: parse(&get, "PORT", defaults.port)?,
            log_level: get("RUST_LOG").unwrap_or(defaults.log_level),
            log_format,
            database_url: get("DATABASE_URL"),
            database_max_connections: parse(
                &get,
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            )?,
            saga_timeout: millis(&get, "SAGA_TIMEOUT_MS", defaults.saga_timeout)?,
            step_timeout: millis(&get, "SAGA_STEP_TIMEOUT_MS", defaults.step_timeout)?,
            step_max_attempts: parse(&get, "SAGA_STEP_MAX_ATTEMPTS", defaults.step_max_attempts)?,
            retry_initial_backoff: millis(
                &get,
                "SAGA_RETRY_INITIAL_BACKOFF_MS",
                defaults.retry_initial_backoff,
            )?,
            retry_max_backoff: millis(
                &get,
                "SAGA_RETRY_MAX_BACKOFF_MS",
                defaults.retry_max_backoff,
            )?,
            outbox_poll_interval: millis(
                &get,
                "OUTBOX_POLL_INTERVAL_MS",
                defaults.outbox_poll_interval,
            )?,
            outbox_batch_size: parse(&get, "OUTBOX_BATCH_SIZE", defaults.outbox_batch_size)?,
            outbox_max_retries: parse(&get, "OUTBOX_MAX_RETRIES", defaults.outbox_max_retries)?,
        })
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Saga settings derived from this configuration.
    pub fn saga_config(&self) -> SagaConfig {
        SagaConfig::default()
            .with_saga_timeout(self.saga_timeout)
            .with_step_timeout(self.step_timeout)
            .with_step_retry(RetryPolicy::new(
                self.step_max_attempts,
                self.retry_initial_backoff,
                self.retry_max_backoff,
            ))
            .with_outbox_max_retries(self.outbox_max_retries)
    }
}

fn parse<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError { var, value }),
    }
}

fn millis<G>(get: &G, var: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse(get, var, default_ms).map(Duration::from_millis)
}

impl Default for Config {
    fn default() -> Self {
        let saga = SagaConfig::default();
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            database_max_connections: 10,
            saga_timeout: saga.saga_timeout,
            step_timeout: saga.step_timeout,
            step_max_attempts: saga.step_retry.max_attempts,
            retry_initial_backoff: saga.step_retry.initial_backoff,
            retry_max_backoff: saga.step_retry.max_backoff,
            outbox_poll_interval: Duration::from_millis(500),
            outbox_batch_size: 100,
            outbox_max_retries: saga.outbox_max_retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = load(&[]).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.database_url.is_none());
        assert_eq!(config.saga_timeout, Duration::from_secs(30));
        assert_eq!(config.outbox_batch_size, 100);
    }

    #[test]
    fn test_reads_overrides() {
        let config = load(&[
            ("PORT", "8080"),
            ("LOG_FORMAT", "JSON"),
            ("DATABASE_URL", "postgres://localhost/loyalty"),
            ("SAGA_TIMEOUT_MS", "1500"),
            ("SAGA_STEP_MAX_ATTEMPTS", "7"),
            ("OUTBOX_MAX_RETRIES", "9"),
        ])
        .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/loyalty")
        );

        let saga = config.saga_config();
        assert_eq!(saga.saga_timeout, Duration::from_millis(1500));
        assert_eq!(saga.step_retry.max_attempts, 7);
        assert_eq!(saga.outbox_max_retries, 9);
    }

    #[test]
    fn test_blank_values_use_defaults() {
        let config = load(&[("DATABASE_URL", "  "), ("PORT", "")]).unwrap();
        assert!(config.database_url.is_none());
        assert_eq!(config.port, 3000);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = load(&[("PORT", "eighty")]).unwrap_err();
        assert_eq!(err.var, "PORT");
        assert_eq!(err.value, "eighty");

        assert!(load(&[("LOG_FORMAT", "xml")]).is_err());
        assert!(load(&[("SAGA_TIMEOUT_MS", "-1")]).is_err());
    }

    #[test]
    fn test_addr_formatting() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.addr(), "127.0.0.1:8080");
    }
}

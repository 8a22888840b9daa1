// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::time::Duration;

use crate::errors::ConfigError;

const DEFAULT_PATH: &str = "/var/lib/varnish/*/_.vsl";
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const MAX_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_INACTIVITY_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1000;
const DEFAULT_PUBLISH_MAX_RETRIES: u32 = 3;
const DEFAULT_PUBLISH_RETRY_BACKOFF_MS: u64 = 100;
const MAX_PUBLISH_RETRY_BACKOFF_MS: u64 = 60_000;

/// Header names captured per header family. Empty lists capture nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncludeHeaders {
    /// `ReqHeader` and `BereqHeader`
    pub req: Vec<String>,
    /// `RespHeader` and `BerespHeader`
    pub resp: Vec<String>,
    /// `ObjHeader`
    pub obj: Vec<String>,
}

/// Configuration for the log pipeline
#[derive(Debug, Clone)]
pub struct Config {
    /// Segment file, directory or glob
    pub path: String,
    /// How long to keep retrying attach before giving up
    pub attach_timeout: Duration,
    /// Longest idle wait between reads; bounds stop latency
    pub poll_interval: Duration,
    /// Open transactions idle longer than this are evicted as incomplete
    pub inactivity_timeout: Duration,
    /// How often the eviction sweep runs
    pub sweep_interval: Duration,
    /// Re-attempts after the first `Retry` verdict
    pub publish_max_retries: u32,
    /// Linear backoff step between publish attempts
    pub publish_retry_backoff: Duration,
    /// Emit backend transactions whose client parent is gone
    pub log_backend_traffic: bool,
    /// Start at the oldest retained record instead of the tail
    pub read_from_start: bool,
    pub include_headers: IncludeHeaders,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: DEFAULT_PATH.to_string(),
            attach_timeout: Duration::ZERO,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            inactivity_timeout: Duration::from_secs(DEFAULT_INACTIVITY_TIMEOUT_SECS),
            sweep_interval: Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS),
            publish_max_retries: DEFAULT_PUBLISH_MAX_RETRIES,
            publish_retry_backoff: Duration::from_millis(DEFAULT_PUBLISH_RETRY_BACKOFF_MS),
            log_backend_traffic: true,
            read_from_start: false,
            include_headers: IncludeHeaders::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let path = env::var("VARNISHLOG_PATH").unwrap_or(defaults.path);
        let attach_timeout = env_u64("VARNISHLOG_ATTACH_TIMEOUT_SECS")
            .map_or(defaults.attach_timeout, Duration::from_secs);
        let poll_interval = env_u64("VARNISHLOG_POLL_INTERVAL_MS")
            .map_or(defaults.poll_interval, Duration::from_millis);
        let inactivity_timeout = env_u64("VARNISHLOG_INACTIVITY_TIMEOUT_SECS")
            .map_or(defaults.inactivity_timeout, Duration::from_secs);
        let sweep_interval = env_u64("VARNISHLOG_SWEEP_INTERVAL_MS")
            .map_or(defaults.sweep_interval, Duration::from_millis);
        let publish_max_retries = env::var("VARNISHLOG_PUBLISH_MAX_RETRIES")
            .ok()
            .and_then(|val| val.trim().parse::<u32>().ok())
            .unwrap_or(defaults.publish_max_retries);
        let publish_retry_backoff = env_u64("VARNISHLOG_PUBLISH_RETRY_BACKOFF_MS")
            .map_or(defaults.publish_retry_backoff, Duration::from_millis);
        let log_backend_traffic = env::var("VARNISHLOG_LOG_BACKEND_TRAFFIC")
            .map(|val| val.to_lowercase() != "false")
            .unwrap_or(defaults.log_backend_traffic);
        let read_from_start = env::var("VARNISHLOG_READ_FROM_START")
            .map(|val| val.to_lowercase() == "true")
            .unwrap_or(defaults.read_from_start);
        let include_headers = IncludeHeaders {
            req: env_list("VARNISHLOG_INCLUDE_REQ_HEADERS"),
            resp: env_list("VARNISHLOG_INCLUDE_RESP_HEADERS"),
            obj: env_list("VARNISHLOG_INCLUDE_OBJ_HEADERS"),
        };
        let log_level = env::var("VARNISHLOG_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or(defaults.log_level);

        let config = Self {
            path,
            attach_timeout,
            poll_interval,
            inactivity_timeout,
            sweep_interval,
            publish_max_retries,
            publish_retry_backoff,
            log_backend_traffic,
            read_from_start,
            include_headers,
            log_level,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.path.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "VARNISHLOG_PATH cannot be empty".to_string(),
            ));
        }

        if self.poll_interval.is_zero()
            || self.poll_interval > Duration::from_millis(MAX_POLL_INTERVAL_MS)
        {
            return Err(ConfigError::Invalid(format!(
                "Poll interval must be between 1 and {MAX_POLL_INTERVAL_MS} ms, got {} ms",
                self.poll_interval.as_millis()
            )));
        }

        if self.inactivity_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "Inactivity timeout must be greater than 0".to_string(),
            ));
        }

        if self.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "Sweep interval must be greater than 0".to_string(),
            ));
        }

        if self.publish_retry_backoff > Duration::from_millis(MAX_PUBLISH_RETRY_BACKOFF_MS) {
            return Err(ConfigError::Invalid(format!(
                "Publish retry backoff must be at most {MAX_PUBLISH_RETRY_BACKOFF_MS} ms, got {} ms",
                self.publish_retry_backoff.as_millis()
            )));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key)
        .ok()
        .and_then(|val| val.trim().parse::<u64>().ok())
}

// Comma-separated; blanks are skipped.
fn env_list(key: &str) -> Vec<String> {
    env::var(key)
        .map(|val| {
            val.split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 13] = [
        "VARNISHLOG_PATH",
        "VARNISHLOG_ATTACH_TIMEOUT_SECS",
        "VARNISHLOG_POLL_INTERVAL_MS",
        "VARNISHLOG_INACTIVITY_TIMEOUT_SECS",
        "VARNISHLOG_SWEEP_INTERVAL_MS",
        "VARNISHLOG_PUBLISH_MAX_RETRIES",
        "VARNISHLOG_PUBLISH_RETRY_BACKOFF_MS",
        "VARNISHLOG_LOG_BACKEND_TRAFFIC",
        "VARNISHLOG_READ_FROM_START",
        "VARNISHLOG_INCLUDE_REQ_HEADERS",
        "VARNISHLOG_INCLUDE_RESP_HEADERS",
        "VARNISHLOG_INCLUDE_OBJ_HEADERS",
        "VARNISHLOG_LOG_LEVEL",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.inactivity_timeout, Duration::from_secs(30));
        assert_eq!(config.publish_max_retries, 3);
    }

    #[test]
    fn test_validate_empty_path() {
        let config = Config {
            path: "  ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_poll_interval_bounds() {
        let config = Config {
            poll_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            poll_interval: Duration::from_millis(1500),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_timeouts() {
        let config = Config {
            inactivity_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            sweep_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_retry_backoff_bound() {
        let config = Config {
            publish_retry_backoff: Duration::from_millis(60_000),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        let config = Config {
            publish_retry_backoff: Duration::from_millis(u64::MAX),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let config = Config {
            log_level: "verbose".to_string(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log level 'verbose'"));
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear_env();
        let config = Config::from_env().unwrap();
        assert_eq!(config.path, "/var/lib/varnish/*/_.vsl");
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert!(config.log_backend_traffic);
        assert!(!config.read_from_start);
        assert_eq!(config.include_headers, IncludeHeaders::default());
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        env::set_var("VARNISHLOG_PATH", "/tmp/varnish/_.vsl");
        env::set_var("VARNISHLOG_ATTACH_TIMEOUT_SECS", "5");
        env::set_var("VARNISHLOG_POLL_INTERVAL_MS", "20");
        env::set_var("VARNISHLOG_PUBLISH_MAX_RETRIES", "7");
        env::set_var("VARNISHLOG_LOG_BACKEND_TRAFFIC", "FALSE");
        env::set_var("VARNISHLOG_READ_FROM_START", "true");
        env::set_var("VARNISHLOG_INCLUDE_REQ_HEADERS", "Host, User-Agent,,");
        env::set_var("VARNISHLOG_LOG_LEVEL", "DEBUG");

        let config = Config::from_env().unwrap();
        clear_env();

        assert_eq!(config.path, "/tmp/varnish/_.vsl");
        assert_eq!(config.attach_timeout, Duration::from_secs(5));
        assert_eq!(config.poll_interval, Duration::from_millis(20));
        assert_eq!(config.publish_max_retries, 7);
        assert!(!config.log_backend_traffic);
        assert!(config.read_from_start);
        assert_eq!(config.include_headers.req, vec!["Host", "User-Agent"]);
        assert!(config.include_headers.resp.is_empty());
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    #[serial]
    fn test_from_env_ignores_unparsable_numbers() {
        clear_env();
        env::set_var("VARNISHLOG_INACTIVITY_TIMEOUT_SECS", "soon");
        let config = Config::from_env().unwrap();
        clear_env();
        assert_eq!(config.inactivity_timeout, Duration::from_secs(30));
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_invalid_values() {
        clear_env();
        env::set_var("VARNISHLOG_POLL_INTERVAL_MS", "0");
        let result = Config::from_env();
        clear_env();
        assert!(result.is_err());
    }
}

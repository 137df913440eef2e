// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::allowlist_watcher::DEFAULT_POLL_INTERVAL;
use crate::output::{DEFAULT_BUFFER_SIZE, DEFAULT_FLUSH_INTERVAL, DEFAULT_MAX_FILE_SIZE};
use crate::sampling::SamplingConfig;

pub const DEFAULT_GRPC_PORT: u16 = 4317;
pub const DEFAULT_HTTP_PORT: u16 = 4318;
pub const DEFAULT_MAX_REQUEST_CONTENT_LENGTH: usize = 10 * 1024 * 1024;
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {name}: {reason}")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub host: IpAddr,
    pub grpc_port: u16,
    /// Also the single port used in multiplexed mode.
    pub http_port: u16,
    pub multiplex: bool,
    pub sampling: SamplingConfig,
    pub allowlist_path: Option<PathBuf>,
    pub allowlist_poll_interval: Duration,
    pub output_file: Option<PathBuf>,
    pub output_buffer_size: usize,
    pub output_flush_interval: Duration,
    /// 0 disables rotation.
    pub output_max_file_size: u64,
    pub routing_rules_file: Option<PathBuf>,
    pub transform_config_file: Option<PathBuf>,
    pub max_request_content_length: usize,
    pub shutdown_timeout: Duration,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            grpc_port: DEFAULT_GRPC_PORT,
            http_port: DEFAULT_HTTP_PORT,
            multiplex: false,
            sampling: SamplingConfig::default(),
            allowlist_path: None,
            allowlist_poll_interval: DEFAULT_POLL_INTERVAL,
            output_file: None,
            output_buffer_size: DEFAULT_BUFFER_SIZE,
            output_flush_interval: DEFAULT_FLUSH_INTERVAL,
            output_max_file_size: DEFAULT_MAX_FILE_SIZE,
            routing_rules_file: None,
            transform_config_file: None,
            max_request_content_length: DEFAULT_MAX_REQUEST_CONTENT_LENGTH,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Reads the `OTLP_*` environment variables, falling back to defaults for unset
    /// ones. `PORT`, when it holds a valid port, overrides the HTTP port.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let mut http_port = parse_env("OTLP_HTTP_PORT")?.unwrap_or(defaults.http_port);
        if let Some(port) = non_empty_env("PORT").and_then(|port| port.parse::<u16>().ok()) {
            http_port = port;
        }

        let config = Self {
            host: parse_env("OTLP_HOST")?.unwrap_or(defaults.host),
            grpc_port: parse_env("OTLP_GRPC_PORT")?.unwrap_or(defaults.grpc_port),
            http_port,
            multiplex: parse_bool_env("OTLP_MULTIPLEX")?.unwrap_or(defaults.multiplex),
            sampling: SamplingConfig {
                rate: parse_env("OTLP_SAMPLE_RATE")?.unwrap_or(defaults.sampling.rate),
                debug_only: parse_bool_env("OTLP_SAMPLE_DEBUG_ONLY")?
                    .unwrap_or(defaults.sampling.debug_only),
            },
            allowlist_path: non_empty_env("OTLP_ALLOWLIST_PATH").map(PathBuf::from),
            allowlist_poll_interval: parse_millis_env("OTLP_ALLOWLIST_POLL_INTERVAL_MS")?
                .unwrap_or(defaults.allowlist_poll_interval),
            output_file: non_empty_env("OTLP_OUTPUT_FILE").map(PathBuf::from),
            output_buffer_size: parse_env("OTLP_OUTPUT_BUFFER_SIZE")?
                .unwrap_or(defaults.output_buffer_size),
            output_flush_interval: parse_millis_env("OTLP_OUTPUT_FLUSH_INTERVAL_MS")?
                .unwrap_or(defaults.output_flush_interval),
            output_max_file_size: parse_env("OTLP_OUTPUT_MAX_FILE_SIZE")?
                .unwrap_or(defaults.output_max_file_size),
            routing_rules_file: non_empty_env("OTLP_ROUTING_RULES_FILE").map(PathBuf::from),
            transform_config_file: non_empty_env("OTLP_TRANSFORM_CONFIG_FILE").map(PathBuf::from),
            max_request_content_length: parse_env("OTLP_MAX_REQUEST_CONTENT_LENGTH")?
                .unwrap_or(defaults.max_request_content_length),
            shutdown_timeout: parse_millis_env("OTLP_SHUTDOWN_TIMEOUT_MS")?
                .unwrap_or(defaults.shutdown_timeout),
            log_level: non_empty_env("OTLP_LOG_LEVEL")
                .map(|level| level.to_lowercase())
                .unwrap_or(defaults.log_level),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sampling.rate < 1 {
            return Err(ConfigError::Invalid(
                "sample rate must be at least 1".to_string(),
            ));
        }
        if self.output_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "output buffer size must be at least 1".to_string(),
            ));
        }
        if self.output_flush_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "output flush interval must be greater than 0".to_string(),
            ));
        }
        if self.allowlist_poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "allowlist poll interval must be greater than 0".to_string(),
            ));
        }
        if !self.multiplex && self.grpc_port != 0 && self.grpc_port == self.http_port {
            return Err(ConfigError::Invalid(format!(
                "gRPC and HTTP ports must differ unless multiplexing (both {})",
                self.grpc_port
            )));
        }
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }
        Ok(())
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|val| val.trim().to_string())
        .filter(|val| !val.is_empty())
}

fn parse_env<T>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    non_empty_env(name)
        .map(|value| {
            value
                .parse::<T>()
                .map_err(|e| ConfigError::InvalidValue {
                    name,
                    reason: e.to_string(),
                    value,
                })
        })
        .transpose()
}

fn parse_bool_env(name: &'static str) -> Result<Option<bool>, ConfigError> {
    non_empty_env(name)
        .map(|value| match value.to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                name,
                value,
                reason: "expected true or false".to_string(),
            }),
        })
        .transpose()
}

fn parse_millis_env(name: &'static str) -> Result<Option<Duration>, ConfigError> {
    Ok(parse_env::<u64>(name)?.map(Duration::from_millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 18] = [
        "OTLP_HOST",
        "OTLP_GRPC_PORT",
        "OTLP_HTTP_PORT",
        "PORT",
        "OTLP_MULTIPLEX",
        "OTLP_SAMPLE_RATE",
        "OTLP_SAMPLE_DEBUG_ONLY",
        "OTLP_ALLOWLIST_PATH",
        "OTLP_ALLOWLIST_POLL_INTERVAL_MS",
        "OTLP_OUTPUT_FILE",
        "OTLP_OUTPUT_BUFFER_SIZE",
        "OTLP_OUTPUT_FLUSH_INTERVAL_MS",
        "OTLP_OUTPUT_MAX_FILE_SIZE",
        "OTLP_ROUTING_RULES_FILE",
        "OTLP_TRANSFORM_CONFIG_FILE",
        "OTLP_MAX_REQUEST_CONTENT_LENGTH",
        "OTLP_SHUTDOWN_TIMEOUT_MS",
        "OTLP_LOG_LEVEL",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        let config = Config::from_env().unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.grpc_port, 4317);
        assert_eq!(config.http_port, 4318);
        assert_eq!(config.sampling.rate, 1);
        assert!(config.sampling.debug_only);
        assert_eq!(config.output_buffer_size, 100);
        assert_eq!(config.output_flush_interval, Duration::from_secs(5));
        assert_eq!(config.output_max_file_size, 100 * 1024 * 1024);
        assert!(config.allowlist_path.is_none());
    }

    #[test]
    #[serial]
    fn test_custom_values() {
        clear_env();
        env::set_var("OTLP_HOST", "127.0.0.1");
        env::set_var("OTLP_GRPC_PORT", "5317");
        env::set_var("OTLP_SAMPLE_RATE", "10");
        env::set_var("OTLP_SAMPLE_DEBUG_ONLY", "false");
        env::set_var("OTLP_ALLOWLIST_PATH", "/etc/otlp/allowlist.txt");
        env::set_var("OTLP_OUTPUT_FILE", "/var/log/otlp.jsonl");
        env::set_var("OTLP_OUTPUT_FLUSH_INTERVAL_MS", "250");
        env::set_var("OTLP_MULTIPLEX", "TRUE");
        env::set_var("OTLP_LOG_LEVEL", "DEBUG");

        let config = Config::from_env().unwrap();
        assert_eq!(config.host, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.grpc_port, 5317);
        assert_eq!(config.sampling.rate, 10);
        assert!(!config.sampling.debug_only);
        assert_eq!(
            config.allowlist_path,
            Some(PathBuf::from("/etc/otlp/allowlist.txt"))
        );
        assert_eq!(config.output_file, Some(PathBuf::from("/var/log/otlp.jsonl")));
        assert_eq!(config.output_flush_interval, Duration::from_millis(250));
        assert!(config.multiplex);
        assert_eq!(config.log_level, "debug");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_port_env_overrides_http_port() {
        clear_env();
        env::set_var("OTLP_HTTP_PORT", "9000");
        env::set_var("PORT", "8080");
        assert_eq!(Config::from_env().unwrap().http_port, 8080);

        env::set_var("PORT", "not-a-port");
        assert_eq!(Config::from_env().unwrap().http_port, 9000);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_empty_allowlist_path_disables_filtering() {
        clear_env();
        env::set_var("OTLP_ALLOWLIST_PATH", "  ");
        assert!(Config::from_env().unwrap().allowlist_path.is_none());
        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_values_are_errors() {
        clear_env();
        env::set_var("OTLP_SAMPLE_RATE", "ten");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::InvalidValue {
                name: "OTLP_SAMPLE_RATE",
                ..
            })
        ));
        clear_env();

        env::set_var("OTLP_SAMPLE_RATE", "0");
        assert!(matches!(Config::from_env(), Err(ConfigError::Invalid(_))));
        clear_env();

        env::set_var("OTLP_SAMPLE_DEBUG_ONLY", "maybe");
        assert!(Config::from_env().is_err());
        clear_env();

        env::set_var("OTLP_LOG_LEVEL", "verbose");
        assert!(Config::from_env().is_err());
        clear_env();
    }

    #[test]
    fn test_validate() {
        assert!(Config::default().validate().is_ok());

        let config = Config {
            output_buffer_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            grpc_port: 4318,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            grpc_port: 4318,
            multiplex: true,
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        let config = Config {
            grpc_port: 0,
            http_port: 0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::types::AppError;

pub mod duration_serde;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub web: WebConfig,
    pub engine: EngineConfig,
    pub streaming: StreamingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
    /// Advisory; never armed on streaming responses.
    #[serde(with = "duration_serde::duration")]
    pub read_timeout: Duration,
    /// Advisory; never armed on streaming responses.
    #[serde(with = "duration_serde::duration")]
    pub write_timeout: Duration,
    /// Connect timeout for upstream requests. There is no total request
    /// timeout: live streams must remain open.
    #[serde(with = "duration_serde::duration")]
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root URL of the Ace Stream engine, e.g. "http://127.0.0.1:6878".
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Total buffered bytes per client; the chunk queue holds
    /// `client_buffer_size / 4096` chunks.
    pub client_buffer_size: usize,
    /// Capacity in bytes of the per-stream reconnection ring buffer.
    pub reconnect_buffer_size: usize,
    #[serde(with = "duration_serde::duration")]
    pub reconnect_initial_backoff: Duration,
    #[serde(with = "duration_serde::duration")]
    pub reconnect_max_backoff: Duration,
    pub circuit_breaker: CircuitBreakerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to open the breaker.
    pub failure_threshold: u32,
    /// Open-state cooldown before the breaker allows a half-open probe.
    #[serde(with = "duration_serde::duration")]
    pub cooldown: Duration,
    /// Concurrent probes allowed while half-open.
    pub half_open_max_probes: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            web: WebConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                read_timeout: Duration::from_secs(10),
                write_timeout: Duration::from_secs(10),
                connect_timeout: Duration::from_secs(10),
            },
            engine: EngineConfig {
                base_url: "http://127.0.0.1:6878".to_string(),
            },
            streaming: StreamingConfig {
                client_buffer_size: 4 * 1024 * 1024,
                reconnect_buffer_size: 8 * 1024 * 1024,
                reconnect_initial_backoff: Duration::from_millis(500),
                reconnect_max_backoff: Duration::from_secs(10),
                circuit_breaker: CircuitBreakerConfig {
                    failure_threshold: 5,
                    cooldown: Duration::from_secs(30),
                    half_open_max_probes: 1,
                },
            },
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_file =
            std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".to_string());

        let config: Self = if std::path::Path::new(&config_file).exists() {
            let contents = std::fs::read_to_string(&config_file)?;
            toml::from_str(&contents)?
        } else {
            let default_config = Self::default();
            let contents = toml::to_string_pretty(&default_config)?;
            std::fs::write(&config_file, contents)?;
            default_config
        };

        config.validate()?;
        Ok(config)
    }

    /// Check the cross-field invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.streaming.client_buffer_size == 0 {
            return Err(AppError::configuration(
                "streaming.client_buffer_size must be greater than zero",
            ));
        }
        if self.streaming.reconnect_buffer_size == 0 {
            return Err(AppError::configuration(
                "streaming.reconnect_buffer_size must be greater than zero",
            ));
        }
        if self.streaming.reconnect_initial_backoff.is_zero() {
            return Err(AppError::configuration(
                "streaming.reconnect_initial_backoff must be greater than zero",
            ));
        }
        if self.streaming.reconnect_initial_backoff > self.streaming.reconnect_max_backoff {
            return Err(AppError::configuration(
                "streaming.reconnect_initial_backoff must not exceed reconnect_max_backoff",
            ));
        }
        if self.streaming.circuit_breaker.failure_threshold == 0 {
            return Err(AppError::configuration(
                "streaming.circuit_breaker.failure_threshold must be greater than zero",
            ));
        }
        if self.streaming.circuit_breaker.cooldown.is_zero() {
            return Err(AppError::configuration(
                "streaming.circuit_breaker.cooldown must be greater than zero",
            ));
        }
        if self.streaming.circuit_breaker.half_open_max_probes == 0 {
            return Err(AppError::configuration(
                "streaming.circuit_breaker.half_open_max_probes must be greater than zero",
            ));
        }
        if url::Url::parse(&self.engine.base_url).is_err() {
            return Err(AppError::configuration(format!(
                "engine.base_url is not a valid URL: {}",
                self.engine.base_url
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_reconnect_buffer() {
        let mut config = Config::default();
        config.streaming.reconnect_buffer_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_backoff_inversion() {
        let mut config = Config::default();
        config.streaming.reconnect_initial_backoff = Duration::from_secs(60);
        config.streaming.reconnect_max_backoff = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_invalid_engine_url() {
        let mut config = Config::default();
        config.engine.base_url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn roundtrips_through_toml() {
        let config = Config::default();
        let rendered = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.web.port, config.web.port);
        assert_eq!(
            parsed.streaming.reconnect_initial_backoff,
            config.streaming.reconnect_initial_backoff
        );
    }
}

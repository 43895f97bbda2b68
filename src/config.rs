use std::env;
use std::time::Duration;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub order_queue_size: usize,
    pub event_buffer_size: usize,
    pub offer_timeout_secs: u64,
    pub match_radius_meters: f64,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
            order_queue_size: 1024,
            event_buffer_size: 1024,
            offer_timeout_secs: 60,
            match_radius_meters: 50_000.0,
            retry_max_attempts: 5,
            retry_base_delay_ms: 100,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        let config = Self {
            http_port: parse_or_default("HTTP_PORT", defaults.http_port)?,
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format: match env::var("LOG_FORMAT") {
                Ok(raw) => parse_log_format(&raw),
                Err(_) => defaults.log_format,
            },
            order_queue_size: parse_or_default("ORDER_QUEUE_SIZE", defaults.order_queue_size)?,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", defaults.event_buffer_size)?,
            offer_timeout_secs: parse_or_default(
                "OFFER_TIMEOUT_SECS",
                defaults.offer_timeout_secs,
            )?,
            match_radius_meters: parse_or_default(
                "MATCH_RADIUS_METERS",
                defaults.match_radius_meters,
            )?,
            retry_max_attempts: parse_or_default(
                "RETRY_MAX_ATTEMPTS",
                defaults.retry_max_attempts,
            )?,
            retry_base_delay_ms: parse_or_default(
                "RETRY_BASE_DELAY_MS",
                defaults.retry_base_delay_ms,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn offer_timeout(&self) -> Duration {
        Duration::from_secs(self.offer_timeout_secs)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.offer_timeout_secs == 0 {
            return Err(AppError::Internal(
                "invalid OFFER_TIMEOUT_SECS: must be > 0".to_string(),
            ));
        }
        if !(self.match_radius_meters.is_finite() && self.match_radius_meters > 0.0) {
            return Err(AppError::Internal(
                "invalid MATCH_RADIUS_METERS: must be a positive distance".to_string(),
            ));
        }
        if self.retry_max_attempts == 0 {
            return Err(AppError::Internal(
                "invalid RETRY_MAX_ATTEMPTS: must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_log_format(raw: &str) -> LogFormat {
    if raw.eq_ignore_ascii_case("json") {
        LogFormat::Json
    } else {
        LogFormat::Compact
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}

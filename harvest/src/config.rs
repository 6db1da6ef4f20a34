use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::error::{HarvestError, Result};

fn parse_env_or<T: std::str::FromStr>(var: &str, default: T) -> T
where
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(val) => match val.parse() {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("Invalid value '{}' for {}: {}. Using default.", val, var, e);
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_env_opt<T: std::str::FromStr>(var: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(val) => match val.parse() {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!("Invalid value '{}' for {}: {}. Ignoring.", val, var, e);
                None
            }
        },
        Err(_) => None,
    }
}

pub const DEFAULT_BASE_URL: &str = "https://api.intercom.io";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub fetch: FetchConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
}

/// Remote API connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    pub access_token: Option<String>,
    pub timeout_secs: u64,
    /// Rate-limit and 5xx retries performed inside the HTTP client itself.
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    pub page_size: u32,
    pub max_concurrency: usize,
    pub request_delay_ms: u64,
    pub chunk_threshold_days: i64,
    pub max_chunk_days: i64,
    pub chunk_delay_ms: u64,
    /// Hard stop on items read per search, whatever the caller asked for.
    pub emergency_record_ceiling: usize,
    pub progress_every: usize,
    pub progress_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub jitter_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            page_size: 150,
            max_concurrency: 10,
            request_delay_ms: 100,
            chunk_threshold_days: 7,
            max_chunk_days: 7,
            chunk_delay_ms: 2000,
            emergency_record_ceiling: 50_000,
            progress_every: 50,
            progress_interval_secs: 10,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 1000,
            backoff_factor: 2.0,
            jitter_ms: 500,
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_secs: 60,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let fetch = FetchConfig::default();
        let retry = RetryConfig::default();
        let breaker = BreakerConfig::default();

        Self {
            api: ApiConfig {
                base_url: env::var("HARVEST_BASE_URL")
                    .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
                access_token: parse_env_opt("HARVEST_ACCESS_TOKEN"),
                timeout_secs: parse_env_or("HARVEST_TIMEOUT_SECS", 30),
                max_retries: parse_env_or("HARVEST_MAX_RETRIES", 3),
            },
            fetch: FetchConfig {
                page_size: parse_env_or("HARVEST_PAGE_SIZE", fetch.page_size),
                max_concurrency: parse_env_or("HARVEST_MAX_CONCURRENCY", fetch.max_concurrency),
                request_delay_ms: parse_env_or("HARVEST_REQUEST_DELAY_MS", fetch.request_delay_ms),
                chunk_threshold_days: parse_env_or(
                    "HARVEST_CHUNK_THRESHOLD_DAYS",
                    fetch.chunk_threshold_days,
                ),
                max_chunk_days: parse_env_or("HARVEST_MAX_CHUNK_DAYS", fetch.max_chunk_days),
                chunk_delay_ms: parse_env_or("HARVEST_CHUNK_DELAY_MS", fetch.chunk_delay_ms),
                emergency_record_ceiling: parse_env_or(
                    "HARVEST_EMERGENCY_RECORD_CEILING",
                    fetch.emergency_record_ceiling,
                ),
                progress_every: parse_env_or("HARVEST_PROGRESS_EVERY", fetch.progress_every),
                progress_interval_secs: parse_env_or(
                    "HARVEST_PROGRESS_INTERVAL_SECS",
                    fetch.progress_interval_secs,
                ),
            },
            retry: RetryConfig {
                attempts: parse_env_or("HARVEST_RETRY_ATTEMPTS", retry.attempts),
                base_delay_ms: parse_env_or("HARVEST_RETRY_BASE_DELAY_MS", retry.base_delay_ms),
                backoff_factor: parse_env_or("HARVEST_RETRY_BACKOFF_FACTOR", retry.backoff_factor),
                jitter_ms: parse_env_or("HARVEST_RETRY_JITTER_MS", retry.jitter_ms),
            },
            breaker: BreakerConfig {
                failure_threshold: parse_env_or(
                    "HARVEST_BREAKER_FAILURE_THRESHOLD",
                    breaker.failure_threshold,
                ),
                success_threshold: parse_env_or(
                    "HARVEST_BREAKER_SUCCESS_THRESHOLD",
                    breaker.success_threshold,
                ),
                timeout_secs: parse_env_or("HARVEST_BREAKER_TIMEOUT_SECS", breaker.timeout_secs),
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.fetch.page_size == 0 {
            return Err(HarvestError::Config(
                "HARVEST_PAGE_SIZE must be greater than zero".to_string(),
            ));
        }
        if self.fetch.max_concurrency == 0 {
            return Err(HarvestError::Config(
                "HARVEST_MAX_CONCURRENCY must be greater than zero".to_string(),
            ));
        }
        if self.fetch.max_chunk_days <= 0 {
            return Err(HarvestError::Config(
                "HARVEST_MAX_CHUNK_DAYS must be greater than zero".to_string(),
            ));
        }
        if self.retry.attempts == 0 {
            return Err(HarvestError::Config(
                "HARVEST_RETRY_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if self.breaker.failure_threshold == 0 || self.breaker.success_threshold == 0 {
            return Err(HarvestError::Config(
                "Circuit breaker thresholds must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl FetchConfig {
    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }

    pub fn max_chunk_span(&self) -> chrono::Duration {
        chrono::Duration::days(self.max_chunk_days)
    }

    pub fn chunk_threshold(&self) -> chrono::Duration {
        chrono::Duration::days(self.chunk_threshold_days)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }
}

impl BreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

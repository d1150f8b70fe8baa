// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.
//!
//! Embedders usually build [`EngineConfig`] and [`JobExecutorConfig`] in code
//! (both have sensible defaults). The `procflow-worker` binary loads the full
//! [`Config`] from `PROCFLOW_*` variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffStrategy {
    /// Same delay before every attempt.
    #[default]
    Fixed,
    /// Exponential backoff: delay * 2^(attempt-1)
    Exponential,
}

impl FromStr for BackoffStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            _ => Err(ConfigError::Invalid(
                "PROCFLOW_RETRY_STRATEGY",
                "must be 'fixed' or 'exponential'",
            )),
        }
    }
}

/// Delay policy shared by failed-job rescheduling and command retries.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Growth strategy.
    pub strategy: BackoffStrategy,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Randomly shorten each delay by up to half.
    pub jitter: bool,
}

impl BackoffPolicy {
    /// Constant delay, no jitter.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base_delay: delay,
            max_delay: delay,
            jitter: false,
        }
    }

    /// Doubling delay starting at `base_delay`, capped at `max_delay`.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay,
            max_delay,
            jitter: false,
        }
    }

    /// Enable jitter.
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Calculate delay for a given attempt (1-indexed).
    ///
    /// Attempt 1 is the first retry (after the initial failure).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = match self.strategy {
            BackoffStrategy::Fixed => 1,
            BackoffStrategy::Exponential => 2u32.saturating_pow(attempt.saturating_sub(1)),
        };
        let delay = self
            .base_delay
            .saturating_mul(multiplier)
            .min(self.max_delay.max(self.base_delay));

        if self.jitter && !delay.is_zero() {
            let max_cut = delay.as_millis() as u64 / 2;
            let cut = rand::thread_rng().gen_range(0..=max_cut);
            delay.saturating_sub(Duration::from_millis(cut))
        } else {
            delay
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(10))
    }
}

/// Retry policy for commands that fail on optimistic-lock conflicts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub backoff: BackoffPolicy,
}

impl RetryPolicy {
    /// Create a new retry policy.
    pub fn new(max_attempts: u32, backoff: BackoffPolicy) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::exponential(
                Duration::from_millis(20),
                Duration::from_millis(500),
            )
            .with_jitter(),
        }
    }
}

/// Settings that shape how commands create and fail jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Retries given to newly created jobs.
    pub default_retries: i32,
    /// How long an acquired job stays locked to its worker.
    pub lock_duration: Duration,
    /// Delay before a failed job becomes due again.
    pub job_backoff: BackoffPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_retries: 3,
            lock_duration: Duration::from_secs(300),
            job_backoff: BackoffPolicy::default(),
        }
    }
}

/// Settings for the background job executor.
#[derive(Debug, Clone, PartialEq)]
pub struct JobExecutorConfig {
    /// Lock owner written on acquired jobs.
    pub worker_id: String,
    /// Number of concurrent worker tasks.
    pub worker_count: usize,
    /// Jobs locked per acquisition round.
    pub acquire_batch_size: usize,
    /// Idle sleep between acquisition rounds.
    pub poll_interval: Duration,
    /// Interval of the timer promotion pass.
    pub timer_promotion_interval: Duration,
    /// Interval of the expired-lock reclamation pass.
    pub lock_reclaim_interval: Duration,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            worker_count: 4,
            acquire_batch_size: 3,
            poll_interval: Duration::from_millis(1000),
            timer_promotion_interval: Duration::from_millis(1000),
            lock_reclaim_interval: Duration::from_secs(30),
        }
    }
}

fn default_worker_id() -> String {
    format!("worker-{}", uuid::Uuid::new_v4())
}

/// procflow-worker configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL
    pub database_url: String,
    /// Directory of JSON flow graphs deployed at startup
    pub definitions_dir: PathBuf,
    /// Engine settings
    pub engine: EngineConfig,
    /// Job executor settings
    pub executor: JobExecutorConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `PROCFLOW_DATABASE_URL`: SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `PROCFLOW_DEFINITIONS_DIR`: flow graph directory (default: definitions)
    /// - `PROCFLOW_WORKER_ID`: lock owner name (default: worker-<uuid>)
    /// - `PROCFLOW_WORKER_COUNT`: concurrent workers (default: 4)
    /// - `PROCFLOW_ACQUIRE_BATCH_SIZE`: jobs per acquisition (default: 3)
    /// - `PROCFLOW_POLL_INTERVAL_MS`: idle poll interval (default: 1000)
    /// - `PROCFLOW_LOCK_DURATION_SECS`: job lock duration (default: 300)
    /// - `PROCFLOW_DEFAULT_RETRIES`: retries for new jobs (default: 3)
    /// - `PROCFLOW_RETRY_DELAY_MS`: base retry delay (default: 10000)
    /// - `PROCFLOW_RETRY_STRATEGY`: fixed or exponential (default: fixed)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("PROCFLOW_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("PROCFLOW_DATABASE_URL"))?;

        let definitions_dir = PathBuf::from(
            std::env::var("PROCFLOW_DEFINITIONS_DIR").unwrap_or_else(|_| "definitions".into()),
        );

        let worker_id = std::env::var("PROCFLOW_WORKER_ID").unwrap_or_else(|_| default_worker_id());

        let worker_count: usize = parse_var(
            "PROCFLOW_WORKER_COUNT",
            "4",
            "must be a positive integer",
        )?;
        if worker_count == 0 {
            return Err(ConfigError::Invalid(
                "PROCFLOW_WORKER_COUNT",
                "must be a positive integer",
            ));
        }

        let acquire_batch_size: usize = parse_var(
            "PROCFLOW_ACQUIRE_BATCH_SIZE",
            "3",
            "must be a positive integer",
        )?;
        if acquire_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "PROCFLOW_ACQUIRE_BATCH_SIZE",
                "must be a positive integer",
            ));
        }

        let poll_interval_ms: u64 = parse_var(
            "PROCFLOW_POLL_INTERVAL_MS",
            "1000",
            "must be a number of milliseconds",
        )?;

        let lock_duration_secs: u64 = parse_var(
            "PROCFLOW_LOCK_DURATION_SECS",
            "300",
            "must be a number of seconds",
        )?;

        let default_retries: u32 = parse_var(
            "PROCFLOW_DEFAULT_RETRIES",
            "3",
            "must be a positive integer",
        )?;
        let default_retries = i32::try_from(default_retries)
            .ok()
            .filter(|&retries| retries > 0)
            .ok_or(ConfigError::Invalid(
                "PROCFLOW_DEFAULT_RETRIES",
                "must be a positive integer",
            ))?;

        let retry_delay_ms: u64 = parse_var(
            "PROCFLOW_RETRY_DELAY_MS",
            "10000",
            "must be a number of milliseconds",
        )?;

        let strategy: BackoffStrategy = std::env::var("PROCFLOW_RETRY_STRATEGY")
            .unwrap_or_else(|_| "fixed".to_string())
            .parse()?;

        let retry_delay = Duration::from_millis(retry_delay_ms);
        let job_backoff = match strategy {
            BackoffStrategy::Fixed => BackoffPolicy::fixed(retry_delay),
            // Exponential delays stop growing after an hour.
            BackoffStrategy::Exponential => {
                BackoffPolicy::exponential(retry_delay, Duration::from_secs(3600))
            }
        };

        let poll_interval = Duration::from_millis(poll_interval_ms);

        Ok(Self {
            database_url,
            definitions_dir,
            engine: EngineConfig {
                default_retries,
                lock_duration: Duration::from_secs(lock_duration_secs),
                job_backoff,
            },
            executor: JobExecutorConfig {
                worker_id,
                worker_count,
                acquire_batch_size,
                poll_interval,
                timer_promotion_interval: poll_interval,
                ..JobExecutorConfig::default()
            },
        })
    }
}

fn parse_var<T: FromStr>(
    key: &'static str,
    default: &str,
    message: &'static str,
) -> Result<T, ConfigError> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(key, message))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

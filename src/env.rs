use clap::Parser;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use std::time::Duration;
use tracing::Level;

use crate::breaker::BreakerConfig;
use crate::error::ConfigError;
use crate::reconciler::ReconcilerConfig;
use crate::retry::RetryPolicy;

#[derive(clap::ValueEnum, Debug, Clone)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(log_level: LogLevel) -> Self {
        (&log_level).into()
    }
}

impl From<&LogLevel> for Level {
    fn from(log_level: &LogLevel) -> Self {
        match log_level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct Env {
    #[clap(long = "db", env)]
    pub database_url: String,
    #[clap(long, env, default_value = "5")]
    pub database_max_connections: u32,
    #[clap(long, env, default_value = "info")]
    pub log_level: LogLevel,
    /// Milliseconds between reconciliation cycles
    #[clap(long, env, default_value = "45000")]
    pub reconciliation_interval_ms: u64,
    /// Orders synced within this many minutes are skipped
    #[clap(long, env, default_value = "5")]
    pub reconciliation_stale_minutes: u32,
    #[clap(long, env, default_value = "200")]
    pub reconciliation_batch_size: u32,
    /// Orders reconciled concurrently within one chunk
    #[clap(long, env, default_value = "10")]
    pub reconciliation_concurrency: usize,
    #[clap(long, env, default_value = "500")]
    pub reconciliation_chunk_pause_ms: u64,
    #[clap(long, env, default_value = "5")]
    pub breaker_failure_threshold: u32,
    #[clap(long, env, default_value = "2")]
    pub breaker_success_threshold: u32,
    #[clap(long, env, default_value = "60000")]
    pub breaker_window_ms: u64,
    #[clap(long, env, default_value = "120000")]
    pub breaker_open_duration_ms: u64,
    #[clap(long, env, default_value = "3")]
    pub breaker_half_open_max_calls: u32,
    #[clap(long, env, default_value = "3")]
    pub retry_max_retries: usize,
    #[clap(long, env, default_value = "300")]
    pub retry_initial_delay_ms: u64,
    #[clap(long, env, default_value = "2000")]
    pub retry_max_delay_ms: u64,
    #[clap(long, env, default_value = "2.0")]
    pub retry_backoff_multiplier: f32,
    /// Port for the health and metrics endpoints
    #[clap(long, env, default_value = "8080")]
    pub status_port: u16,
    /// HyperDX API key for telemetry export (optional)
    #[clap(long, env)]
    pub hyperdx_api_key: Option<String>,
}

impl Env {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            (
                "DATABASE_MAX_CONNECTIONS",
                u64::from(self.database_max_connections),
            ),
            (
                "RECONCILIATION_INTERVAL_MS",
                self.reconciliation_interval_ms,
            ),
            (
                "RECONCILIATION_STALE_MINUTES",
                u64::from(self.reconciliation_stale_minutes),
            ),
            (
                "RECONCILIATION_BATCH_SIZE",
                u64::from(self.reconciliation_batch_size),
            ),
            (
                "RECONCILIATION_CONCURRENCY",
                u64::try_from(self.reconciliation_concurrency).unwrap_or(u64::MAX),
            ),
            (
                "BREAKER_FAILURE_THRESHOLD",
                u64::from(self.breaker_failure_threshold),
            ),
            (
                "BREAKER_SUCCESS_THRESHOLD",
                u64::from(self.breaker_success_threshold),
            ),
            ("BREAKER_WINDOW_MS", self.breaker_window_ms),
            ("BREAKER_OPEN_DURATION_MS", self.breaker_open_duration_ms),
            (
                "BREAKER_HALF_OPEN_MAX_CALLS",
                u64::from(self.breaker_half_open_max_calls),
            ),
            ("RETRY_INITIAL_DELAY_MS", self.retry_initial_delay_ms),
            ("RETRY_MAX_DELAY_MS", self.retry_max_delay_ms),
            ("STATUS_PORT", u64::from(self.status_port)),
        ];

        if let Some((setting, _)) = non_zero.into_iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero { setting });
        }

        if self.retry_initial_delay_ms > self.retry_max_delay_ms {
            return Err(ConfigError::RetryDelayOrder {
                initial_ms: self.retry_initial_delay_ms,
                max_ms: self.retry_max_delay_ms,
            });
        }

        if !self.retry_backoff_multiplier.is_finite() || self.retry_backoff_multiplier < 1.0 {
            return Err(ConfigError::BackoffMultiplier(
                self.retry_backoff_multiplier,
            ));
        }

        Ok(())
    }

    pub async fn get_sqlite_pool(&self) -> Result<SqlitePool, sqlx::Error> {
        SqlitePoolOptions::new()
            .max_connections(self.database_max_connections)
            .connect(&self.database_url)
            .await
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            interval: Duration::from_millis(self.reconciliation_interval_ms),
            stale_threshold: chrono::Duration::minutes(i64::from(
                self.reconciliation_stale_minutes,
            )),
            batch_size: self.reconciliation_batch_size,
            concurrency: self.reconciliation_concurrency,
            chunk_pause: Duration::from_millis(self.reconciliation_chunk_pause_ms),
        }
    }

    pub const fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker_failure_threshold,
            success_threshold: self.breaker_success_threshold,
            window: Duration::from_millis(self.breaker_window_ms),
            open_duration: Duration::from_millis(self.breaker_open_duration_ms),
            half_open_max_calls: self.breaker_half_open_max_calls,
        }
    }

    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry_max_retries,
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            backoff_multiplier: self.retry_backoff_multiplier,
        }
    }
}

/// `RUST_LOG` fallback covering both workspace crates.
pub(crate) fn default_filter(level: Level) -> String {
    format!("order_reconciler={level},reconciler_exchange={level}")
}

/// Console-only logging, used when no telemetry exporter is configured.
pub fn setup_tracing(log_level: &LogLevel) {
    let default_filter = default_filter(log_level.into());

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .compact()
        .init();
}

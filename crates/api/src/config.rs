//! Application configuration loaded from environment variables.

use std::time::Duration;

use checkout::CheckoutConfig;
use common::RetryPolicy;
use inventory::{LedgerConfig, SweeperConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Server configuration with defaults for local development.
///
/// | Variable | Default |
/// |---|---|
/// | `HOST` / `PORT` | `0.0.0.0` / `3000` |
/// | `RUST_LOG` | `info` |
/// | `LOG_FORMAT` | `pretty` (`json` for JSON lines) |
/// | `DATABASE_URL` | unset: in-memory stores |
/// | `RESERVATION_WINDOW_SECS` | `600` |
/// | `SWEEP_INTERVAL_SECS` / `SWEEP_BATCH_SIZE` | `30` / `100` |
/// | `LEASE_TTL_MS` | `5000` |
/// | `LOCK_RETRY_ATTEMPTS` / `LOCK_RETRY_BACKOFF_MS` | `30` / `100` |
/// | `PAYMENT_WEBHOOK_SECRET` | `dev-secret` |
/// | `GATEWAY_TIMEOUT_MS` | `10000` |
/// | `CURRENCY` | `INR` |
/// | `NOTIFICATION_WEBHOOK_URL` / `DELIVERY_WEBHOOK_URL` | unset: log only |
///
/// Unparseable numbers fall back to their default.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub reservation_window: Duration,
    pub sweep_interval: Duration,
    pub sweep_batch_size: usize,
    pub lease_ttl: Duration,
    pub lock_retry: RetryPolicy,
    pub payment_webhook_secret: String,
    pub gateway_timeout: Duration,
    pub currency: String,
    pub notification_webhook_url: Option<String>,
    pub delivery_webhook_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key/value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let text = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let number = |key: &str, default: u64| {
            text(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };

        Self {
            host: text("HOST").unwrap_or(defaults.host),
            port: text("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: text("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: match text("LOG_FORMAT").as_deref() {
                Some(f) if f.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
            database_url: text("DATABASE_URL"),
            reservation_window: Duration::from_secs(number("RESERVATION_WINDOW_SECS", 600)),
            sweep_interval: Duration::from_secs(number("SWEEP_INTERVAL_SECS", 30)),
            sweep_batch_size: number("SWEEP_BATCH_SIZE", 100) as usize,
            lease_ttl: Duration::from_millis(number("LEASE_TTL_MS", 5000)),
            lock_retry: RetryPolicy::new(
                number("LOCK_RETRY_ATTEMPTS", 30) as u32,
                Duration::from_millis(number("LOCK_RETRY_BACKOFF_MS", 100)),
            ),
            payment_webhook_secret: text("PAYMENT_WEBHOOK_SECRET")
                .unwrap_or(defaults.payment_webhook_secret),
            gateway_timeout: Duration::from_millis(number("GATEWAY_TIMEOUT_MS", 10_000)),
            currency: text("CURRENCY").unwrap_or(defaults.currency),
            notification_webhook_url: text("NOTIFICATION_WEBHOOK_URL"),
            delivery_webhook_url: text("DELIVERY_WEBHOOK_URL"),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            reservation_window: self.reservation_window,
            lease_duration: self.lease_ttl,
            lock_retry: self.lock_retry,
        }
    }

    pub fn sweeper_config(&self) -> SweeperConfig {
        SweeperConfig {
            interval: self.sweep_interval,
            batch_size: self.sweep_batch_size,
        }
    }

    pub fn checkout_config(&self) -> CheckoutConfig {
        CheckoutConfig {
            currency: self.currency.clone(),
            lease_duration: self.lease_ttl,
            lock_retry: self.lock_retry,
            gateway_timeout: self.gateway_timeout,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            database_url: None,
            reservation_window: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(30),
            sweep_batch_size: 100,
            lease_ttl: Duration::from_millis(5000),
            lock_retry: RetryPolicy::default(),
            payment_webhook_secret: "dev-secret".to_string(),
            gateway_timeout: Duration::from_secs(10),
            currency: "INR".to_string(),
            notification_webhook_url: None,
            delivery_webhook_url: None,
        }
    }
}

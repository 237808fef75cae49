//! Wallet service configuration.

use std::str::FromStr;
use std::time::Duration;

use tradewallet_common::{constants, limits, Currency};
use tradewallet_fx::{HttpRateProvider, RateEngineConfig};
use tradewallet_ledger::WriteMode;

/// Exchange-rate configuration.
#[derive(Debug, Clone)]
pub struct RateConfig {
    /// Currency every rate is quoted against.
    pub base_currency: Currency,
    /// Upstream rates endpoint.
    pub api_url: String,
    /// Time between upstream fetches.
    pub refresh_interval: Duration,
    /// Time between subscriber pushes.
    pub broadcast_interval: Duration,
    /// Upper bound for one upstream request.
    pub fetch_timeout: Duration,
    /// Pending snapshots per subscriber.
    pub subscriber_buffer: usize,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            base_currency: Currency::usd(),
            api_url: HttpRateProvider::DEFAULT_URL.to_string(),
            refresh_interval: constants::rate_refresh_interval(),
            broadcast_interval: constants::rate_broadcast_interval(),
            fetch_timeout: constants::rate_fetch_timeout(),
            subscriber_buffer: limits::SUBSCRIBER_BUFFER,
        }
    }
}

impl RateConfig {
    pub fn engine_config(&self) -> RateEngineConfig {
        RateEngineConfig {
            base_currency: self.base_currency.clone(),
            refresh_interval: self.refresh_interval,
            broadcast_interval: self.broadcast_interval,
            fetch_timeout: self.fetch_timeout,
            subscriber_buffer: self.subscriber_buffer,
        }
    }
}

/// Trading configuration.
#[derive(Debug, Clone)]
pub struct TradingConfig {
    /// Attempts per operation when the store reports a version conflict.
    pub max_attempts: u32,
    /// How ledger writes reach storage.
    pub write_mode: WriteMode,
    /// Interval for dropping idle wallet locks.
    pub lock_prune_interval: Duration,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            max_attempts: limits::TRADE_MAX_ATTEMPTS,
            write_mode: WriteMode::Atomic,
            lock_prune_interval: constants::lock_prune_interval(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            other => Err(format!("unknown log format: {}", other)),
        }
    }
}

/// Main wallet service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Rate configuration.
    pub rates: RateConfig,
    /// Trading configuration.
    pub trading: TradingConfig,
    /// Postgres URL; the in-memory store is used when absent.
    pub database_url: Option<String>,
    /// Pool size for the Postgres store.
    pub database_max_connections: u32,
    /// Log level.
    pub log_level: String,
    /// Log format.
    pub log_format: LogFormat,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            rates: RateConfig::default(),
            trading: TradingConfig::default(),
            database_url: None,
            database_max_connections: 10,
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from any name-to-value source.
    ///
    /// Values that fail to parse keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let parsed = |name: &str| lookup(name).and_then(|v| v.trim().parse::<u64>().ok());

        if let Some(code) = lookup("BASE_CURRENCY") {
            config.rates.base_currency = Currency::new(code);
        }

        if let Some(url) = lookup("RATES_API_URL") {
            config.rates.api_url = url;
        }

        if let Some(secs) = parsed("EXCHANGES_FETCH_INTERVAL") {
            config.rates.refresh_interval = Duration::from_secs(secs);
        }

        if let Some(secs) = parsed("BROADCAST_INTERVAL") {
            config.rates.broadcast_interval = Duration::from_secs(secs);
        }

        if let Some(secs) = parsed("FETCH_TIMEOUT") {
            config.rates.fetch_timeout = Duration::from_secs(secs);
        }

        if let Some(buffer) = parsed("SUBSCRIBER_BUFFER") {
            config.rates.subscriber_buffer = buffer as usize;
        }

        if let Some(attempts) = parsed("TRADE_MAX_ATTEMPTS") {
            config.trading.max_attempts = attempts.min(u32::MAX as u64) as u32;
        }

        if let Some(mode) = lookup("LEDGER_WRITE_MODE").and_then(|v| v.parse().ok()) {
            config.trading.write_mode = mode;
        }

        if let Some(url) = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()) {
            config.database_url = Some(url);
        }

        if let Some(size) = parsed("DATABASE_MAX_CONNECTIONS") {
            config.database_max_connections = size.min(u32::MAX as u64) as u32;
        }

        if let Some(level) = lookup("LOG_LEVEL") {
            config.log_level = level;
        }

        if let Some(format) = lookup("LOG_FORMAT").and_then(|v| v.parse().ok()) {
            config.log_format = format;
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if !self.rates.base_currency.is_valid() {
            return Err(format!("Invalid base currency: {}", self.rates.base_currency));
        }

        if self.rates.api_url.trim().is_empty() {
            return Err("Rates API URL cannot be empty".to_string());
        }

        if self.rates.refresh_interval.is_zero() || self.rates.broadcast_interval.is_zero() {
            return Err("Rate intervals must be greater than zero".to_string());
        }

        if self.rates.fetch_timeout.is_zero() {
            return Err("Fetch timeout must be greater than zero".to_string());
        }

        if self.rates.subscriber_buffer == 0 {
            return Err("Subscriber buffer must be greater than zero".to_string());
        }

        if self.trading.max_attempts == 0 {
            return Err("Trade attempts must be greater than zero".to_string());
        }

        if self.database_max_connections == 0 {
            return Err("Database pool size must be greater than zero".to_string());
        }

        Ok(())
    }
}

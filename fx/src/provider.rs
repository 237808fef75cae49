//! Rate provider trait and implementations.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;
use tradewallet_common::Currency;

use crate::error::{FetchError, FetchResult};
use crate::snapshot::ExchangeRateSnapshot;

/// Trait for exchange-rate sources.
#[async_trait]
pub trait RateProvider: Send + Sync {
    /// Get the provider name.
    fn name(&self) -> &str;

    /// Fetch a complete rate table quoted against `base`.
    ///
    /// Either every rate parses or no snapshot is returned.
    async fn fetch(&self, base: &Currency) -> FetchResult<ExchangeRateSnapshot>;
}

/// Upstream body: `{ "data": { "currency": "USD", "rates": { "BTC": "0.00004" } } }`.
#[derive(Debug, Deserialize)]
struct UpstreamResponse {
    data: UpstreamRates,
}

#[derive(Debug, Deserialize)]
struct UpstreamRates {
    #[serde(default)]
    currency: String,
    rates: HashMap<String, String>,
}

/// Fetches rates from a Coinbase-style `exchange-rates` endpoint.
pub struct HttpRateProvider {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpRateProvider {
    pub const DEFAULT_URL: &'static str = "https://api.coinbase.com/v2/exchange-rates";

    /// Create a provider whose every request is bounded by `timeout`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> FetchResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            timeout,
        })
    }

    fn map_error(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(self.timeout.as_millis() as u64)
        } else {
            FetchError::from(err)
        }
    }
}

#[async_trait]
impl RateProvider for HttpRateProvider {
    fn name(&self) -> &str {
        "HTTP"
    }

    async fn fetch(&self, base: &Currency) -> FetchResult<ExchangeRateSnapshot> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[("currency", base.code())])
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let body = response.bytes().await.map_err(|e| self.map_error(e))?;
        let parsed: UpstreamResponse =
            serde_json::from_slice(&body).map_err(|e| FetchError::Decode(e.to_string()))?;

        let snapshot = parse_rates(parsed.data, base, self.name())?;
        debug!(
            base = %snapshot.base,
            rates = snapshot.len(),
            "Fetched exchange rates"
        );
        Ok(snapshot)
    }
}

/// Convert the upstream string table into a snapshot, stopping at the
/// first value that is not a positive number.
fn parse_rates(
    data: UpstreamRates,
    requested: &Currency,
    source: &str,
) -> FetchResult<ExchangeRateSnapshot> {
    let base = if data.currency.trim().is_empty() {
        requested.clone()
    } else {
        Currency::new(data.currency)
    };

    let mut rates = BTreeMap::new();
    for (code, raw) in data.rates {
        let rate = parse_decimal(&raw).filter(|r| *r > Decimal::ZERO).ok_or_else(|| {
            FetchError::InvalidRate {
                currency: code.clone(),
                value: raw.clone(),
            }
        })?;
        rates.insert(Currency::new(code), rate);
    }

    Ok(ExchangeRateSnapshot::new(base, rates, source))
}

fn parse_decimal(raw: &str) -> Option<Decimal> {
    let raw = raw.trim();
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .ok()
}

/// Serves a rate table held in memory.
///
/// Used for offline runs and simulation; can be switched off or slowed
/// down to emulate an unhealthy upstream.
pub struct FixedRateProvider {
    name: String,
    rates: RwLock<BTreeMap<Currency, Decimal>>,
    available: AtomicBool,
    latency: RwLock<Option<Duration>>,
    fetches: AtomicU64,
}

impl FixedRateProvider {
    /// Create an empty provider.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rates: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
            latency: RwLock::new(None),
            fetches: AtomicU64::new(0),
        }
    }

    /// Create a provider preloaded with rates.
    pub fn with_rates<I, C>(name: impl Into<String>, rates: I) -> Self
    where
        I: IntoIterator<Item = (C, Decimal)>,
        C: Into<Currency>,
    {
        let provider = Self::new(name);
        for (currency, rate) in rates {
            provider.set_rate(currency, rate);
        }
        provider
    }

    /// Set the rate for a currency.
    pub fn set_rate(&self, currency: impl Into<Currency>, rate: Decimal) {
        self.rates.write().insert(currency.into(), rate);
    }

    /// Remove a currency from the table.
    pub fn remove_rate(&self, currency: &Currency) {
        self.rates.write().remove(currency);
    }

    /// Toggle availability; an unavailable provider fails every fetch.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every fetch by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    /// Number of fetches served or refused so far.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RateProvider for FixedRateProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, base: &Currency) -> FetchResult<ExchangeRateSnapshot> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if !self.available.load(Ordering::SeqCst) {
            return Err(FetchError::Unavailable(self.name.clone()));
        }

        let rates = self.rates.read().clone();
        Ok(ExchangeRateSnapshot::new(base.clone(), rates, self.name.clone()))
    }
}

//! Immutable exchange-rate table.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tradewallet_common::Currency;

/// A complete rate table for one base currency.
///
/// Each rate is the amount of the target currency obtainable for one unit
/// of the base currency. A snapshot is never modified after construction;
/// refreshes replace it wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRateSnapshot {
    /// Base currency the rates are quoted against.
    pub base: Currency,
    /// Target currency to units-per-base.
    pub rates: BTreeMap<Currency, Decimal>,
    /// When the snapshot was fetched.
    pub fetched_at: DateTime<Utc>,
    /// Provider that produced the snapshot.
    pub source: String,
}

impl ExchangeRateSnapshot {
    /// Create a snapshot stamped with the current time.
    pub fn new(
        base: Currency,
        rates: BTreeMap<Currency, Decimal>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            base,
            rates,
            fetched_at: Utc::now(),
            source: source.into(),
        }
    }

    /// Look up the rate for a target currency.
    pub fn rate(&self, currency: &Currency) -> Option<Decimal> {
        self.rates.get(currency).copied()
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    /// Render the push message sent to subscribers.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&PushMessage {
            currency: &self.base,
            rates: &self.rates,
            fetched_at: self.fetched_at,
        })
    }
}

/// Wire shape of a subscriber push: same layout as the upstream `data` object.
#[derive(Serialize)]
struct PushMessage<'a> {
    currency: &'a Currency,
    rates: &'a BTreeMap<Currency, Decimal>,
    fetched_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn make_snapshot() -> ExchangeRateSnapshot {
        let mut rates = BTreeMap::new();
        rates.insert(Currency::btc(), dec!(0.00004));
        rates.insert(Currency::eur(), dec!(0.92));
        ExchangeRateSnapshot::new(Currency::usd(), rates, "TEST")
    }

    #[test]
    fn test_rate_lookup() {
        let snapshot = make_snapshot();

        assert_eq!(snapshot.rate(&Currency::btc()), Some(dec!(0.00004)));
        assert_eq!(snapshot.rate(&Currency::new("DOGE")), None);
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn test_push_message_shape() {
        let snapshot = make_snapshot();
        let json: serde_json::Value = serde_json::from_str(&snapshot.to_json().unwrap()).unwrap();

        assert_eq!(json["currency"], "USD");
        assert_eq!(json["rates"]["BTC"], "0.00004");
        assert_eq!(json["rates"]["EUR"], "0.92");
        assert!(json.get("fetched_at").is_some());
    }
}

//! Conversion between the base currency and a quoted currency.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tradewallet_common::{Currency, Money};

/// One priced exchange of `paid` for `received`.
///
/// `rate` is always expressed as units of the quoted currency per one unit
/// of the base currency, exactly as it appears in the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversion {
    /// Amount leaving the owner's wallets.
    pub paid: Money,
    /// Amount entering the owner's wallets.
    pub received: Money,
    /// Quoted-per-base rate used.
    pub rate: Decimal,
    /// When the conversion was priced.
    pub priced_at: DateTime<Utc>,
}

impl Conversion {
    /// Price buying `target` with the base currency: pays `target / rate` base.
    ///
    /// Returns `None` for a non-positive rate or on overflow.
    pub fn buy(target: Money, base: Currency, rate: Decimal) -> Option<Self> {
        if rate <= Decimal::ZERO {
            return None;
        }
        let cost = target.value.checked_div(rate)?;
        Some(Self {
            paid: Money::new(cost, base),
            received: target,
            rate,
            priced_at: Utc::now(),
        })
    }

    /// Price selling `source` for the base currency: receives `source / rate` base.
    ///
    /// Returns `None` for a non-positive rate or on overflow.
    pub fn sell(source: Money, base: Currency, rate: Decimal) -> Option<Self> {
        if rate <= Decimal::ZERO {
            return None;
        }
        let proceeds = source.value.checked_div(rate)?;
        Some(Self {
            paid: source,
            received: Money::new(proceeds, base),
            rate,
            priced_at: Utc::now(),
        })
    }
}

//! Deposits, withdrawals and currency trades against the ledger.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, instrument};
use tradewallet_common::{Currency, Money, Result, UserId, WalletError, WalletKey};
use tradewallet_fx::{Conversion, ExchangeRateSnapshot, RateCache};
use tradewallet_ledger::{
    LedgerEngine, LedgerError, LedgerResult, Transaction, TransactionBatch, TransactionType, Wallet,
};

use crate::locks::WalletLocks;

/// Why an operation was declined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InsufficientBalance {
    /// Currency that was short.
    pub currency: Currency,
    /// Amount the operation required.
    pub needed: Decimal,
    /// Balance at the time of the check.
    pub balance: Decimal,
}

/// Result of a balance-changing operation.
///
/// A decline is a successful response with a false status, not an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Outcome<T> {
    Completed(T),
    Declined(InsufficientBalance),
}

impl<T> Outcome<T> {
    /// Status flag reported to clients.
    pub fn status(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }

    pub fn completed(self) -> Option<T> {
        match self {
            Outcome::Completed(value) => Some(value),
            Outcome::Declined(_) => None,
        }
    }

    pub fn declined(&self) -> Option<&InsufficientBalance> {
        match self {
            Outcome::Completed(_) => None,
            Outcome::Declined(reason) => Some(reason),
        }
    }
}

/// A single-wallet change and the resulting balance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Receipt {
    pub transaction: Transaction,
    pub balance: Money,
}

/// Both legs of a trade.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeReceipt {
    pub conversion: Conversion,
    /// Leg taken from the paying wallet.
    pub debit: Transaction,
    /// Leg added to the receiving wallet.
    pub credit: Transaction,
}

/// Trading orchestrator.
///
/// Overdraft prevention lives here: balances are checked under the
/// per-wallet lock and committed with the version that was checked.
pub struct TradingService {
    ledger: Arc<LedgerEngine>,
    rates: Arc<RateCache>,
    locks: Arc<WalletLocks>,
    base: Currency,
    max_attempts: u32,
}

impl TradingService {
    pub fn new(
        ledger: Arc<LedgerEngine>,
        rates: Arc<RateCache>,
        locks: Arc<WalletLocks>,
        base: Currency,
        max_attempts: u32,
    ) -> Self {
        Self {
            ledger,
            rates,
            locks,
            base,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn base_currency(&self) -> &Currency {
        &self.base
    }

    pub fn ledger(&self) -> &Arc<LedgerEngine> {
        &self.ledger
    }

    /// Credit the owner's base wallet.
    #[instrument(skip_all, fields(owner = %owner, %amount))]
    pub async fn deposit(&self, owner: UserId, amount: Decimal) -> Result<Receipt> {
        validate_amount(amount)?;
        let _guard = self.locks.acquire(&[self.key(owner, &self.base)]).await;

        let receipt = self
            .retrying("deposit", move || self.try_deposit(owner, amount))
            .await?;

        info!(balance = %receipt.balance, "Deposit completed");
        Ok(receipt)
    }

    /// Debit the owner's base wallet; declined beyond the balance.
    #[instrument(skip_all, fields(owner = %owner, %amount))]
    pub async fn withdraw(&self, owner: UserId, amount: Decimal) -> Result<Outcome<Receipt>> {
        validate_amount(amount)?;
        let _guard = self.locks.acquire(&[self.key(owner, &self.base)]).await;

        let outcome = self
            .retrying("withdraw", move || self.try_withdraw(owner, amount))
            .await?;

        log_outcome("withdraw", &outcome);
        Ok(outcome)
    }

    /// Buy `amount` of `target`, paying with the base currency.
    #[instrument(skip_all, fields(owner = %owner, currency = %target, %amount))]
    pub async fn buy(
        &self,
        owner: UserId,
        target: &Currency,
        amount: Decimal,
    ) -> Result<Outcome<TradeReceipt>> {
        validate_amount(amount)?;
        let rate = self.rate_for(target)?;
        let conversion = priced(
            Conversion::buy(Money::new(amount, target.clone()), self.base.clone(), rate),
            amount,
            target,
        )?;
        let conversion = &conversion;

        let _guard = self
            .locks
            .acquire(&[self.key(owner, &self.base), self.key(owner, target)])
            .await;

        let outcome = self
            .retrying("buy", move || self.try_buy(owner, conversion))
            .await?;

        log_outcome("buy", &outcome);
        Ok(outcome)
    }

    /// Sell `amount` of `source` for the base currency.
    #[instrument(skip_all, fields(owner = %owner, currency = %source, %amount))]
    pub async fn sell(
        &self,
        owner: UserId,
        source: &Currency,
        amount: Decimal,
    ) -> Result<Outcome<TradeReceipt>> {
        validate_amount(amount)?;
        let rate = self.rate_for(source)?;
        let conversion = priced(
            Conversion::sell(Money::new(amount, source.clone()), self.base.clone(), rate),
            amount,
            source,
        )?;
        let conversion = &conversion;

        let _guard = self
            .locks
            .acquire(&[self.key(owner, source), self.key(owner, &self.base)])
            .await;

        let outcome = self
            .retrying("sell", move || self.try_sell(owner, conversion))
            .await?;

        log_outcome("sell", &outcome);
        Ok(outcome)
    }

    /// Balance per currency for every wallet the owner has.
    pub async fn balances(&self, owner: UserId) -> Result<BTreeMap<Currency, Decimal>> {
        let wallets = self.ledger.store().list_wallets(owner).await?;
        Ok(wallets.into_iter().map(|w| (w.currency, w.balance)).collect())
    }

    /// Current rate snapshot.
    pub fn rates(&self) -> Result<Arc<ExchangeRateSnapshot>> {
        self.rates.get_rates().ok_or(WalletError::RatesNotReady)
    }

    /// Transaction history of one wallet; empty if it was never created.
    pub async fn history(&self, owner: UserId, currency: &Currency) -> Result<Vec<Transaction>> {
        match self.ledger.store().get_wallet(owner, currency).await? {
            Some(wallet) => Ok(self.ledger.history(wallet.id).await?),
            None => Ok(Vec::new()),
        }
    }

    async fn try_deposit(&self, owner: UserId, amount: Decimal) -> LedgerResult<Receipt> {
        let wallet = self.wallet(owner, &self.base).await?;
        headroom(&wallet, amount)?;
        let tx = self
            .ledger
            .apply_transaction(&wallet, TransactionType::Deposit, amount)
            .await?;
        Ok(receipt(tx, &self.base))
    }

    async fn try_withdraw(&self, owner: UserId, amount: Decimal) -> LedgerResult<Outcome<Receipt>> {
        let wallet = self.wallet(owner, &self.base).await?;
        if let Some(declined) = shortfall(&wallet, amount) {
            return Ok(declined);
        }
        let tx = self
            .ledger
            .apply_transaction(&wallet, TransactionType::Withdraw, -amount)
            .await?;
        Ok(Outcome::Completed(receipt(tx, &self.base)))
    }

    /// Sell leg on the base wallet first, then the buy leg.
    async fn try_buy(
        &self,
        owner: UserId,
        conversion: &Conversion,
    ) -> LedgerResult<Outcome<TradeReceipt>> {
        let base_wallet = self.wallet(owner, &self.base).await?;
        if let Some(declined) = shortfall(&base_wallet, conversion.paid.value) {
            return Ok(declined);
        }
        let target_wallet = self.wallet(owner, &conversion.received.currency).await?;
        headroom(&target_wallet, conversion.received.value)?;

        let mut batch = TransactionBatch::new();
        batch.add_entry(&base_wallet, TransactionType::Sell, -conversion.paid.value);
        batch.add_entry(&target_wallet, TransactionType::Buy, conversion.received.value);
        self.commit_trade(conversion, &batch).await
    }

    /// A missing source wallet is declined without creating it.
    async fn try_sell(
        &self,
        owner: UserId,
        conversion: &Conversion,
    ) -> LedgerResult<Outcome<TradeReceipt>> {
        let source = &conversion.paid;
        let source_wallet = match self.ledger.store().get_wallet(owner, &source.currency).await? {
            Some(wallet) => wallet,
            None => {
                return Ok(Outcome::Declined(InsufficientBalance {
                    currency: source.currency.clone(),
                    needed: source.value,
                    balance: Decimal::ZERO,
                }))
            }
        };
        if let Some(declined) = shortfall(&source_wallet, source.value) {
            return Ok(declined);
        }
        let base_wallet = self.wallet(owner, &self.base).await?;
        headroom(&base_wallet, conversion.received.value)?;

        let mut batch = TransactionBatch::new();
        batch.add_entry(&source_wallet, TransactionType::Sell, -source.value);
        batch.add_entry(&base_wallet, TransactionType::Buy, conversion.received.value);
        self.commit_trade(conversion, &batch).await
    }

    fn key(&self, owner: UserId, currency: &Currency) -> WalletKey {
        WalletKey::new(owner, currency.clone())
    }

    async fn wallet(&self, owner: UserId, currency: &Currency) -> LedgerResult<Wallet> {
        self.ledger.store().get_or_create_wallet(owner, currency).await
    }

    fn rate_for(&self, currency: &Currency) -> Result<Decimal> {
        if !currency.is_valid() {
            return Err(WalletError::InvalidCurrency(currency.to_string()));
        }
        if *currency == self.base {
            return Err(WalletError::InvalidCurrency(format!(
                "{} is the base currency",
                currency
            )));
        }

        let snapshot = self.rates.get_rates().ok_or(WalletError::RatesNotReady)?;
        snapshot
            .rate(currency)
            .ok_or_else(|| WalletError::CurrencyNotFound(currency.clone()))
    }

    async fn commit_trade(
        &self,
        conversion: &Conversion,
        batch: &TransactionBatch,
    ) -> LedgerResult<Outcome<TradeReceipt>> {
        let mut legs = self.ledger.apply_batch(batch).await?.into_iter();
        match (legs.next(), legs.next()) {
            (Some(debit), Some(credit)) => Ok(Outcome::Completed(TradeReceipt {
                conversion: conversion.clone(),
                debit,
                credit,
            })),
            _ => Err(LedgerError::Storage(
                "trade commit returned fewer than two legs".to_string(),
            )),
        }
    }

    /// Run `attempt` again while it fails with a retryable ledger error.
    async fn retrying<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = LedgerResult<T>>,
    {
        let mut tries = 1;
        loop {
            match attempt().await {
                Err(e) if e.is_retryable() && tries < self.max_attempts => {
                    debug!(operation, attempt = tries, error = %e, "Retrying after conflict");
                    tries += 1;
                }
                result => return result.map_err(WalletError::from),
            }
        }
    }
}

fn validate_amount(amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(WalletError::InvalidAmount(format!(
            "amount must be positive, got {}",
            amount
        )));
    }
    Ok(())
}

/// Refuse a trade that cannot be priced or where either side rounds to zero.
fn priced(conversion: Option<Conversion>, amount: Decimal, currency: &Currency) -> Result<Conversion> {
    let conversion = conversion.ok_or_else(|| {
        WalletError::InvalidAmount(format!("cannot price {} {}", amount, currency))
    })?;
    if conversion.paid.value.is_zero() || conversion.received.value.is_zero() {
        return Err(WalletError::InvalidAmount(format!(
            "{} {} is worth less than the smallest representable unit",
            amount, currency
        )));
    }
    Ok(conversion)
}

/// Refuse a credit the wallet balance cannot hold, before anything is written.
fn headroom(wallet: &Wallet, credit: Decimal) -> LedgerResult<()> {
    match wallet.balance.checked_add(credit) {
        Some(_) => Ok(()),
        None => Err(LedgerError::BalanceOverflow {
            wallet_id: wallet.id,
            change: credit,
        }),
    }
}

fn shortfall<T>(wallet: &Wallet, needed: Decimal) -> Option<Outcome<T>> {
    if wallet.has_sufficient_funds(needed) {
        return None;
    }
    Some(Outcome::Declined(InsufficientBalance {
        currency: wallet.currency.clone(),
        needed,
        balance: wallet.balance,
    }))
}

fn receipt(transaction: Transaction, currency: &Currency) -> Receipt {
    let balance = Money::new(transaction.balance, currency.clone());
    Receipt {
        transaction,
        balance,
    }
}

fn log_outcome<T>(operation: &str, outcome: &Outcome<T>) {
    match outcome {
        Outcome::Completed(_) => info!(operation, "Operation completed"),
        Outcome::Declined(reason) => info!(
            operation,
            currency = %reason.currency,
            needed = %reason.needed,
            balance = %reason.balance,
            "Operation declined: insufficient balance"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Barrier;
    use tradewallet_common::{TransactionId, WalletId};
    use tradewallet_ledger::{InMemoryWalletStore, StoreFault, WalletStore, WriteMode};

    /// Yields on every read and commit so concurrent callers interleave.
    /// `hold_commits(n)` parks the next `n` commits until all of them arrive.
    #[derive(Default)]
    struct InterleavingStore {
        inner: InMemoryWalletStore,
        gate: Mutex<Option<(Arc<Barrier>, usize)>>,
        conflicts: AtomicUsize,
    }

    impl InterleavingStore {
        fn hold_commits(&self, n: usize) {
            *self.gate.lock() = Some((Arc::new(Barrier::new(n)), n));
        }

        fn conflicts(&self) -> usize {
            self.conflicts.load(Ordering::SeqCst)
        }

        fn take_gate(&self) -> Option<Arc<Barrier>> {
            let mut gate = self.gate.lock();
            let (barrier, remaining) = gate.take()?;
            if remaining > 1 {
                *gate = Some((barrier.clone(), remaining - 1));
            }
            Some(barrier)
        }
    }

    #[async_trait]
    impl WalletStore for InterleavingStore {
        async fn get_wallet(&self, owner: UserId, currency: &Currency) -> LedgerResult<Option<Wallet>> {
            tokio::task::yield_now().await;
            self.inner.get_wallet(owner, currency).await
        }

        async fn get_wallet_by_id(&self, id: WalletId) -> LedgerResult<Option<Wallet>> {
            self.inner.get_wallet_by_id(id).await
        }

        async fn get_or_create_wallet(&self, owner: UserId, currency: &Currency) -> LedgerResult<Wallet> {
            tokio::task::yield_now().await;
            self.inner.get_or_create_wallet(owner, currency).await
        }

        async fn list_wallets(&self, owner: UserId) -> LedgerResult<Vec<Wallet>> {
            self.inner.list_wallets(owner).await
        }

        async fn save_wallet(&self, wallet: &Wallet) -> LedgerResult<Wallet> {
            self.inner.save_wallet(wallet).await
        }

        async fn create_transaction(&self, tx: &Transaction) -> LedgerResult<()> {
            self.inner.create_transaction(tx).await
        }

        async fn remove_transaction(&self, id: TransactionId) -> LedgerResult<bool> {
            self.inner.remove_transaction(id).await
        }

        async fn transactions(&self, wallet_id: WalletId) -> LedgerResult<Vec<Transaction>> {
            self.inner.transactions(wallet_id).await
        }

        async fn commit(&self, batch: &TransactionBatch) -> LedgerResult<Vec<Transaction>> {
            match self.take_gate() {
                Some(barrier) => {
                    barrier.wait().await;
                }
                None => tokio::task::yield_now().await,
            }

            let result = self.inner.commit(batch).await;
            if let Err(LedgerError::WalletConflict { .. }) = &result {
                self.conflicts.fetch_add(1, Ordering::SeqCst);
            }
            result
        }
    }

    fn rate_cache() -> Arc<RateCache> {
        let cache = Arc::new(RateCache::new());
        let mut rates = BTreeMap::new();
        rates.insert(Currency::btc(), dec!(0.00004));
        rates.insert(Currency::eth(), dec!(0.0005));
        rates.insert(Currency::new("JPY"), dec!(150));
        cache.replace(ExchangeRateSnapshot::new(Currency::usd(), rates, "TEST"));
        cache
    }

    fn trading_on(store: Arc<dyn WalletStore>, mode: WriteMode) -> TradingService {
        TradingService::new(
            Arc::new(LedgerEngine::new(store, mode)),
            rate_cache(),
            Arc::new(WalletLocks::new()),
            Currency::usd(),
            5,
        )
    }

    fn setup() -> (Arc<InMemoryWalletStore>, TradingService) {
        let store = Arc::new(InMemoryWalletStore::new());
        let trading = trading_on(store.clone(), WriteMode::Atomic);
        (store, trading)
    }

    async fn balance(trading: &TradingService, owner: UserId, currency: Currency) -> Decimal {
        trading
            .balances(owner)
            .await
            .unwrap()
            .get(&currency)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    #[tokio::test]
    async fn test_walkthrough() {
        let (_, trading) = setup();
        let owner = UserId::new(1);

        let receipt = trading.deposit(owner, dec!(100)).await.unwrap();
        assert_eq!(receipt.balance, Money::new(dec!(100), Currency::usd()));
        let history = trading.history(owner, &Currency::usd()).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, TransactionType::Deposit);
        assert_eq!(history[0].change, dec!(100));

        let declined = trading.buy(owner, &Currency::btc(), dec!(0.01)).await.unwrap();
        assert!(!declined.status());
        assert_eq!(
            declined.declined(),
            Some(&InsufficientBalance {
                currency: Currency::usd(),
                needed: dec!(250),
                balance: dec!(100),
            })
        );
        assert_eq!(balance(&trading, owner, Currency::usd()).await, dec!(100));

        trading.deposit(owner, dec!(300)).await.unwrap();
        let trade = trading
            .buy(owner, &Currency::btc(), dec!(0.01))
            .await
            .unwrap()
            .completed()
            .unwrap();

        assert_eq!(trade.debit.kind, TransactionType::Sell);
        assert_eq!(trade.debit.change, dec!(-250));
        assert_eq!(trade.credit.kind, TransactionType::Buy);
        assert_eq!(trade.credit.change, dec!(0.01));
        assert_eq!(balance(&trading, owner, Currency::usd()).await, dec!(150));
        assert_eq!(balance(&trading, owner, Currency::btc()).await, dec!(0.01));
        assert_eq!(trading.history(owner, &Currency::usd()).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_buy_then_sell_round_trip() {
        let (_, trading) = setup();
        let owner = UserId::new(2);
        trading.deposit(owner, dec!(1000)).await.unwrap();

        trading.buy(owner, &Currency::eth(), dec!(0.37)).await.unwrap();
        let sold = trading.sell(owner, &Currency::eth(), dec!(0.37)).await.unwrap();

        assert!(sold.status());
        assert_eq!(balance(&trading, owner, Currency::usd()).await, dec!(1000));
        assert_eq!(balance(&trading, owner, Currency::eth()).await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_oversized_sell_is_declined_without_mutation() {
        let (store, trading) = setup();
        let owner = UserId::new(3);
        trading.deposit(owner, dec!(400)).await.unwrap();
        trading.buy(owner, &Currency::btc(), dec!(0.01)).await.unwrap();
        let transactions = store.transaction_count();

        let outcome = trading.sell(owner, &Currency::btc(), dec!(0.02)).await.unwrap();

        let reason = outcome.declined().unwrap();
        assert_eq!(reason.needed, dec!(0.02));
        assert_eq!(reason.balance, dec!(0.01));
        assert_eq!(store.transaction_count(), transactions);
        assert_eq!(balance(&trading, owner, Currency::usd()).await, dec!(150));
    }

    #[tokio::test]
    async fn test_sell_without_wallet_is_declined() {
        let (store, trading) = setup();

        let outcome = trading.sell(UserId::new(4), &Currency::btc(), dec!(1)).await.unwrap();

        assert_eq!(outcome.declined().unwrap().balance, Decimal::ZERO);
        assert_eq!(store.wallet_count(), 0);
    }

    #[tokio::test]
    async fn test_withdraw() {
        let (_, trading) = setup();
        let owner = UserId::new(5);
        trading.deposit(owner, dec!(50)).await.unwrap();

        assert!(!trading.withdraw(owner, dec!(60)).await.unwrap().status());
        let receipt = trading.withdraw(owner, dec!(20)).await.unwrap().completed().unwrap();

        assert_eq!(receipt.transaction.kind, TransactionType::Withdraw);
        assert_eq!(receipt.transaction.change, dec!(-20));
        assert_eq!(receipt.balance.value, dec!(30));
    }

    #[tokio::test]
    async fn test_input_errors() {
        let (_, trading) = setup();
        let owner = UserId::new(6);

        assert!(matches!(
            trading.deposit(owner, Decimal::ZERO).await,
            Err(WalletError::InvalidAmount(_))
        ));
        assert!(matches!(
            trading.buy(owner, &Currency::btc(), dec!(-1)).await,
            Err(WalletError::InvalidAmount(_))
        ));
        assert!(matches!(
            trading.buy(owner, &Currency::new("XRP"), dec!(1)).await,
            Err(WalletError::CurrencyNotFound(_))
        ));
        assert!(matches!(
            trading.sell(owner, &Currency::usd(), dec!(1)).await,
            Err(WalletError::InvalidCurrency(_))
        ));
        assert!(matches!(
            trading.buy(owner, &Currency::new("B$"), dec!(1)).await,
            Err(WalletError::InvalidCurrency(_))
        ));
    }

    #[tokio::test]
    async fn test_rates_not_ready() {
        let store = Arc::new(InMemoryWalletStore::new());
        let trading = TradingService::new(
            Arc::new(LedgerEngine::new(store, WriteMode::Atomic)),
            Arc::new(RateCache::new()),
            Arc::new(WalletLocks::new()),
            Currency::usd(),
            5,
        );

        assert!(matches!(trading.rates(), Err(WalletError::RatesNotReady)));
        let err = trading.buy(UserId::new(7), &Currency::btc(), dec!(1)).await.unwrap_err();
        assert!(matches!(err, WalletError::RatesNotReady));
        assert!(err.is_retryable());
    }

    async fn buys(
        instances: &[Arc<TradingService>],
        owner: UserId,
        count: usize,
    ) -> (usize, usize, Vec<WalletError>) {
        let mut handles = Vec::new();
        for i in 0..count {
            let trading = Arc::clone(&instances[i % instances.len()]);
            // 0.004 BTC costs 100 USD.
            handles.push(tokio::spawn(async move {
                trading.buy(owner, &Currency::btc(), dec!(0.004)).await
            }));
        }

        let (mut completed, mut declined, mut errors) = (0, 0, Vec::new());
        for handle in handles {
            let result = tokio::time::timeout(Duration::from_secs(10), handle)
                .await
                .expect("buy did not finish")
                .unwrap();
            match result {
                Ok(outcome) if outcome.status() => completed += 1,
                Ok(_) => declined += 1,
                Err(e) => errors.push(e),
            }
        }
        (completed, declined, errors)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_buys_never_overdraw() {
        let store = Arc::new(InterleavingStore::default());
        let trading = Arc::new(trading_on(store.clone(), WriteMode::Atomic));
        let owner = UserId::new(8);
        trading.deposit(owner, dec!(1000)).await.unwrap();

        let (completed, declined, errors) = buys(&[Arc::clone(&trading)], owner, 25).await;

        assert_eq!(completed, 10);
        assert_eq!(declined, 15);
        assert!(errors.is_empty(), "{:?}", errors);
        // One lock table serializes every buy before it reaches the store.
        assert_eq!(store.conflicts(), 0);
        assert_eq!(balance(&trading, owner, Currency::usd()).await, Decimal::ZERO);
        assert_eq!(balance(&trading, owner, Currency::btc()).await, dec!(0.04));
        let usd = store.get_wallet(owner, &Currency::usd()).await.unwrap().unwrap();
        assert!(trading.ledger().verify_wallet(usd.id).await.unwrap().is_consistent());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_independent_instances_never_overdraw() {
        // Two orchestrators with separate lock tables share one store, as two
        // processes would share one database.
        let store = Arc::new(InterleavingStore::default());
        let a = Arc::new(trading_on(store.clone(), WriteMode::Atomic));
        let b = Arc::new(trading_on(store.clone(), WriteMode::Atomic));
        let owner = UserId::new(9);
        a.deposit(owner, dec!(500)).await.unwrap();
        // The first buy of each instance commits against the same version.
        store.hold_commits(2);

        let (completed, declined, errors) = buys(&[a.clone(), b], owner, 20).await;

        assert!(store.conflicts() >= 1);
        assert_eq!(completed, 5);
        assert_eq!(completed + declined + errors.len(), 20);
        assert!(errors.iter().all(|e| matches!(e, WalletError::Conflict(_))), "{:?}", errors);
        assert_eq!(balance(&a, owner, Currency::usd()).await, Decimal::ZERO);
        assert_eq!(balance(&a, owner, Currency::btc()).await, dec!(0.02));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_conflicting_buy_rereads_and_declines() {
        let store = Arc::new(InterleavingStore::default());
        let a = Arc::new(trading_on(store.clone(), WriteMode::Atomic));
        let b = Arc::new(trading_on(store.clone(), WriteMode::Atomic));
        let owner = UserId::new(12);
        a.deposit(owner, dec!(100)).await.unwrap();
        store.hold_commits(2);

        let (completed, declined, errors) = buys(&[a.clone(), b], owner, 2).await;

        assert!(errors.is_empty(), "{:?}", errors);
        assert_eq!((completed, declined), (1, 1));
        assert_eq!(store.conflicts(), 1);
        assert_eq!(balance(&a, owner, Currency::usd()).await, Decimal::ZERO);
        assert_eq!(a.history(owner, &Currency::usd()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_trade_that_rounds_to_nothing_is_refused() {
        let (store, trading) = setup();
        let owner = UserId::new(13);
        trading.deposit(owner, dec!(100)).await.unwrap();
        let dust = Decimal::new(1, 28);

        // At 150 JPY per USD both the cost of buying and the proceeds of
        // selling one smallest unit of JPY round to zero USD.
        assert!(matches!(
            trading.buy(owner, &Currency::new("JPY"), dust).await,
            Err(WalletError::InvalidAmount(_))
        ));
        assert!(matches!(
            trading.sell(owner, &Currency::new("JPY"), dust).await,
            Err(WalletError::InvalidAmount(_))
        ));
        assert_eq!(store.transaction_count(), 1);
        assert_eq!(balance(&trading, owner, Currency::usd()).await, dec!(100));

        let trade = trading
            .buy(owner, &Currency::new("JPY"), dec!(150))
            .await
            .unwrap()
            .completed()
            .unwrap();
        assert_eq!(trade.conversion.paid.value, dec!(1));
    }

    #[tokio::test]
    async fn test_deposit_beyond_representable_balance() {
        let (store, trading) = setup();
        let owner = UserId::new(14);
        trading.deposit(owner, Decimal::MAX).await.unwrap();

        let err = trading.deposit(owner, Decimal::MAX).await.unwrap_err();

        assert!(matches!(err, WalletError::InvalidAmount(_)));
        assert!(!err.is_internal());
        assert_eq!(store.transaction_count(), 1);
        assert_eq!(balance(&trading, owner, Currency::usd()).await, Decimal::MAX);
    }

    #[tokio::test]
    async fn test_sell_proceeds_beyond_representable_balance() {
        for mode in [WriteMode::Atomic, WriteMode::Compensating] {
            let store = Arc::new(InMemoryWalletStore::new());
            let trading = trading_on(store.clone(), mode);
            let owner = UserId::new(15);
            trading.deposit(owner, dec!(1000)).await.unwrap();
            trading.buy(owner, &Currency::eth(), dec!(0.5)).await.unwrap();
            trading.deposit(owner, Decimal::MAX).await.unwrap();
            let transactions = store.transaction_count();

            let err = trading.sell(owner, &Currency::eth(), dec!(0.5)).await.unwrap_err();

            assert!(matches!(err, WalletError::InvalidAmount(_)), "{}: {:?}", mode, err);
            assert_eq!(store.transaction_count(), transactions);
            assert_eq!(balance(&trading, owner, Currency::eth()).await, dec!(0.5));
            assert_eq!(balance(&trading, owner, Currency::usd()).await, Decimal::MAX);
        }
    }

    #[tokio::test]
    async fn test_failed_trade_leaves_both_wallets_unchanged() {
        let (store, trading) = setup();
        let owner = UserId::new(10);
        trading.deposit(owner, dec!(400)).await.unwrap();
        store.inject_fault(StoreFault::FailNextCommit);

        let err = trading.buy(owner, &Currency::btc(), dec!(0.01)).await.unwrap_err();

        assert!(err.is_internal());
        assert_eq!(err.public_message(), "Internal server error");
        assert_eq!(balance(&trading, owner, Currency::usd()).await, dec!(400));
        assert_eq!(balance(&trading, owner, Currency::btc()).await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_compensating_mode_trade() {
        let store = Arc::new(InMemoryWalletStore::new());
        let trading = trading_on(store.clone(), WriteMode::Compensating);
        let owner = UserId::new(11);
        trading.deposit(owner, dec!(400)).await.unwrap();

        store.inject_fault(StoreFault::FailNextSave);
        assert!(trading.buy(owner, &Currency::btc(), dec!(0.01)).await.is_err());
        assert_eq!(balance(&trading, owner, Currency::usd()).await, dec!(400));

        let trade = trading.buy(owner, &Currency::btc(), dec!(0.01)).await.unwrap();
        assert!(trade.status());
        assert_eq!(balance(&trading, owner, Currency::usd()).await, dec!(150));
    }
}

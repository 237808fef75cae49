//! Postgres-backed wallet store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};
use tradewallet_common::{Currency, TransactionId, UserId, WalletId};

use crate::error::{LedgerError, LedgerResult};
use crate::store::WalletStore;
use crate::transaction::{Transaction, TransactionBatch, TransactionType};
use crate::wallet::Wallet;

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS wallets (
        id UUID PRIMARY KEY,
        owner_id BIGINT NOT NULL,
        currency VARCHAR(10) NOT NULL,
        balance NUMERIC NOT NULL DEFAULT 0,
        version BIGINT NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        UNIQUE (owner_id, currency)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS transactions (
        id UUID PRIMARY KEY,
        wallet_id UUID NOT NULL REFERENCES wallets (id),
        type SMALLINT NOT NULL,
        change NUMERIC NOT NULL,
        balance NUMERIC NOT NULL,
        sequence BIGINT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        UNIQUE (wallet_id, sequence)
    )
    ",
];

const WALLET_COLUMNS: &str = "id, owner_id, currency, balance, version, created_at, updated_at";
const TRANSACTION_COLUMNS: &str = "id, wallet_id, type, change, balance, sequence, created_at";

/// Wallet store on a Postgres pool.
///
/// Uniqueness of (owner, currency) is enforced by the `wallets` unique
/// constraint; balance writes are `UPDATE ... WHERE version = $n`.
#[derive(Debug, Clone)]
pub struct PgWalletStore {
    pool: PgPool,
}

impl PgWalletStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> LedgerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        info!(max_connections, "Connected to wallet database");
        Ok(Self::new(pool))
    }

    /// Create tables if missing.
    pub async fn migrate(&self) -> LedgerResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Wallet schema ready");
        Ok(())
    }

    async fn fetch_wallet(&self, id: WalletId) -> LedgerResult<Option<Wallet>> {
        let row = sqlx::query(&format!("SELECT {WALLET_COLUMNS} FROM wallets WHERE id = $1"))
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(wallet_from_row).transpose()
    }
}

fn wallet_from_row(row: &PgRow) -> LedgerResult<Wallet> {
    Ok(Wallet {
        id: WalletId::from_uuid(row.try_get("id")?),
        owner: UserId::new(row.try_get("owner_id")?),
        currency: Currency::new(row.try_get::<String, _>("currency")?),
        balance: row.try_get("balance")?,
        version: row.try_get::<i64, _>("version")? as u64,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn transaction_from_row(row: &PgRow) -> LedgerResult<Transaction> {
    Ok(Transaction {
        id: TransactionId::from_uuid(row.try_get("id")?),
        wallet_id: WalletId::from_uuid(row.try_get("wallet_id")?),
        kind: TransactionType::try_from(row.try_get::<i16, _>("type")?)?,
        change: row.try_get("change")?,
        balance: row.try_get("balance")?,
        sequence: row.try_get::<i64, _>("sequence")? as u64,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl WalletStore for PgWalletStore {
    async fn get_wallet(&self, owner: UserId, currency: &Currency) -> LedgerResult<Option<Wallet>> {
        let row = sqlx::query(&format!(
            "SELECT {WALLET_COLUMNS} FROM wallets WHERE owner_id = $1 AND currency = $2"
        ))
        .bind(owner.as_i64())
        .bind(currency.code())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(wallet_from_row).transpose()
    }

    async fn get_wallet_by_id(&self, id: WalletId) -> LedgerResult<Option<Wallet>> {
        self.fetch_wallet(id).await
    }

    async fn get_or_create_wallet(&self, owner: UserId, currency: &Currency) -> LedgerResult<Wallet> {
        let candidate = Wallet::new(owner, currency.clone());

        sqlx::query(
            r"
            INSERT INTO wallets (id, owner_id, currency, balance, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 0, $5, $5)
            ON CONFLICT (owner_id, currency) DO NOTHING
            ",
        )
        .bind(*candidate.id.as_uuid())
        .bind(owner.as_i64())
        .bind(currency.code())
        .bind(candidate.balance)
        .bind(candidate.created_at)
        .execute(&self.pool)
        .await?;

        self.get_wallet(owner, currency)
            .await?
            .ok_or_else(|| LedgerError::Storage(format!("wallet {}:{} vanished after insert", owner, currency)))
    }

    async fn list_wallets(&self, owner: UserId) -> LedgerResult<Vec<Wallet>> {
        let rows = sqlx::query(&format!(
            "SELECT {WALLET_COLUMNS} FROM wallets WHERE owner_id = $1 ORDER BY currency"
        ))
        .bind(owner.as_i64())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(wallet_from_row).collect()
    }

    async fn save_wallet(&self, wallet: &Wallet) -> LedgerResult<Wallet> {
        let row = sqlx::query(&format!(
            r"
            UPDATE wallets SET balance = $1, version = version + 1, updated_at = $2
            WHERE id = $3 AND version = $4
            RETURNING {WALLET_COLUMNS}
            "
        ))
        .bind(wallet.balance)
        .bind(Utc::now())
        .bind(*wallet.id.as_uuid())
        .bind(wallet.version as i64)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return wallet_from_row(&row);
        }

        match self.fetch_wallet(wallet.id).await? {
            None => Err(LedgerError::InvalidWallet(wallet.id.to_string())),
            Some(current) => Err(LedgerError::WalletConflict {
                wallet_id: wallet.id,
                expected: wallet.version,
                actual: current.version,
            }),
        }
    }

    async fn create_transaction(&self, tx: &Transaction) -> LedgerResult<()> {
        let current = self
            .fetch_wallet(tx.wallet_id)
            .await?
            .ok_or_else(|| LedgerError::InvalidWallet(tx.wallet_id.to_string()))?;
        check_sequence(tx, &current)?;

        // A writer racing past the check above trips the (wallet_id, sequence)
        // constraint, which maps to a retryable contention error.
        insert_transaction(tx).execute(&self.pool).await?;
        Ok(())
    }

    async fn remove_transaction(&self, id: TransactionId) -> LedgerResult<bool> {
        let result = sqlx::query("DELETE FROM transactions WHERE id = $1")
            .bind(*id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn transactions(&self, wallet_id: WalletId) -> LedgerResult<Vec<Transaction>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE wallet_id = $1 ORDER BY sequence"
        ))
        .bind(*wallet_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(transaction_from_row).collect()
    }

    async fn commit(&self, batch: &TransactionBatch) -> LedgerResult<Vec<Transaction>> {
        let mut db = self.pool.begin().await?;

        // Lock every wallet up front in id order so opposite trades on the
        // same pair cannot deadlock.
        let ids: Vec<_> = batch.wallet_ids().iter().map(|id| *id.as_uuid()).collect();
        let rows = sqlx::query(&format!(
            "SELECT {WALLET_COLUMNS} FROM wallets WHERE id = ANY($1) ORDER BY id FOR UPDATE"
        ))
        .bind(ids)
        .fetch_all(&mut *db)
        .await?;

        let mut locked: HashMap<WalletId, Wallet> = HashMap::with_capacity(rows.len());
        for row in &rows {
            let wallet = wallet_from_row(row)?;
            locked.insert(wallet.id, wallet);
        }

        let mut working: HashMap<WalletId, Wallet> = HashMap::new();
        let mut applied = Vec::with_capacity(batch.len());

        for entry in batch.entries() {
            let current = match working.get(&entry.wallet.id) {
                Some(wallet) => wallet.clone(),
                None => {
                    let stored = locked
                        .remove(&entry.wallet.id)
                        .ok_or_else(|| LedgerError::InvalidWallet(entry.wallet.id.to_string()))?;

                    if stored.version != entry.wallet.version {
                        return Err(LedgerError::WalletConflict {
                            wallet_id: stored.id,
                            expected: entry.wallet.version,
                            actual: stored.version,
                        });
                    }
                    stored
                }
            };

            let tx = Transaction::next(&current, entry.kind, entry.change)?;
            insert_transaction(&tx).execute(&mut *db).await?;

            sqlx::query("UPDATE wallets SET balance = $1, version = $2, updated_at = $3 WHERE id = $4")
                .bind(tx.balance)
                .bind(tx.sequence as i64)
                .bind(tx.created_at)
                .bind(*tx.wallet_id.as_uuid())
                .execute(&mut *db)
                .await?;

            let mut next = current;
            next.balance = tx.balance;
            next.version = tx.sequence;
            next.updated_at = tx.created_at;
            working.insert(next.id, next);
            applied.push(tx);
        }

        db.commit().await?;
        Ok(applied)
    }
}

fn check_sequence(tx: &Transaction, current: &Wallet) -> LedgerResult<()> {
    if tx.sequence != current.version + 1 {
        return Err(LedgerError::WalletConflict {
            wallet_id: current.id,
            expected: tx.sequence.saturating_sub(1),
            actual: current.version,
        });
    }
    Ok(())
}

fn insert_transaction(
    tx: &Transaction,
) -> sqlx::query::Query<'static, sqlx::Postgres, sqlx::postgres::PgArguments> {
    sqlx::query(
        r"
        INSERT INTO transactions (id, wallet_id, type, change, balance, sequence, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ",
    )
    .bind(*tx.id.as_uuid())
    .bind(*tx.wallet_id.as_uuid())
    .bind(tx.kind.code())
    .bind(tx.change)
    .bind(tx.balance)
    .bind(tx.sequence as i64)
    .bind(tx.created_at)
}

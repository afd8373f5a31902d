//! PostgreSQL store. The reserve-and-insert unit runs in one database
//! transaction; lifecycle transitions are guarded UPDATEs that only fire
//! from a legal source state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::info;

use crate::error::ServiceError;
use crate::ledger::{TxOutcome, TxRecord, TxStatus};
use crate::store::{LedgerStore, NonceSlotRecord};
use crate::wallets::{WalletBackend, WalletRecord};

const SCHEMA: [&str; 5] = [
    "CREATE TABLE IF NOT EXISTS wallets (
        address TEXT PRIMARY KEY,
        backend TEXT NOT NULL,
        key_id TEXT NOT NULL,
        label TEXT,
        created_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS nonce_slots (
        wallet_address TEXT NOT NULL,
        chain_id BIGINT NOT NULL,
        last_assigned_nonce BIGINT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (wallet_address, chain_id)
    )",
    "CREATE TABLE IF NOT EXISTS transactions (
        queue_id TEXT PRIMARY KEY,
        wallet_address TEXT NOT NULL,
        chain_id BIGINT NOT NULL,
        payload TEXT NOT NULL,
        nonce BIGINT NOT NULL,
        status TEXT NOT NULL,
        signed_payload TEXT,
        tx_hash TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        error TEXT,
        outcome TEXT,
        block_number BIGINT,
        gas_used TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        last_updated_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_transactions_status ON transactions (status)",
    "CREATE INDEX IF NOT EXISTS idx_transactions_slot
        ON transactions (wallet_address, chain_id, nonce)",
];

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, ServiceError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| ServiceError::Database(format!("cannot connect: {}", e)))?;
        let store = Self { pool };
        store.ensure_schema().await?;
        info!("Connected to Postgres");
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), ServiceError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Guarded transition: the UPDATE only fires when the current status is
    /// a legal source for `next`, so concurrent workers cannot race a row
    /// into an illegal state.
    async fn transition(
        &self,
        queue_id: &str,
        next: TxStatus,
        set_clause: &str,
        extra_binds: &[Option<String>],
    ) -> Result<TxRecord, ServiceError> {
        let allowed = allowed_sources(next);
        let sql = format!(
            "UPDATE transactions SET status = $1, last_updated_at = NOW(){} \
             WHERE queue_id = $2 AND status = ANY($3) RETURNING *",
            set_clause
        );
        let mut query = sqlx::query(&sql)
            .bind(next.as_str())
            .bind(queue_id)
            .bind(allowed);
        for bind in extra_binds {
            query = query.bind(bind.clone());
        }
        match query.fetch_optional(&self.pool).await? {
            Some(row) => row_to_tx(&row),
            None => match self.transaction(queue_id).await? {
                Some(current) => Err(ServiceError::IllegalTransition(format!(
                    "{}: {} -> {}",
                    queue_id,
                    current.status.as_str(),
                    next.as_str()
                ))),
                None => Err(ServiceError::NotFound(format!("transaction {}", queue_id))),
            },
        }
    }
}

fn allowed_sources(next: TxStatus) -> Vec<String> {
    [
        TxStatus::Queued,
        TxStatus::Signing,
        TxStatus::Submitted,
        TxStatus::Errored,
    ]
    .iter()
    .filter(|from| from.can_transition_to(next))
    .map(|from| from.as_str().to_string())
    .collect()
}

fn row_to_tx(row: &PgRow) -> Result<TxRecord, ServiceError> {
    let status: String = row.try_get("status")?;
    let outcome: Option<String> = row.try_get("outcome")?;
    let chain_id: i64 = row.try_get("chain_id")?;
    Ok(TxRecord {
        queue_id: row.try_get("queue_id")?,
        wallet_address: row.try_get("wallet_address")?,
        chain_id: chain_id as u64,
        payload: row.try_get("payload")?,
        nonce: row.try_get("nonce")?,
        status: TxStatus::parse(&status)?,
        signed_payload: row.try_get("signed_payload")?,
        tx_hash: row.try_get("tx_hash")?,
        retry_count: row.try_get("retry_count")?,
        error: row.try_get("error")?,
        outcome: outcome.as_deref().map(TxOutcome::parse).transpose()?,
        block_number: row.try_get("block_number")?,
        gas_used: row.try_get("gas_used")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        last_updated_at: row.try_get::<DateTime<Utc>, _>("last_updated_at")?,
    })
}

fn row_to_wallet(row: &PgRow) -> Result<WalletRecord, ServiceError> {
    let backend: String = row.try_get("backend")?;
    Ok(WalletRecord {
        address: row.try_get("address")?,
        backend: WalletBackend::parse(&backend)?,
        key_id: row.try_get("key_id")?,
        label: row.try_get("label")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn insert_wallet(&self, wallet: &WalletRecord) -> Result<(), ServiceError> {
        let result = sqlx::query(
            "INSERT INTO wallets (address, backend, key_id, label, created_at) \
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT (address) DO NOTHING",
        )
        .bind(&wallet.address)
        .bind(wallet.backend.as_str())
        .bind(&wallet.key_id)
        .bind(&wallet.label)
        .bind(wallet.created_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::InvalidRequest(format!(
                "wallet {} already registered",
                wallet.address
            )));
        }
        Ok(())
    }

    async fn wallet(&self, address: &str) -> Result<Option<WalletRecord>, ServiceError> {
        let row = sqlx::query("SELECT * FROM wallets WHERE address = $1")
            .bind(address)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_wallet).transpose()
    }

    async fn nonce_slot(
        &self,
        wallet_address: &str,
        chain_id: u64,
    ) -> Result<Option<NonceSlotRecord>, ServiceError> {
        let row = sqlx::query(
            "SELECT * FROM nonce_slots WHERE wallet_address = $1 AND chain_id = $2",
        )
        .bind(wallet_address)
        .bind(chain_id as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            let chain_id: i64 = r.try_get("chain_id")?;
            Ok(NonceSlotRecord {
                wallet_address: r.try_get("wallet_address")?,
                chain_id: chain_id as u64,
                last_assigned_nonce: r.try_get("last_assigned_nonce")?,
                updated_at: r.try_get::<DateTime<Utc>, _>("updated_at")?,
            })
        })
        .transpose()
    }

    async fn set_slot_nonce(
        &self,
        wallet_address: &str,
        chain_id: u64,
        last_assigned_nonce: i64,
    ) -> Result<(), ServiceError> {
        sqlx::query(
            "INSERT INTO nonce_slots (wallet_address, chain_id, last_assigned_nonce, updated_at) \
             VALUES ($1, $2, $3, NOW()) \
             ON CONFLICT (wallet_address, chain_id) \
             DO UPDATE SET last_assigned_nonce = EXCLUDED.last_assigned_nonce, updated_at = NOW()",
        )
        .bind(wallet_address)
        .bind(chain_id as i64)
        .bind(last_assigned_nonce)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_queued(&self, row: &TxRecord) -> Result<(), ServiceError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO transactions \
             (queue_id, wallet_address, chain_id, payload, nonce, status, retry_count, \
              created_at, last_updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, 0, $7, $8)",
        )
        .bind(&row.queue_id)
        .bind(&row.wallet_address)
        .bind(row.chain_id as i64)
        .bind(&row.payload)
        .bind(row.nonce)
        .bind(row.status.as_str())
        .bind(row.created_at)
        .bind(row.last_updated_at)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO nonce_slots (wallet_address, chain_id, last_assigned_nonce, updated_at) \
             VALUES ($1, $2, $3, NOW()) \
             ON CONFLICT (wallet_address, chain_id) \
             DO UPDATE SET \
                 last_assigned_nonce = GREATEST(nonce_slots.last_assigned_nonce, EXCLUDED.last_assigned_nonce), \
                 updated_at = NOW()",
        )
        .bind(&row.wallet_address)
        .bind(row.chain_id as i64)
        .bind(row.nonce)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn transaction(&self, queue_id: &str) -> Result<Option<TxRecord>, ServiceError> {
        let row = sqlx::query("SELECT * FROM transactions WHERE queue_id = $1")
            .bind(queue_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_tx).transpose()
    }

    async fn pending_rows(&self, limit: i64) -> Result<Vec<TxRecord>, ServiceError> {
        let rows = sqlx::query(
            "SELECT * FROM transactions \
             WHERE status IN ('QUEUED', 'ERRORED', 'SUBMITTED') \
             ORDER BY wallet_address, chain_id, nonce \
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_tx).collect()
    }

    async fn mark_signing(&self, queue_id: &str) -> Result<TxRecord, ServiceError> {
        self.transition(queue_id, TxStatus::Signing, "", &[]).await
    }

    async fn mark_submitted(
        &self,
        queue_id: &str,
        tx_hash: &str,
        signed_payload: &str,
    ) -> Result<TxRecord, ServiceError> {
        self.transition(
            queue_id,
            TxStatus::Submitted,
            ", tx_hash = $4, signed_payload = $5",
            &[
                Some(tx_hash.to_string()),
                Some(signed_payload.to_string()),
            ],
        )
        .await
    }

    async fn mark_confirmed(
        &self,
        queue_id: &str,
        outcome: TxOutcome,
        block_number: Option<i64>,
        gas_used: Option<String>,
    ) -> Result<TxRecord, ServiceError> {
        let status = match outcome {
            TxOutcome::MinedSuccess => TxStatus::ConfirmedSuccess,
            TxOutcome::MinedRevert => TxStatus::ConfirmedRevert,
            other => {
                return Err(ServiceError::IllegalTransition(format!(
                    "{}: confirmation cannot record outcome {}",
                    queue_id,
                    other.as_str()
                )))
            }
        };
        self.transition(
            queue_id,
            status,
            ", outcome = $4, block_number = $5::BIGINT, gas_used = $6",
            &[
                Some(outcome.as_str().to_string()),
                block_number.map(|n| n.to_string()),
                gas_used,
            ],
        )
        .await
    }

    async fn mark_errored(&self, queue_id: &str, error: &str) -> Result<TxRecord, ServiceError> {
        self.transition(
            queue_id,
            TxStatus::Errored,
            ", retry_count = retry_count + 1, error = $4",
            &[Some(error.to_string())],
        )
        .await
    }

    async fn mark_failed(&self, queue_id: &str, error: &str) -> Result<TxRecord, ServiceError> {
        self.transition(
            queue_id,
            TxStatus::Failed,
            ", outcome = $4, error = $5",
            &[
                Some(TxOutcome::Dropped.as_str().to_string()),
                Some(error.to_string()),
            ],
        )
        .await
    }

    async fn mark_cancelled(&self, queue_id: &str) -> Result<TxRecord, ServiceError> {
        self.transition(
            queue_id,
            TxStatus::Cancelled,
            ", outcome = $4",
            &[Some(TxOutcome::Cancelled.as_str().to_string())],
        )
        .await
    }

    async fn status_counts(&self) -> Result<Vec<(TxStatus, i64)>, ServiceError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM transactions GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| {
                let status: String = r.try_get("status")?;
                let n: i64 = r.try_get("n")?;
                Ok((TxStatus::parse(&status)?, n))
            })
            .collect()
    }
}

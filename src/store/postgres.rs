//! Postgres-backed store.
//!
//! Amounts are stored as NUMERIC; they are bound as text with an explicit
//! `::NUMERIC` cast and read back through `amount::TEXT`, which sidesteps
//! driver-level decimal conversions while keeping comparisons numeric
//! (so `5` matches `5.00000`).

use std::str::FromStr;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{QueryBuilder, Row};

use crate::types::{BlacklistEntry, Intent, Network, RawDeposit};

use super::{IntentFilter, Store, StoreError};

const INTENT_SELECT: &str = r#"id, from_address, to_address, source_network, destination_network,
    amount::TEXT AS amount, source_tx_hash, destination_tx_hash, source_completed,
    destination_completed, completed, try_count, created_at, updated_at"#;

/// Store backed by a Postgres connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and run pending migrations.
    pub async fn connect(uri: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(uri)
            .await
            .wrap_err("Failed to connect to store")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .wrap_err("Failed to run store migrations")?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn intent_from_row(row: &PgRow) -> Result<Intent, StoreError> {
    let source_network: String = row.try_get("source_network")?;
    let destination_network: String = row.try_get("destination_network")?;
    let amount: String = row.try_get("amount")?;

    Ok(Intent {
        id: row.try_get("id")?,
        from_address: row.try_get("from_address")?,
        to_address: row.try_get("to_address")?,
        source_network: Network::from_str(&source_network).map_err(StoreError::Corrupt)?,
        destination_network: Network::from_str(&destination_network)
            .map_err(StoreError::Corrupt)?,
        amount: BigDecimal::from_str(&amount)
            .map_err(|e| StoreError::Corrupt(format!("bad amount {}: {}", amount, e)))?,
        source_tx_hash: row.try_get("source_tx_hash")?,
        destination_tx_hash: row.try_get("destination_tx_hash")?,
        source_completed: row.try_get("source_completed")?,
        destination_completed: row.try_get("destination_completed")?,
        completed: row.try_get("completed")?,
        try_count: row.try_get("try_count")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn raw_deposit_from_row(row: &PgRow) -> Result<RawDeposit, StoreError> {
    Ok(RawDeposit {
        block_number: row.try_get("block_number")?,
        tx_hash: row.try_get("tx_hash")?,
        topics: row.try_get("topics")?,
        data: row.try_get("data")?,
        removed: row.try_get("removed")?,
    })
}

fn map_insert_err(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict,
        _ => StoreError::Backend(e),
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_intent(&self, intent: &Intent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO intents (id, from_address, to_address, source_network,
                destination_network, amount, source_tx_hash, destination_tx_hash,
                source_completed, destination_completed, completed, try_count,
                created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6::NUMERIC, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(&intent.id)
        .bind(&intent.from_address)
        .bind(&intent.to_address)
        .bind(intent.source_network.as_str())
        .bind(intent.destination_network.as_str())
        .bind(intent.amount.to_string())
        .bind(&intent.source_tx_hash)
        .bind(&intent.destination_tx_hash)
        .bind(intent.source_completed)
        .bind(intent.destination_completed)
        .bind(intent.completed)
        .bind(intent.try_count)
        .bind(intent.created_at)
        .bind(intent.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_insert_err)?;

        Ok(())
    }

    async fn get_intent(&self, id: &str) -> Result<Option<Intent>, StoreError> {
        let query = format!("SELECT {} FROM intents WHERE id = $1", INTENT_SELECT);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(intent_from_row).transpose()
    }

    async fn find_intent(&self, filter: &IntentFilter) -> Result<Option<Intent>, StoreError> {
        let mut qb: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new(format!("SELECT {} FROM intents WHERE TRUE", INTENT_SELECT));

        if let Some(ref v) = filter.from_address {
            qb.push(" AND lower(from_address) = lower(");
            qb.push_bind(v);
            qb.push(")");
        }
        if let Some(ref v) = filter.to_address {
            qb.push(" AND lower(to_address) = lower(");
            qb.push_bind(v);
            qb.push(")");
        }
        if let Some(v) = filter.source_network {
            qb.push(" AND source_network = ");
            qb.push_bind(v.as_str());
        }
        if let Some(v) = filter.destination_network {
            qb.push(" AND destination_network = ");
            qb.push_bind(v.as_str());
        }
        if let Some(v) = filter.source_completed {
            qb.push(" AND source_completed = ");
            qb.push_bind(v);
        }
        if let Some(v) = filter.destination_completed {
            qb.push(" AND destination_completed = ");
            qb.push_bind(v);
        }
        if let Some(v) = filter.completed {
            qb.push(" AND completed = ");
            qb.push_bind(v);
        }
        if let Some(ref v) = filter.destination_tx_hash {
            qb.push(" AND destination_tx_hash = ");
            qb.push_bind(v);
        }
        if let Some(ref v) = filter.amount {
            qb.push(" AND amount = ");
            qb.push_bind(v.to_string());
            qb.push("::NUMERIC");
        }
        if let Some(v) = filter.created_at {
            qb.push(" AND created_at = ");
            qb.push_bind(v);
        }

        qb.push(" ORDER BY created_at LIMIT 1");

        let row = qb.build().fetch_optional(&self.pool).await?;
        row.as_ref().map(intent_from_row).transpose()
    }

    async fn update_intent(&self, intent: &Intent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO intents (id, from_address, to_address, source_network,
                destination_network, amount, source_tx_hash, destination_tx_hash,
                source_completed, destination_completed, completed, try_count,
                created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6::NUMERIC, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE SET
                from_address = EXCLUDED.from_address,
                to_address = EXCLUDED.to_address,
                source_network = EXCLUDED.source_network,
                destination_network = EXCLUDED.destination_network,
                amount = EXCLUDED.amount,
                source_tx_hash = EXCLUDED.source_tx_hash,
                destination_tx_hash = EXCLUDED.destination_tx_hash,
                source_completed = EXCLUDED.source_completed,
                destination_completed = EXCLUDED.destination_completed,
                completed = EXCLUDED.completed,
                try_count = EXCLUDED.try_count,
                created_at = EXCLUDED.created_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&intent.id)
        .bind(&intent.from_address)
        .bind(&intent.to_address)
        .bind(intent.source_network.as_str())
        .bind(intent.destination_network.as_str())
        .bind(intent.amount.to_string())
        .bind(&intent.source_tx_hash)
        .bind(&intent.destination_tx_hash)
        .bind(intent.source_completed)
        .bind(intent.destination_completed)
        .bind(intent.completed)
        .bind(intent.try_count)
        .bind(intent.created_at)
        .bind(intent.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_blacklist(&self, entry: &BlacklistEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO blacklist (id, address, created_at, updated_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.address)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_insert_err)?;

        Ok(())
    }

    async fn find_blacklist(&self, address: &str) -> Result<Option<BlacklistEntry>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, address, created_at, updated_at
            FROM blacklist
            WHERE lower(address) = lower($1)
            "#,
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| BlacklistEntry {
            id: row.get("id"),
            address: row.get("address"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }))
    }

    async fn insert_raw_deposit(&self, deposit: &RawDeposit) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO raw_deposits (block_number, tx_hash, topics, data, removed)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (block_number) DO NOTHING
            "#,
        )
        .bind(deposit.block_number)
        .bind(&deposit.tx_hash)
        .bind(&deposit.topics)
        .bind(&deposit.data)
        .bind(deposit.removed)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn pending_raw_deposits(&self) -> Result<Vec<RawDeposit>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT block_number, tx_hash, topics, data, removed
            FROM raw_deposits
            WHERE removed = FALSE
            ORDER BY block_number
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(raw_deposit_from_row).collect()
    }

    async fn update_raw_deposit(&self, deposit: &RawDeposit) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO raw_deposits (block_number, tx_hash, topics, data, removed)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (block_number) DO UPDATE SET
                tx_hash = EXCLUDED.tx_hash,
                topics = EXCLUDED.topics,
                data = EXCLUDED.data,
                removed = EXCLUDED.removed
            "#,
        )
        .bind(deposit.block_number)
        .bind(&deposit.tx_hash)
        .bind(&deposit.topics)
        .bind(&deposit.data)
        .bind(deposit.removed)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

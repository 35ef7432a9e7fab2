//! Postgres adapter for the [`KvStore`] port.
//!
//! Every key is one row of `ledger_kv`. A delete nulls the value and bumps the
//! version, so the row stays behind as a tombstone and versions never repeat.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgPoolOptions};

use crate::store::{KvStore, StoreError, StoreResult, Versioned};

/// Postgres-backed [`KvStore`], one row per key.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connects to Postgres and creates the key-value table if missing.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .context("Failed to connect to Postgres")?;
        let store = Self::from_pool(pool);
        store
            .ensure_schema()
            .await
            .context("Failed to create ledger_kv table")?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS ledger_kv (
                 key     TEXT PRIMARY KEY,
                 value   TEXT,
                 version BIGINT NOT NULL
               )"#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn current_version(&self, key: &str) -> StoreResult<u64> {
        let row = sqlx::query(r#"SELECT version FROM ledger_kv WHERE key = $1"#)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?;
        match row {
            Some(r) => Ok(r.try_get::<i64, _>("version").map_err(store_error)? as u64),
            None => Ok(0),
        }
    }

    async fn conflict(&self, key: &str, expected: u64) -> StoreError {
        match self.current_version(key).await {
            Ok(actual) => StoreError::Conflict {
                key: key.to_string(),
                expected,
                actual,
            },
            Err(e) => e,
        }
    }

    /// Writes `value` (`None` for a tombstone) if the row is at `expected`.
    async fn swap(&self, key: &str, value: Option<&str>, expected: u64) -> StoreResult<u64> {
        if expected == 0 {
            let res = sqlx::query(
                r#"INSERT INTO ledger_kv (key, value, version) VALUES ($1, $2, 1)
                   ON CONFLICT (key) DO NOTHING"#,
            )
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
            if res.rows_affected() == 1 {
                return Ok(1);
            }
            return Err(self.conflict(key, expected).await);
        }

        let row = sqlx::query(
            r#"UPDATE ledger_kv SET value = $2, version = version + 1
               WHERE key = $1 AND version = $3
               RETURNING version"#,
        )
        .bind(key)
        .bind(value)
        .bind(expected as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        match row {
            Some(r) => Ok(r.try_get::<i64, _>("version").map_err(store_error)? as u64),
            None => Err(self.conflict(key, expected).await),
        }
    }
}

fn store_error(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StoreError::Unavailable(e.to_string())
        }
        other => StoreError::Backend(other.to_string()),
    }
}

#[async_trait]
impl KvStore for PgStore {
    async fn get(&self, key: &str) -> StoreResult<Versioned> {
        let row = sqlx::query(r#"SELECT value, version FROM ledger_kv WHERE key = $1"#)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?;

        match row {
            Some(r) => Ok(Versioned {
                value: r.try_get("value").map_err(store_error)?,
                version: r.try_get::<i64, _>("version").map_err(store_error)? as u64,
            }),
            None => Ok(Versioned::default()),
        }
    }

    async fn put(&self, key: &str, value: &str, expected: u64) -> StoreResult<u64> {
        self.swap(key, Some(value), expected).await
    }

    async fn delete(&self, key: &str, expected: u64) -> StoreResult<u64> {
        self.swap(key, None, expected).await
    }
}

//! Postgres-backed idempotency store.
//!
//! Expected table shape:
//!
//! ```sql
//! CREATE TABLE command_idempotency (
//!     tenant_id        TEXT        NOT NULL,
//!     idempotency_key  TEXT        NOT NULL,
//!     command_name     TEXT        NOT NULL,
//!     command_id       TEXT,
//!     processed_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     PRIMARY KEY (tenant_id, idempotency_key, command_name)
//! );
//! ```

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;

use super::{
    IdempotencyError, IdempotencyKey, IdempotencyRecord, IdempotencyResult, IdempotencyStore,
};
use crate::config::is_safe_table_identifier;

#[derive(Debug, Clone)]
pub struct PgIdempotencyStore {
    pool: PgPool,
    check_sql: String,
    record_sql: String,
}

impl PgIdempotencyStore {
    pub fn new(pool: PgPool, table_name: &str) -> IdempotencyResult<Self> {
        if !is_safe_table_identifier(table_name) {
            return Err(IdempotencyError::InvalidTable(table_name.to_string()));
        }

        Ok(Self {
            pool,
            check_sql: format!(
                "SELECT EXISTS (SELECT 1 FROM {table_name} \
                 WHERE tenant_id = $1 AND idempotency_key = $2 AND command_name = $3)"
            ),
            record_sql: format!(
                "INSERT INTO {table_name} \
                 (tenant_id, idempotency_key, command_name, command_id, processed_at) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (tenant_id, idempotency_key, command_name) DO NOTHING"
            ),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn check(&self, key: &IdempotencyKey<'_>) -> IdempotencyResult<bool> {
        let exists: bool = sqlx::query_scalar(&self.check_sql)
            .bind(key.tenant_id)
            .bind(key.key)
            .bind(key.command_name)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn record(&self, record: &IdempotencyRecord) -> IdempotencyResult<bool> {
        let result = sqlx::query(&self.record_sql)
            .bind(&record.tenant_id)
            .bind(&record.idempotency_key)
            .bind(&record.command_name)
            .bind(record.command_id.as_deref())
            .bind(record.processed_at)
            .execute(&self.pool)
            .await?;

        let inserted = result.rows_affected() == 1;
        if !inserted {
            debug!(
                tenant_id = %record.tenant_id,
                idempotency_key = %record.idempotency_key,
                command_name = %record.command_name,
                "Idempotency record already present"
            );
        }
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    #[tokio::test]
    async fn test_rejects_unsafe_table_name() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgresql://localhost/command_bus_test")
            .unwrap();

        let err = PgIdempotencyStore::new(pool.clone(), "idem; DROP TABLE users").unwrap_err();
        assert!(matches!(err, IdempotencyError::InvalidTable(_)));

        let store = PgIdempotencyStore::new(pool, "messaging.command_idempotency").unwrap();
        assert!(store.check_sql.contains("FROM messaging.command_idempotency"));
        assert!(store.record_sql.contains("ON CONFLICT"));
    }
}

//! # PostgreSQL Document Store
//!
//! JSONB-backed implementation of [`DocumentStore`]. All documents live in a
//! single `modhub_documents` table keyed by `(collection, doc_key)`.
//!
//! ## Concurrency
//!
//! Guarded updates compile to
//!
//! ```sql
//! UPDATE modhub_documents SET version = version + 1, body = $4
//! WHERE collection = $1 AND doc_key = $2 AND version = $3
//! ```
//!
//! so the affected-row count is the optimistic-concurrency verdict. Batches run
//! inside one transaction and roll back on the first failed predicate.
//!
//! Filtered selects use JSONB containment (`body @> $2`), served by the GIN index
//! created in `migrations/`.

use super::{DocumentFilter, DocumentStore, StoreError, StoreResult, StoredDocument, WriteOperation};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, info};

const SCHEMA_SQL: &str =
    include_str!("../../migrations/20260101000000_create_modhub_documents.sql");

/// Postgres unique_violation
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and make sure the document table exists
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        let store = Self::new(pool);
        store.ensure_schema().await?;
        info!(max_connections, "💾 PgDocumentStore connected");
        Ok(store)
    }

    pub async fn ensure_schema(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        debug!("modhub_documents schema ensured");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn map_insert_error(err: sqlx::Error, collection: &str, key: &str) -> StoreError {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) {
                return StoreError::duplicate_key(collection, key);
            }
        }
        err.into()
    }

    async fn apply_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        operation: WriteOperation,
    ) -> StoreResult<()> {
        match operation {
            WriteOperation::Insert {
                collection,
                key,
                body,
            } => {
                sqlx::query(
                    "INSERT INTO modhub_documents (collection, doc_key, version, body) \
                     VALUES ($1, $2, 1, $3)",
                )
                .bind(&collection)
                .bind(&key)
                .bind(&body)
                .execute(&mut **tx)
                .await
                .map_err(|e| Self::map_insert_error(e, &collection, &key))?;
            }
            WriteOperation::Upsert {
                collection,
                key,
                body,
            } => {
                sqlx::query(
                    "INSERT INTO modhub_documents (collection, doc_key, version, body) \
                     VALUES ($1, $2, 1, $3) \
                     ON CONFLICT (collection, doc_key) DO UPDATE \
                     SET version = modhub_documents.version + 1, body = EXCLUDED.body, updated_at = NOW()",
                )
                .bind(&collection)
                .bind(&key)
                .bind(&body)
                .execute(&mut **tx)
                .await?;
            }
            WriteOperation::UpdateWhere {
                collection,
                key,
                expected_version,
                body,
            } => {
                let result = sqlx::query(
                    "UPDATE modhub_documents SET version = version + 1, body = $4, updated_at = NOW() \
                     WHERE collection = $1 AND doc_key = $2 AND version = $3",
                )
                .bind(&collection)
                .bind(&key)
                .bind(expected_version)
                .bind(&body)
                .execute(&mut **tx)
                .await?;
                if result.rows_affected() == 0 {
                    return Err(StoreError::predicate_failed(
                        collection,
                        key,
                        expected_version,
                    ));
                }
            }
        }
        Ok(())
    }

    fn row_to_document(row: &sqlx::postgres::PgRow) -> StoreResult<StoredDocument> {
        Ok(StoredDocument {
            key: row.try_get("doc_key")?,
            version: row.try_get("version")?,
            body: row.try_get::<Value, _>("body")?,
        })
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn insert(
        &self,
        collection: &str,
        key: &str,
        body: Value,
    ) -> StoreResult<StoredDocument> {
        sqlx::query(
            "INSERT INTO modhub_documents (collection, doc_key, version, body) VALUES ($1, $2, 1, $3)",
        )
        .bind(collection)
        .bind(key)
        .bind(&body)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::map_insert_error(e, collection, key))?;

        Ok(StoredDocument {
            key: key.to_string(),
            version: 1,
            body,
        })
    }

    async fn update_where(
        &self,
        collection: &str,
        key: &str,
        expected_version: i64,
        body: Value,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE modhub_documents SET version = version + 1, body = $4, updated_at = NOW() \
             WHERE collection = $1 AND doc_key = $2 AND version = $3",
        )
        .bind(collection)
        .bind(key)
        .bind(expected_version)
        .bind(&body)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn upsert(
        &self,
        collection: &str,
        key: &str,
        body: Value,
    ) -> StoreResult<StoredDocument> {
        let row = sqlx::query(
            "INSERT INTO modhub_documents (collection, doc_key, version, body) VALUES ($1, $2, 1, $3) \
             ON CONFLICT (collection, doc_key) DO UPDATE \
             SET version = modhub_documents.version + 1, body = EXCLUDED.body, updated_at = NOW() \
             RETURNING doc_key, version, body",
        )
        .bind(collection)
        .bind(key)
        .bind(&body)
        .fetch_one(&self.pool)
        .await?;
        Self::row_to_document(&row)
    }

    async fn get(&self, collection: &str, key: &str) -> StoreResult<Option<StoredDocument>> {
        let row = sqlx::query(
            "SELECT doc_key, version, body FROM modhub_documents WHERE collection = $1 AND doc_key = $2",
        )
        .bind(collection)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_document).transpose()
    }

    async fn select(
        &self,
        collection: &str,
        filter: &DocumentFilter,
    ) -> StoreResult<Vec<StoredDocument>> {
        let limit = filter
            .max_results()
            .map(|l| i64::try_from(l).unwrap_or(i64::MAX));
        let rows = sqlx::query(
            "SELECT doc_key, version, body FROM modhub_documents \
             WHERE collection = $1 AND body @> $2 \
             ORDER BY doc_key LIMIT $3",
        )
        .bind(collection)
        .bind(filter.as_containment())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_document).collect()
    }

    async fn delete(&self, collection: &str, key: &str) -> StoreResult<u64> {
        let result =
            sqlx::query("DELETE FROM modhub_documents WHERE collection = $1 AND doc_key = $2")
                .bind(collection)
                .bind(key)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn commit(&self, operations: Vec<WriteOperation>) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for operation in operations {
            // Dropping the transaction on error rolls it back.
            Self::apply_in_tx(&mut tx, operation).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Error as SqlxError, Row};
use std::time::Duration;
use tracing::{debug, error, info};

use super::store::{DocumentStore, StoredDocument};
use crate::errors::StorageError;

/// PostgreSQL backed document store
pub struct DbDocs {
    pool: PgPool,
}

impl DbDocs {
    /// Create a new database connection pool and make sure the schema exists
    ///
    /// # Arguments
    /// * `database_url` - PostgreSQL connection string
    ///
    /// # Returns
    /// * `Result<Self, SqlxError>` - Document store or error
    pub async fn new(database_url: &str) -> Result<Self, SqlxError> {
        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(20)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(database_url)
            .await?;

        info!("Database connection pool created successfully");

        let db = Self { pool };
        db.ensure_schema().await?;
        Ok(db)
    }

    async fn ensure_schema(&self) -> Result<(), SqlxError> {
        let create_sql = r#"
            CREATE TABLE IF NOT EXISTS documents (
                room_id TEXT PRIMARY KEY,
                document_state BYTEA NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
        "#;
        sqlx::query(create_sql).execute(&self.pool).await?;
        info!("Documents table is ready");
        Ok(())
    }

    fn log_pool_state(&self, action: &str, room_id: &str) {
        let pool_idle = self.pool.num_idle() as u32;
        let pool_size = self.pool.size();
        debug!(
            "{} document for room {}. Pool connections: {} idle, {} in use",
            action,
            room_id,
            pool_idle,
            pool_size.saturating_sub(pool_idle)
        );
    }
}

#[async_trait]
impl DocumentStore for DbDocs {
    async fn load(&self, room_id: &str) -> Result<Option<StoredDocument>, StorageError> {
        self.log_pool_state("Loading", room_id);

        let query_sql = r#"
            SELECT room_id, document_state, updated_at
            FROM documents
            WHERE room_id = $1;
        "#;

        let row = sqlx::query(query_sql)
            .bind(room_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to load document for room {}: {}", room_id, e);
                e
            })?;

        match row {
            Some(row) => {
                let document_state: Vec<u8> = row.try_get("document_state")?;
                let updated_at: DateTime<Utc> = row.try_get("updated_at")?;
                Ok(Some(StoredDocument {
                    room_id: row.try_get("room_id")?,
                    document_state,
                    updated_at,
                }))
            }
            None => Ok(None),
        }
    }

    async fn upsert(&self, room_id: &str, document_state: &[u8]) -> Result<DateTime<Utc>, StorageError> {
        self.log_pool_state("Upserting", room_id);

        let upsert_sql = r#"
            INSERT INTO documents (room_id, document_state)
            VALUES ($1, $2)
            ON CONFLICT (room_id) DO UPDATE
            SET document_state = EXCLUDED.document_state,
                updated_at = NOW()
            RETURNING updated_at;
        "#;

        let row = sqlx::query(upsert_sql)
            .bind(room_id)
            .bind(document_state)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to upsert document for room {}: {}", room_id, e);
                e
            })?;

        let updated_at: DateTime<Utc> = row.try_get("updated_at")?;
        Ok(updated_at)
    }
}

//! Postgres checkpoint store
//!
//! One JSONB row per thread. The schema is created lazily on first use.

use super::{decode, encode, Checkpoint, CheckpointStore};
use crate::error::OrchestrationError;
use crate::models::ConversationState;
use crate::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

pub struct PostgresCheckpointStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PostgresCheckpointStore {
    /// Build a lazily-connecting pool; no connection is made until first use.
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)?;

        info!("Checkpoint backend: postgres");
        Ok(Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        })
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS conversation_checkpoints (
                      thread_id TEXT PRIMARY KEY,
                      version BIGINT NOT NULL,
                      state JSONB NOT NULL,
                      updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                OrchestrationError::StorageError(format!(
                    "Failed to initialize checkpoint schema: {}",
                    e
                ))
            })?;

        Ok(())
    }

    async fn current_version(&self, thread_id: &str) -> Result<u64> {
        let row = sqlx::query("SELECT version FROM conversation_checkpoints WHERE thread_id = $1")
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(match row {
            Some(row) => row.try_get::<i64, _>("version")? as u64,
            None => 0,
        })
    }

    fn conflict(thread_id: &str, expected: u64, found: u64) -> OrchestrationError {
        OrchestrationError::VersionConflict {
            thread_id: thread_id.to_string(),
            expected,
            found,
        }
    }
}

#[async_trait::async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            "SELECT version, state::TEXT AS state FROM conversation_checkpoints WHERE thread_id = $1",
        )
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let version: i64 = row.try_get("version")?;
        let blob: String = row.try_get("state")?;
        Ok(Some(Checkpoint {
            state: decode(thread_id, &blob)?,
            version: version as u64,
        }))
    }

    async fn save(&self, thread_id: &str, state: &ConversationState, expected_version: u64) -> Result<u64> {
        self.ensure_schema().await?;
        let blob = encode(state)?;
        let next = expected_version + 1;

        let affected = if expected_version == 0 {
            sqlx::query(
                r#"
                INSERT INTO conversation_checkpoints (thread_id, version, state, updated_at)
                VALUES ($1, 1, $2::JSONB, NOW())
                ON CONFLICT (thread_id) DO NOTHING
                "#,
            )
            .bind(thread_id)
            .bind(&blob)
            .execute(&self.pool)
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                r#"
                UPDATE conversation_checkpoints
                SET version = $3, state = $2::JSONB, updated_at = NOW()
                WHERE thread_id = $1 AND version = $4
                "#,
            )
            .bind(thread_id)
            .bind(&blob)
            .bind(next as i64)
            .bind(expected_version as i64)
            .execute(&self.pool)
            .await?
            .rows_affected()
        };

        if affected == 1 {
            return Ok(next);
        }

        let found = self.current_version(thread_id).await?;
        Err(Self::conflict(thread_id, expected_version, found))
    }
}

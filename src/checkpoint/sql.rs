// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL checkpoint store (SQLite or MySQL).
//!
//! ```sql
//! CREATE TABLE sync_checkpoints (
//!   direction  VARCHAR(16) NOT NULL,  -- a_to_b | b_to_a
//!   shard      BIGINT NOT NULL,       -- cluster shard
//!   ts         BIGINT NOT NULL,       -- synchronized up to (epoch millis)
//!   updated_at BIGINT NOT NULL,
//!   PRIMARY KEY (direction, shard)
//! )
//! ```
//!
//! Saves are a single upsert that keeps the larger timestamp, so concurrent
//! or replayed saves cannot move a checkpoint backwards.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{any::AnyPoolOptions, AnyPool, Row};
use tracing::info;

use super::{Checkpoint, CheckpointKey, CheckpointStore};
use crate::changelog::now_millis;
use crate::coordinator::Direction;
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::traits::StorageError;

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

fn sql_error(e: sqlx::Error) -> StorageError {
    match e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
            StorageError::Transient(e.to_string())
        }
        other => StorageError::Backend(other.to_string()),
    }
}

pub struct SqlCheckpointStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlCheckpointStore {
    /// Connect with startup-mode retry (fails fast if the URL is wrong) and create the table.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("checkpoint_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(if is_sqlite { 1 } else { 8 })
                .acquire_timeout(Duration::from_secs(10))
                .connect(connection_string)
                .await
                .map_err(|e| StorageError::Transient(e.to_string()))
        })
        .await?;

        let store = Self { pool, is_sqlite };
        store.init_schema().await?;
        info!(sqlite = is_sqlite, "Checkpoint store ready");
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let sql = if self.is_sqlite {
            r#"
            CREATE TABLE IF NOT EXISTS sync_checkpoints (
                direction TEXT NOT NULL,
                shard INTEGER NOT NULL,
                ts INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (direction, shard)
            )
            "#
        } else {
            r#"
            CREATE TABLE IF NOT EXISTS sync_checkpoints (
                direction VARCHAR(16) NOT NULL,
                shard BIGINT NOT NULL,
                ts BIGINT NOT NULL,
                updated_at BIGINT NOT NULL,
                PRIMARY KEY (direction, shard)
            )
            "#
        };

        sqlx::query(sql).execute(&self.pool).await.map_err(sql_error)?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for SqlCheckpointStore {
    async fn load(&self, key: CheckpointKey) -> Result<Option<Checkpoint>, StorageError> {
        let row = sqlx::query("SELECT ts, updated_at FROM sync_checkpoints WHERE direction = ? AND shard = ?")
            .bind(key.direction.as_str())
            .bind(i64::from(key.shard))
            .fetch_optional(&self.pool)
            .await
            .map_err(sql_error)?;

        row.map(|row| {
            Ok(Checkpoint {
                timestamp: row.try_get::<i64, _>("ts").map_err(sql_error)?,
                updated_at: row.try_get::<i64, _>("updated_at").map_err(sql_error)?,
            })
        })
        .transpose()
    }

    async fn load_range(
        &self,
        direction: Direction,
        shards: Range<u32>,
    ) -> Result<BTreeMap<u32, Checkpoint>, StorageError> {
        let rows = sqlx::query(
            "SELECT shard, ts, updated_at FROM sync_checkpoints WHERE direction = ? AND shard >= ? AND shard < ?",
        )
        .bind(direction.as_str())
        .bind(i64::from(shards.start))
        .bind(i64::from(shards.end))
        .fetch_all(&self.pool)
        .await
        .map_err(sql_error)?;

        let mut found = BTreeMap::new();
        for row in rows {
            let shard: i64 = row.try_get("shard").map_err(sql_error)?;
            let shard = u32::try_from(shard)
                .map_err(|_| StorageError::Backend(format!("checkpoint shard {} out of range", shard)))?;
            found.insert(
                shard,
                Checkpoint {
                    timestamp: row.try_get("ts").map_err(sql_error)?,
                    updated_at: row.try_get("updated_at").map_err(sql_error)?,
                },
            );
        }
        Ok(found)
    }

    async fn save(&self, key: CheckpointKey, timestamp: i64) -> Result<(), StorageError> {
        let sql = if self.is_sqlite {
            "INSERT INTO sync_checkpoints (direction, shard, ts, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(direction, shard) DO UPDATE SET ts = MAX(ts, excluded.ts), updated_at = excluded.updated_at"
        } else {
            "INSERT INTO sync_checkpoints (direction, shard, ts, updated_at) VALUES (?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE ts = GREATEST(ts, VALUES(ts)), updated_at = VALUES(updated_at)"
        };

        sqlx::query(sql)
            .bind(key.direction.as_str())
            .bind(i64::from(key.shard))
            .bind(timestamp)
            .bind(now_millis())
            .execute(&self.pool)
            .await
            .map_err(sql_error)?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM sync_checkpoints")
            .execute(&self.pool)
            .await
            .map_err(sql_error)?;
        Ok(())
    }
}

//! SQLite-backed ledger and dedup store.
//!
//! Totals are kept as decimal text so nothing ever passes through a float.

use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::Row;
use tracing::{debug, info};

use tally_core::{
    domain::{ChatId, MessageKey},
    ledger::{pending_reply_ttl, Applied, LedgerOp},
    ports::{DedupStore, LedgerStore, RenderReply},
    Error, Result,
};

use crate::pool::DatabasePool;

pub struct SqliteStore {
    pool: DatabasePool,
    scale: u32,
    retention: Option<Duration>,
}

impl SqliteStore {
    /// Open the database at `database_url`, applying migrations.
    pub async fn open(database_url: &str, scale: u32) -> Result<Self> {
        let pool = DatabasePool::new(database_url).await.map_err(store_err)?;
        info!(scale, "sqlite store ready");
        Ok(Self {
            pool,
            scale,
            retention: None,
        })
    }

    /// Forget dedup markers older than `retention` (time-boxed variant).
    pub fn with_dedup_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    /// Oldest `marked_at` (unix millis) still honoured, if markers expire.
    fn cutoff(&self) -> Option<i64> {
        Some(millis_before(self.retention?))
    }

    /// Oldest `created_at` (unix millis) of a pending reply worth keeping.
    fn pending_cutoff(&self) -> i64 {
        millis_before(pending_reply_ttl(self.retention))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn store_err(e: sqlx::Error) -> Error {
    Error::Store(e.to_string())
}

fn parse_total(raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw).map_err(|e| Error::Store(format!("invalid stored total {raw:?}: {e}")))
}

fn millis_before(age: Duration) -> i64 {
    let age = i64::try_from(age.as_millis()).unwrap_or(i64::MAX);
    Utc::now().timestamp_millis().saturating_sub(age)
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

async fn current_total(
    conn: &mut sqlx::SqliteConnection,
    chat_id: &ChatId,
) -> Result<Option<Decimal>> {
    let row = sqlx::query("SELECT total FROM ledger WHERE chat_id = ?")
        .bind(chat_id.as_str())
        .fetch_optional(conn)
        .await
        .map_err(store_err)?;
    match row {
        Some(row) => {
            let raw: String = row.try_get("total").map_err(store_err)?;
            Ok(Some(parse_total(&raw)?))
        }
        None => Ok(None),
    }
}

async fn write_total(
    conn: &mut sqlx::SqliteConnection,
    chat_id: &ChatId,
    total: Decimal,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO ledger (chat_id, total, updated_at) VALUES (?, ?, ?) \
         ON CONFLICT(chat_id) DO UPDATE SET total = excluded.total, updated_at = excluded.updated_at",
    )
    .bind(chat_id.as_str())
    .bind(total.to_string())
    .bind(now_rfc3339())
    .execute(conn)
    .await
    .map_err(store_err)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Port implementations
// ---------------------------------------------------------------------------

#[async_trait]
impl DedupStore for SqliteStore {
    async fn has_processed(&self, key: &MessageKey) -> Result<bool> {
        let row = sqlx::query(
            "SELECT marked_at FROM processed_message WHERE chat_id = ? AND msg_id = ?",
        )
        .bind(key.chat_id.as_str())
        .bind(key.msg_id.as_str())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(store_err)?;

        let Some(row) = row else {
            return Ok(false);
        };
        let marked_at: i64 = row.try_get("marked_at").map_err(store_err)?;
        Ok(self.cutoff().map_or(true, |cutoff| marked_at >= cutoff))
    }

    async fn mark_processed(&self, key: &MessageKey) -> Result<()> {
        let mut tx = self.pool.writer.begin().await.map_err(store_err)?;

        if let Some(cutoff) = self.cutoff() {
            let pruned = sqlx::query("DELETE FROM processed_message WHERE marked_at < ?")
                .bind(cutoff)
                .execute(&mut *tx)
                .await
                .map_err(store_err)?
                .rows_affected();
            if pruned > 0 {
                debug!(pruned, "expired dedup markers removed");
            }
        }

        sqlx::query(
            "INSERT INTO processed_message (chat_id, msg_id, marked_at) VALUES (?, ?, ?) \
             ON CONFLICT(chat_id, msg_id) DO NOTHING",
        )
        .bind(key.chat_id.as_str())
        .bind(key.msg_id.as_str())
        .bind(Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        sqlx::query("DELETE FROM pending_reply WHERE chat_id = ? AND msg_id = ?")
            .bind(key.chat_id.as_str())
            .bind(key.msg_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;

        let stale = sqlx::query("DELETE FROM pending_reply WHERE created_at < ?")
            .bind(self.pending_cutoff())
            .execute(&mut *tx)
            .await
            .map_err(store_err)?
            .rows_affected();
        if stale > 0 {
            debug!(stale, "unconfirmed replies past the replay window removed");
        }

        tx.commit().await.map_err(store_err)
    }
}

#[async_trait]
impl LedgerStore for SqliteStore {
    async fn get(&self, chat_id: &ChatId) -> Result<Option<Decimal>> {
        let mut conn = self.pool.reader.acquire().await.map_err(store_err)?;
        current_total(&mut conn, chat_id).await
    }

    async fn apply(&self, chat_id: &ChatId, op: LedgerOp) -> Result<Decimal> {
        let mut tx = self.pool.writer.begin().await.map_err(store_err)?;
        let current = current_total(&mut tx, chat_id).await?;
        let next = op.apply(current, self.scale)?;
        write_total(&mut tx, chat_id, next).await?;
        tx.commit().await.map_err(store_err)?;
        Ok(next)
    }

    async fn apply_once(
        &self,
        key: &MessageKey,
        op: LedgerOp,
        render: RenderReply<'_>,
    ) -> Result<Applied> {
        let mut tx = self.pool.writer.begin().await.map_err(store_err)?;

        let pending = sqlx::query(
            "SELECT total, reply FROM pending_reply WHERE chat_id = ? AND msg_id = ?",
        )
        .bind(key.chat_id.as_str())
        .bind(key.msg_id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_err)?;

        if let Some(row) = pending {
            let total: String = row.try_get("total").map_err(store_err)?;
            let reply: String = row.try_get("reply").map_err(store_err)?;
            return Ok(Applied {
                total: parse_total(&total)?,
                reply,
                replayed: true,
            });
        }

        let current = current_total(&mut tx, &key.chat_id).await?;
        let next = op.apply(current, self.scale)?;
        let reply = render(next);
        write_total(&mut tx, &key.chat_id, next).await?;

        sqlx::query(
            "INSERT INTO pending_reply (chat_id, msg_id, total, reply, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(key.chat_id.as_str())
        .bind(key.msg_id.as_str())
        .bind(next.to_string())
        .bind(reply.as_str())
        .bind(Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        tx.commit().await.map_err(store_err)?;
        Ok(Applied {
            total: next,
            reply,
            replayed: false,
        })
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

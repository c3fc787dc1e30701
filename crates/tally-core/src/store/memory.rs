//! In-process store for tests and throwaway deployments.
//!
//! Dedup markers live only as long as the process: after a restart the
//! transport may redeliver a message that was already applied, and it will be
//! applied again. Use the SQLite store whenever at-most-once must survive
//! reconnects and restarts.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::{sync::Mutex, time::Instant};

use crate::{
    domain::{ChatId, MessageKey},
    ledger::{pending_reply_ttl, Applied, LedgerOp},
    ports::{DedupStore, LedgerStore, RenderReply},
    Result,
};

#[derive(Default)]
struct Inner {
    totals: HashMap<ChatId, Decimal>,
    processed: HashMap<MessageKey, Instant>,
    pending: HashMap<MessageKey, PendingReply>,
}

struct PendingReply {
    total: Decimal,
    reply: String,
    created: Instant,
}

pub struct MemoryStore {
    scale: u32,
    retention: Option<Duration>,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new(scale: u32) -> Self {
        Self {
            scale,
            retention: None,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Forget dedup markers older than `retention` (time-boxed variant).
    pub fn with_dedup_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    fn evict_expired(&self, inner: &mut Inner) {
        let Some(retention) = self.retention else {
            return;
        };
        let now = Instant::now();
        inner
            .processed
            .retain(|_, marked| now.saturating_duration_since(*marked) < retention);
    }

    fn evict_stale_pending(&self, inner: &mut Inner) {
        let ttl = pending_reply_ttl(self.retention);
        let now = Instant::now();
        inner
            .pending
            .retain(|_, p| now.saturating_duration_since(p.created) < ttl);
    }
}

#[async_trait]
impl DedupStore for MemoryStore {
    async fn has_processed(&self, key: &MessageKey) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        self.evict_expired(&mut inner);
        Ok(inner.processed.contains_key(key))
    }

    async fn mark_processed(&self, key: &MessageKey) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.evict_expired(&mut inner);
        inner.processed.entry(key.clone()).or_insert_with(Instant::now);
        inner.pending.remove(key);
        self.evict_stale_pending(&mut inner);
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn get(&self, chat_id: &ChatId) -> Result<Option<Decimal>> {
        Ok(self.inner.lock().await.totals.get(chat_id).copied())
    }

    async fn apply(&self, chat_id: &ChatId, op: LedgerOp) -> Result<Decimal> {
        let mut inner = self.inner.lock().await;
        let next = op.apply(inner.totals.get(chat_id).copied(), self.scale)?;
        inner.totals.insert(chat_id.clone(), next);
        Ok(next)
    }

    async fn apply_once(
        &self,
        key: &MessageKey,
        op: LedgerOp,
        render: RenderReply<'_>,
    ) -> Result<Applied> {
        let mut inner = self.inner.lock().await;
        if let Some(pending) = inner.pending.get(key) {
            return Ok(Applied {
                total: pending.total,
                reply: pending.reply.clone(),
                replayed: true,
            });
        }

        let next = op.apply(inner.totals.get(&key.chat_id).copied(), self.scale)?;
        let reply = render(next);
        inner.totals.insert(key.chat_id.clone(), next);
        inner.pending.insert(
            key.clone(),
            PendingReply {
                total: next,
                reply: reply.clone(),
                created: Instant::now(),
            },
        );
        Ok(Applied {
            total: next,
            reply,
            replayed: false,
        })
    }
}

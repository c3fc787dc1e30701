use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::{
    domain::{ChatId, MessageKey},
    ledger::{Applied, LedgerOp},
    Result,
};

/// Renders the reply for a mutation once the new total is known.
pub type RenderReply<'a> = &'a (dyn Fn(Decimal) -> String + Send + Sync);

/// Hexagonal port for the idempotency markers.
///
/// `mark_processed` is idempotent; marking twice is not an error.
#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn has_processed(&self, key: &MessageKey) -> Result<bool>;
    async fn mark_processed(&self, key: &MessageKey) -> Result<()>;
}

/// Hexagonal port for the running totals.
///
/// Implementations must make `apply` and `apply_once` atomic with respect to
/// each other for the same conversation, and round results to their configured
/// scale before persisting.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get(&self, chat_id: &ChatId) -> Result<Option<Decimal>>;

    async fn apply(&self, chat_id: &ChatId, op: LedgerOp) -> Result<Decimal>;

    /// Apply `op` on behalf of one inbound message, at most once.
    ///
    /// The reply rendered from the new total is recorded together with the
    /// mutation; calling again with the same key returns that record with
    /// `replayed = true` and leaves the total alone.
    async fn apply_once(
        &self,
        key: &MessageKey,
        op: LedgerOp,
        render: RenderReply<'_>,
    ) -> Result<Applied>;

    async fn set(&self, chat_id: &ChatId, value: Decimal) -> Result<Decimal> {
        self.apply(chat_id, LedgerOp::Set(value)).await
    }

    async fn add(&self, chat_id: &ChatId, delta: Decimal) -> Result<Decimal> {
        self.apply(chat_id, LedgerOp::Add(delta)).await
    }

    async fn reset(&self, chat_id: &ChatId) -> Result<Decimal> {
        self.apply(chat_id, LedgerOp::Reset).await
    }

    /// Release underlying resources at shutdown.
    async fn close(&self) {}
}

//! Ledger arithmetic shared by every store implementation.

use std::time::Duration;

use rust_decimal::{Decimal, RoundingStrategy};

use crate::{errors::Error, Result};

/// One mutation of a conversation's running total.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LedgerOp {
    Set(Decimal),
    Add(Decimal),
    Reset,
}

/// How long an unconfirmed reply is kept for replay when dedup markers never
/// expire. Transports stop redelivering long before this.
pub const PENDING_REPLY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Age after which a pending reply is dropped: the marker retention window if
/// there is one, otherwise [`PENDING_REPLY_TTL`].
pub fn pending_reply_ttl(dedup_retention: Option<Duration>) -> Duration {
    dedup_retention.unwrap_or(PENDING_REPLY_TTL)
}

/// Outcome of [`crate::ports::LedgerStore::apply_once`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Applied {
    pub total: Decimal,
    pub reply: String,
    /// The message had already been applied; nothing was mutated this time.
    pub replayed: bool,
}

impl LedgerOp {
    /// Compute the next total from the current one (unset counts as zero).
    pub fn apply(self, current: Option<Decimal>, scale: u32) -> Result<Decimal> {
        let next = match self {
            LedgerOp::Set(value) => value,
            LedgerOp::Add(delta) => current
                .unwrap_or(Decimal::ZERO)
                .checked_add(delta)
                .ok_or_else(|| Error::Arithmetic("running total overflow".to_string()))?,
            LedgerOp::Reset => Decimal::ZERO,
        };
        let rounded = round(next, scale);
        if rounded.scale() != scale {
            return Err(Error::Arithmetic(format!(
                "running total does not fit {scale} decimal places"
            )));
        }
        Ok(rounded)
    }

    pub fn name(self) -> &'static str {
        match self {
            LedgerOp::Set(_) => "set",
            LedgerOp::Add(_) => "add",
            LedgerOp::Reset => "reset",
        }
    }
}

/// Round half away from zero and pad to `scale` decimal places.
///
/// Values too large to carry `scale` places keep a smaller scale;
/// [`LedgerOp::apply`] refuses those.
pub fn round(value: Decimal, scale: u32) -> Decimal {
    let mut out = value.round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero);
    out.rescale(scale);
    out
}

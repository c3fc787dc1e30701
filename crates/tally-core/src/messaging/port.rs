use async_trait::async_trait;

use crate::{messaging::types::OutboundReply, Result};

/// Cross-transport reply port.
///
/// Errors are reported as [`crate::Error::Transport`] (or `Timeout`) so the
/// orchestrator leaves the message unmarked and a redelivery can retry.
#[async_trait]
pub trait ReplyPort: Send + Sync {
    async fn send_reply(&self, reply: &OutboundReply) -> Result<()>;
}

use chrono::{DateTime, Utc};

use crate::domain::{ChatId, MessageId, MessageKey};

/// Normalized inbound message, as handed over by any transport.
///
/// Transports may deliver the same message more than once.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub chat_id: ChatId,
    pub msg_id: MessageId,
    pub from_me: bool,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(chat_id: impl Into<String>, msg_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            chat_id: ChatId(chat_id.into()),
            msg_id: MessageId(msg_id.into()),
            from_me: false,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn key(&self) -> MessageKey {
        MessageKey {
            chat_id: self.chat_id.clone(),
            msg_id: self.msg_id.clone(),
        }
    }
}

/// Reply command emitted by the orchestrator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundReply {
    pub chat_id: ChatId,
    pub text: String,
    /// Message being answered; transports quote it when they can.
    pub quoted: Option<MessageId>,
}

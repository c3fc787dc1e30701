//! Telegram adapter (teloxide).
//!
//! This crate implements the `tally-core` ReplyPort over the Telegram Bot API
//! and feeds inbound messages into the core dispatcher.

use async_trait::async_trait;

use teloxide::prelude::*;

use tokio::time::sleep;

pub mod router;

use tally_core::{
    domain::{ChatId, MessageId},
    errors::Error,
    messaging::{port::ReplyPort, types::OutboundReply},
    Result,
};

#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    fn map_err(e: teloxide::RequestError) -> Error {
        Error::Transport(format!("telegram error: {e}"))
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, teloxide::RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => match e {
                    teloxide::RequestError::RetryAfter(d) if attempts < MAX_RETRIES => {
                        attempts += 1;
                        sleep(d).await;
                        continue;
                    }
                    other => return Err(Self::map_err(other)),
                },
            }
        }
    }
}

/// Telegram chat ids are signed 64-bit integers.
pub fn tg_chat(chat_id: &ChatId) -> Result<teloxide::types::ChatId> {
    chat_id
        .as_str()
        .parse::<i64>()
        .map(teloxide::types::ChatId)
        .map_err(|_| Error::Transport(format!("not a telegram chat id: {chat_id}")))
}

/// Message ids that do not parse are not quoted rather than failing the send.
pub fn tg_msg_id(message_id: &MessageId) -> Option<teloxide::types::MessageId> {
    message_id
        .as_str()
        .parse::<i32>()
        .ok()
        .map(teloxide::types::MessageId)
}

#[async_trait]
impl ReplyPort for TelegramMessenger {
    async fn send_reply(&self, reply: &OutboundReply) -> Result<()> {
        let chat = tg_chat(&reply.chat_id)?;
        let quoted = reply.quoted.as_ref().and_then(tg_msg_id);

        self.with_retry(|| {
            let mut req = self.bot.send_message(chat, reply.text.clone());
            if let Some(id) = quoted {
                req = req.reply_to_message_id(id).allow_sending_without_reply(true);
            }
            req
        })
        .await?;
        Ok(())
    }
}

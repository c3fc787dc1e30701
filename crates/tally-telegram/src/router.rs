use std::sync::Arc;

use teloxide::{dispatching::Dispatcher, dptree, prelude::*, types::UserId};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tally_core::{
    domain::{ChatId, MessageId},
    messaging::types::InboundMessage,
};

#[derive(Clone)]
pub struct AppState {
    pub inbound: mpsc::Sender<InboundMessage>,
    /// The bot's own account; its messages are never counted.
    pub me: Option<UserId>,
}

/// Normalize a Telegram message into the transport-neutral shape.
///
/// Captions count as text. Messages with neither yield `None`.
pub fn to_inbound(msg: &Message, me: Option<UserId>) -> Option<InboundMessage> {
    let text = msg.text().or_else(|| msg.caption())?;
    let from_me = match (msg.from(), me) {
        (Some(user), Some(me)) => user.id == me,
        _ => false,
    };

    Some(InboundMessage {
        chat_id: ChatId(msg.chat.id.0.to_string()),
        msg_id: MessageId(msg.id.0.to_string()),
        from_me,
        text: text.to_string(),
        timestamp: msg.date,
    })
}

async fn handle_message(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(inbound) = to_inbound(&msg, state.me) else {
        return Ok(());
    };
    debug!(chat_id = %inbound.chat_id, msg_id = %inbound.msg_id, "telegram message received");

    if state.inbound.send(inbound).await.is_err() {
        warn!("dispatcher is gone; dropping telegram message");
    }
    Ok(())
}

/// Long-poll Telegram and forward every message to `inbound` until
/// `shutdown` is cancelled.
pub async fn run_polling(
    bot: Bot,
    inbound: mpsc::Sender<InboundMessage>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let me = match bot.get_me().await {
        Ok(me) => {
            info!(username = %me.username(), "telegram bot connected");
            Some(me.id)
        }
        Err(e) => {
            warn!(error = %e, "get_me failed; own messages cannot be recognized");
            None
        }
    };

    let state = Arc::new(AppState { inbound, me });
    let handler = dptree::entry().branch(Update::filter_message().endpoint(handle_message));

    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .default_handler(|_upd| async {})
        .build();

    tokio::select! {
        biased;

        _ = shutdown.cancelled() => {
            info!("shutdown signal received, stopping telegram polling");
        }
        _ = dispatcher.dispatch() => {
            warn!("telegram dispatcher exited unexpectedly");
        }
    }

    Ok(())
}

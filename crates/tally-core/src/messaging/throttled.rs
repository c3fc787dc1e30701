use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    domain::ChatId,
    errors::Error,
    messaging::{port::ReplyPort, types::OutboundReply},
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Minimum spacing between *any* outbound sends (global flood control).
    pub global_min_interval: Duration,
    /// Minimum spacing between sends to the same conversation.
    pub per_chat_min_interval: Duration,
    /// Longest a send may queue for its slot. Keep it below the caller's
    /// reply timeout so the send itself still has time to finish.
    pub max_wait: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(40),
            per_chat_min_interval: Duration::from_millis(1050),
            max_wait: Duration::from_secs(5),
        }
    }
}

/// Earliest instant the next send may start, globally and per chat.
#[derive(Debug)]
struct Schedule {
    global_next: Instant,
    per_chat_next: HashMap<ChatId, Instant>,
}

/// ReplyPort decorator that rate-limits outbound replies.
///
/// Bursts of arithmetic messages in one chat otherwise run straight into the
/// transport's per-chat limits (Telegram answers those with 429).
pub struct ThrottledReplier {
    inner: Arc<dyn ReplyPort>,
    cfg: ThrottleConfig,
    schedule: Mutex<Schedule>,
}

impl ThrottledReplier {
    pub fn new(inner: Arc<dyn ReplyPort>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            schedule: Mutex::new(Schedule {
                global_next: Instant::now(),
                per_chat_next: HashMap::new(),
            }),
        }
    }

    /// Reserve a send slot for `chat_id` and return how long to wait for it.
    ///
    /// A slot further out than `max_wait` is not reserved; the send fails as a
    /// timeout and the message is retried on redelivery.
    async fn reserve(&self, chat_id: &ChatId) -> Result<Duration> {
        let mut schedule = self.schedule.lock().await;
        let now = Instant::now();

        // Chats whose spacing has elapsed behave exactly like unseen ones.
        schedule.per_chat_next.retain(|_, next| *next > now);

        let chat_next = schedule.per_chat_next.get(chat_id).copied().unwrap_or(now);
        let start = now.max(schedule.global_next).max(chat_next);
        let wait = start - now;
        if wait > self.cfg.max_wait {
            return Err(Error::Timeout("reply throttle"));
        }

        schedule.global_next = start + self.cfg.global_min_interval;
        schedule
            .per_chat_next
            .insert(chat_id.clone(), start + self.cfg.per_chat_min_interval);
        Ok(wait)
    }

    #[cfg(test)]
    async fn tracked_chats(&self) -> usize {
        self.schedule.lock().await.per_chat_next.len()
    }
}

#[async_trait::async_trait]
impl ReplyPort for ThrottledReplier {
    async fn send_reply(&self, reply: &OutboundReply) -> Result<()> {
        let wait = self.reserve(&reply.chat_id).await?;
        if wait > Duration::ZERO {
            sleep(wait).await;
        }
        self.inner.send_reply(reply).await
    }
}

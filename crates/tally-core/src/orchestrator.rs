//! Per-message state machine.
//!
//! ```text
//! RECEIVED -> SKIPPED | DUPLICATE | COMMAND | ARITHMETIC | INVALID
//! ```
//!
//! Every branch except SKIPPED and DUPLICATE ends by marking the message
//! processed, and only after its reply went out. A transient failure returns
//! `Err` before that point so a redelivered copy starts over; mutations are
//! recorded per message (`LedgerStore::apply_once`) so the restart never
//! applies them twice.

use std::{future::Future, sync::Arc};

use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::{
    audit::{AuditEvent, AuditLogger},
    commands::{parse_command, Command, CommandError},
    config::{ContinuationMode, InvalidInputPolicy, LedgerSettings},
    domain::MessageKey,
    errors::Error,
    expression::{resolve, validate, ExprError, ExpressionKind},
    formatting::{
        arithmetic_reply, reset_reply, set_reply, total_reply, BAD_NUMBER_REPLY, INVALID_REPLY,
        NO_TOTAL_REPLY,
    },
    ledger::{Applied, LedgerOp},
    messaging::{
        port::ReplyPort,
        types::{InboundMessage, OutboundReply},
    },
    ports::{DedupStore, LedgerStore, RenderReply},
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    FromMe,
    MissingIds,
    EmptyText,
}

/// Terminal state of one inbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Skipped(SkipReason),
    Duplicate,
    Command {
        reply: String,
        replayed: bool,
    },
    Arithmetic {
        reply: String,
        replayed: bool,
    },
    /// `reply` is `None` under the silent policy.
    Invalid {
        reply: Option<String>,
    },
}

impl Outcome {
    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::Skipped(_) => "skipped",
            Outcome::Duplicate => "duplicate",
            Outcome::Command { .. } => "command",
            Outcome::Arithmetic { .. } => "arithmetic",
            Outcome::Invalid { .. } => "invalid",
        }
    }
}

pub struct Orchestrator {
    settings: LedgerSettings,
    ledger: Arc<dyn LedgerStore>,
    dedup: Arc<dyn DedupStore>,
    replier: Arc<dyn ReplyPort>,
    audit: Option<AuditLogger>,
}

impl Orchestrator {
    pub fn new(
        settings: LedgerSettings,
        ledger: Arc<dyn LedgerStore>,
        dedup: Arc<dyn DedupStore>,
        replier: Arc<dyn ReplyPort>,
    ) -> Self {
        Self {
            settings,
            ledger,
            dedup,
            replier,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn settings(&self) -> &LedgerSettings {
        &self.settings
    }

    /// Drive one inbound message to its terminal state.
    ///
    /// `Err` means a transient failure (store or transport) or an unexpected
    /// internal error; the message is then *not* marked processed.
    pub async fn handle(&self, msg: &InboundMessage) -> Result<Outcome> {
        if msg.from_me {
            return Ok(Outcome::Skipped(SkipReason::FromMe));
        }
        if msg.chat_id.0.is_empty() || msg.msg_id.0.is_empty() {
            return Ok(Outcome::Skipped(SkipReason::MissingIds));
        }
        let text = msg.text.trim();
        if text.is_empty() {
            return Ok(Outcome::Skipped(SkipReason::EmptyText));
        }

        let key = msg.key();
        if self
            .store_call("dedup check", self.dedup.has_processed(&key))
            .await?
        {
            return Ok(Outcome::Duplicate);
        }

        let outcome = match parse_command(text, &self.settings.commands) {
            Some(Ok(cmd)) => self.run_command(&key, text, cmd).await?,
            Some(Err(e @ CommandError::BadNumber(_))) => {
                self.reject(&key, text, BAD_NUMBER_REPLY, e.to_string())
                    .await?
            }
            None => self.run_arithmetic(&key, text).await?,
        };

        debug!(
            chat_id = %key.chat_id,
            msg_id = %key.msg_id,
            outcome = outcome.kind(),
            "message handled"
        );
        Ok(outcome)
    }

    async fn run_command(&self, key: &MessageKey, text: &str, cmd: Command) -> Result<Outcome> {
        let fmt = &self.settings.number_format;

        let applied = match cmd {
            Command::Total => {
                let total = self
                    .store_call("ledger get", self.ledger.get(&key.chat_id))
                    .await?
                    .unwrap_or(Decimal::ZERO);
                Applied {
                    total,
                    reply: total_reply(fmt, total),
                    replayed: false,
                }
            }
            Command::Reset => {
                let render = |total: Decimal| reset_reply(fmt, total);
                self.mutate(key, LedgerOp::Reset, &render).await?
            }
            Command::Set(value) => {
                let render = |total: Decimal| set_reply(fmt, total);
                match self.mutate(key, LedgerOp::Set(value), &render).await {
                    Err(e @ Error::Arithmetic(_)) => {
                        return self.reject(key, text, BAD_NUMBER_REPLY, e.to_string()).await
                    }
                    other => other?,
                }
            }
        };

        self.deliver(key, &applied.reply).await?;
        self.audit(
            AuditEvent::new("command", key)
                .input(text)
                .total(Some(applied.total)),
        );
        Ok(Outcome::Command {
            reply: applied.reply,
            replayed: applied.replayed,
        })
    }

    async fn run_arithmetic(&self, key: &MessageKey, text: &str) -> Result<Outcome> {
        let candidate = match validate(text) {
            Ok(c) => c,
            Err(e) => return self.reject_expr(key, text, e).await,
        };

        let current = match candidate.kind {
            ExpressionKind::Continuation => {
                self.store_call("ledger get", self.ledger.get(&key.chat_id))
                    .await?
            }
            ExpressionKind::Standalone => None,
        };

        let resolved = match resolve(candidate.text, current) {
            Ok(r) => r,
            Err(e) => return self.reject_expr(key, text, e).await,
        };

        let op = match (resolved.kind, self.settings.continuation) {
            (ExpressionKind::Continuation, ContinuationMode::Replace) => {
                LedgerOp::Set(resolved.value)
            }
            _ => LedgerOp::Add(resolved.value),
        };

        let fmt = &self.settings.number_format;
        let render =
            |total: Decimal| arithmetic_reply(fmt, &resolved.expression, resolved.value, total);
        let applied = match self.mutate(key, op, &render).await {
            Ok(a) => a,
            Err(e @ Error::Arithmetic(_)) => {
                return self.reject(key, text, INVALID_REPLY, e.to_string()).await
            }
            Err(e) => return Err(e),
        };

        self.deliver(key, &applied.reply).await?;
        self.audit(
            AuditEvent::new("arithmetic", key)
                .input(&resolved.expression)
                .total(Some(applied.total)),
        );
        Ok(Outcome::Arithmetic {
            reply: applied.reply,
            replayed: applied.replayed,
        })
    }

    async fn reject_expr(&self, key: &MessageKey, text: &str, err: ExprError) -> Result<Outcome> {
        let reply = match err {
            ExprError::NoPreviousTotal => NO_TOTAL_REPLY,
            _ => INVALID_REPLY,
        };
        self.reject(key, text, reply, err.to_string()).await
    }

    /// Terminal rejection: optional reply (per policy), then mark.
    async fn reject(
        &self,
        key: &MessageKey,
        text: &str,
        reply_text: &str,
        reason: String,
    ) -> Result<Outcome> {
        let reply = match self.settings.invalid_input {
            InvalidInputPolicy::Silent => None,
            InvalidInputPolicy::Reply => Some(reply_text.to_string()),
        };

        match &reply {
            Some(text) => self.deliver(key, text).await?,
            None => {
                self.store_call("dedup mark", self.dedup.mark_processed(key))
                    .await?
            }
        }

        debug!(chat_id = %key.chat_id, msg_id = %key.msg_id, %reason, "rejected input");
        self.audit(AuditEvent::new("invalid", key).input(text).reason(reason));
        Ok(Outcome::Invalid { reply })
    }

    async fn mutate(
        &self,
        key: &MessageKey,
        op: LedgerOp,
        render: RenderReply<'_>,
    ) -> Result<Applied> {
        let applied = self
            .store_call("ledger apply", self.ledger.apply_once(key, op, render))
            .await?;
        if applied.replayed {
            debug!(
                chat_id = %key.chat_id,
                msg_id = %key.msg_id,
                op = op.name(),
                "mutation already applied; re-sending recorded reply"
            );
        }
        Ok(applied)
    }

    /// Send the reply, then mark the message processed.
    async fn deliver(&self, key: &MessageKey, text: &str) -> Result<()> {
        let reply = OutboundReply {
            chat_id: key.chat_id.clone(),
            text: text.to_string(),
            quoted: Some(key.msg_id.clone()),
        };
        match tokio::time::timeout(self.settings.reply_timeout, self.replier.send_reply(&reply))
            .await
        {
            Ok(res) => res?,
            Err(_) => return Err(Error::Timeout("send reply")),
        }

        if let Err(e) = self
            .store_call("dedup mark", self.dedup.mark_processed(key))
            .await
        {
            warn!(
                chat_id = %key.chat_id,
                msg_id = %key.msg_id,
                error = %e,
                "reply sent but message not marked; a redelivery will repeat the reply"
            );
            return Err(e);
        }
        Ok(())
    }

    async fn store_call<T>(
        &self,
        what: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.settings.store_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout(what)),
        }
    }

    fn audit(&self, event: AuditEvent) {
        let Some(audit) = &self.audit else {
            return;
        };
        if let Err(e) = audit.write(event) {
            warn!(path = %audit.path().display(), error = %e, "audit write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{domain::ChatId, store::memory::MemoryStore};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    #[derive(Default)]
    struct FakeReplier {
        sends: Mutex<Vec<OutboundReply>>,
        fail_next: AtomicUsize,
    }

    impl FakeReplier {
        fn failing(times: usize) -> Self {
            Self {
                fail_next: AtomicUsize::new(times),
                ..Self::default()
            }
        }

        fn sent(&self) -> Vec<String> {
            self.sends
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.text.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ReplyPort for FakeReplier {
        async fn send_reply(&self, reply: &OutboundReply) -> Result<()> {
            let left = self.fail_next.load(Ordering::SeqCst);
            if left > 0 {
                self.fail_next.store(left - 1, Ordering::SeqCst);
                return Err(Error::Transport("connection reset".to_string()));
            }
            self.sends.lock().unwrap().push(reply.clone());
            Ok(())
        }
    }

    /// Dedup store whose calls never complete.
    struct StalledDedup;

    #[async_trait]
    impl DedupStore for StalledDedup {
        async fn has_processed(&self, _key: &MessageKey) -> Result<bool> {
            std::future::pending::<()>().await;
            Ok(false)
        }

        async fn mark_processed(&self, _key: &MessageKey) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    struct Harness {
        orch: Orchestrator,
        store: Arc<MemoryStore>,
        replier: Arc<FakeReplier>,
    }

    impl Harness {
        fn with(settings: LedgerSettings, replier: FakeReplier) -> Self {
            let store = Arc::new(MemoryStore::new(settings.number_format.scale));
            let replier = Arc::new(replier);
            let orch = Orchestrator::new(settings, store.clone(), store.clone(), replier.clone());
            Self {
                orch,
                store,
                replier,
            }
        }

        fn new() -> Self {
            Self::with(LedgerSettings::default(), FakeReplier::default())
        }

        fn replying() -> Self {
            Self::with(
                LedgerSettings {
                    invalid_input: InvalidInputPolicy::Reply,
                    ..LedgerSettings::default()
                },
                FakeReplier::default(),
            )
        }

        async fn send(&self, chat: &str, id: &str, text: &str) -> Result<Outcome> {
            self.orch.handle(&InboundMessage::new(chat, id, text)).await
        }

        async fn total(&self, chat: &str) -> Option<Decimal> {
            self.store.get(&ChatId(chat.to_string())).await.unwrap()
        }

        async fn processed(&self, chat: &str, id: &str) -> bool {
            self.store
                .has_processed(&MessageKey::new(chat, id))
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn standalone_expression_on_fresh_chat_sets_total() {
        let h = Harness::new();
        let out = h.send("c", "1", "12.5 * 2").await.unwrap();
        assert_eq!(
            out,
            Outcome::Arithmetic {
                reply: "12.5 * 2 = 25.00\nRunning total: 25.00".to_string(),
                replayed: false,
            }
        );
        assert_eq!(h.total("c").await, Some(dec!(25)));
        assert!(h.processed("c", "1").await);
    }

    #[tokio::test]
    async fn continuation_matches_spelled_out_expression() {
        let h = Harness::new();
        h.send("a", "1", "set 10").await.unwrap();
        h.send("b", "1", "set 10").await.unwrap();

        h.send("a", "2", "+ 5 * 2").await.unwrap();
        h.send("b", "2", "10 + 5 * 2").await.unwrap();

        assert_eq!(h.total("a").await, h.total("b").await);
        assert_eq!(h.total("a").await, Some(dec!(30)));
        assert!(h.replier.sent()[2].starts_with("10+ 5 * 2 = 20.00"));
    }

    #[tokio::test]
    async fn continuation_replace_mode_sets_total() {
        let h = Harness::with(
            LedgerSettings {
                continuation: ContinuationMode::Replace,
                ..LedgerSettings::default()
            },
            FakeReplier::default(),
        );
        h.send("c", "1", "set 10").await.unwrap();
        h.send("c", "2", "*2").await.unwrap();
        assert_eq!(h.total("c").await, Some(dec!(20)));

        // Standalone expressions still add.
        h.send("c", "3", "1+1").await.unwrap();
        assert_eq!(h.total("c").await, Some(dec!(22)));
    }

    #[tokio::test]
    async fn redelivery_is_dropped_without_mutation_or_reply() {
        let h = Harness::new();
        h.send("c", "1", "5 + 5").await.unwrap();
        let again = h.send("c", "1", "5 + 5").await.unwrap();

        assert_eq!(again, Outcome::Duplicate);
        assert_eq!(h.total("c").await, Some(dec!(10)));
        assert_eq!(h.replier.sent().len(), 1);
    }

    #[tokio::test]
    async fn invalid_input_is_silent_by_default_but_marked() {
        let h = Harness::new();
        for (id, text) in [("1", "hello"), ("2", "1 + "), ("3", "42"), ("4", "+5")] {
            let out = h.send("c", id, text).await.unwrap();
            assert_eq!(out, Outcome::Invalid { reply: None }, "{text}");
            assert!(h.processed("c", id).await);
        }
        assert!(h.replier.sent().is_empty());
        assert_eq!(h.total("c").await, None);
    }

    #[tokio::test]
    async fn invalid_input_reply_policy() {
        let h = Harness::replying();
        let out = h.send("c", "1", "1 + ").await.unwrap();
        assert_eq!(
            out,
            Outcome::Invalid {
                reply: Some(INVALID_REPLY.to_string())
            }
        );

        h.send("c", "2", "* 3").await.unwrap();
        h.send("c", "3", "set abc").await.unwrap();
        h.send("c", "4", "7 / 0").await.unwrap();
        assert_eq!(
            h.replier.sent(),
            vec![INVALID_REPLY, NO_TOTAL_REPLY, BAD_NUMBER_REPLY, INVALID_REPLY]
        );
        assert_eq!(h.total("c").await, None);
    }

    #[tokio::test]
    async fn total_beyond_fixed_precision_is_rejected() {
        let h = Harness::replying();
        let out = h
            .send("c", "1", "79228162514264337593543950335 + 0")
            .await
            .unwrap();
        assert_eq!(
            out,
            Outcome::Invalid {
                reply: Some(INVALID_REPLY.to_string())
            }
        );

        h.send("c", "2", "set 79228162514264337593543950335").await.unwrap();
        assert_eq!(h.replier.sent(), vec![INVALID_REPLY, BAD_NUMBER_REPLY]);
        assert_eq!(h.total("c").await, None);
        assert!(h.processed("c", "1").await);
    }

    #[tokio::test]
    async fn skipped_messages_are_not_marked() {
        let h = Harness::new();
        let mut mine = InboundMessage::new("c", "1", "1+1");
        mine.from_me = true;
        assert_eq!(
            h.orch.handle(&mine).await.unwrap(),
            Outcome::Skipped(SkipReason::FromMe)
        );
        assert_eq!(
            h.send("c", "2", "   ").await.unwrap(),
            Outcome::Skipped(SkipReason::EmptyText)
        );
        assert_eq!(
            h.send("c", "", "1+1").await.unwrap(),
            Outcome::Skipped(SkipReason::MissingIds)
        );
        assert!(!h.processed("c", "1").await);
        assert!(!h.processed("c", "2").await);
        assert_eq!(h.total("c").await, None);
    }

    #[tokio::test]
    async fn commands() {
        let h = Harness::new();
        let total = h.send("c", "1", "total").await.unwrap();
        assert_eq!(
            total,
            Outcome::Command {
                reply: "Total: 0.00".to_string(),
                replayed: false
            }
        );

        h.send("c", "2", "Set 42.5").await.unwrap();
        assert_eq!(h.total("c").await.unwrap().to_string(), "42.50");

        h.send("c", "3", "reset").await.unwrap();
        assert_eq!(h.total("c").await.unwrap().to_string(), "0.00");

        assert_eq!(
            h.replier.sent(),
            vec!["Total: 0.00", "Total set to 42.50", "Total reset to 0.00"]
        );
    }

    #[tokio::test]
    async fn failed_reply_leaves_message_unmarked_and_is_resent_once() {
        let h = Harness::with(LedgerSettings::default(), FakeReplier::failing(1));

        let err = h.send("c", "1", "2 + 3").await.unwrap_err();
        assert!(err.is_transient());
        assert!(!h.processed("c", "1").await);
        assert_eq!(h.total("c").await, Some(dec!(5)));

        let out = h.send("c", "1", "2 + 3").await.unwrap();
        assert_eq!(
            out,
            Outcome::Arithmetic {
                reply: "2 + 3 = 5.00\nRunning total: 5.00".to_string(),
                replayed: true
            }
        );
        assert_eq!(h.total("c").await, Some(dec!(5)));
        assert_eq!(h.replier.sent().len(), 1);
        assert!(h.processed("c", "1").await);

        assert_eq!(h.send("c", "1", "2 + 3").await.unwrap(), Outcome::Duplicate);
    }

    #[tokio::test]
    async fn negative_totals_use_marker_and_label() {
        let mut settings = LedgerSettings::default();
        settings.number_format.labels = Some(crate::formatting::SignLabels::default());
        let h = Harness::with(settings, FakeReplier::default());

        h.send("c", "1", "0 - 5").await.unwrap();
        assert_eq!(
            h.replier.sent(),
            vec!["0 - 5 = \u{2212}5.00 (advance)\nRunning total: \u{2212}5.00 (advance)"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_store_times_out_as_transient() {
        let store = Arc::new(MemoryStore::new(2));
        let replier = Arc::new(FakeReplier::default());
        let orch = Orchestrator::new(
            LedgerSettings::default(),
            store.clone(),
            Arc::new(StalledDedup),
            replier.clone(),
        );

        let err = orch
            .handle(&InboundMessage::new("c", "1", "1 + 1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout("dedup check")));
        assert!(err.is_transient());
        assert!(replier.sent().is_empty());
        assert_eq!(store.get(&ChatId("c".to_string())).await.unwrap(), None);
    }

    #[tokio::test]
    async fn outcomes_are_audited() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let store = Arc::new(MemoryStore::new(2));
        let orch = Orchestrator::new(
            LedgerSettings::default(),
            store.clone(),
            store,
            Arc::new(FakeReplier::default()),
        )
        .with_audit(AuditLogger::new(&path, true));

        orch.handle(&InboundMessage::new("c", "1", "1 + 1")).await.unwrap();
        orch.handle(&InboundMessage::new("c", "2", "hello")).await.unwrap();

        let lines = std::fs::read_to_string(&path).unwrap();
        let kinds: Vec<String> = lines
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["outcome"].to_string())
            .collect();
        assert_eq!(kinds, vec!["\"arithmetic\"", "\"invalid\""]);
    }
}

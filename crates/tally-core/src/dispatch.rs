//! Keyed dispatcher: one sequential worker per conversation.
//!
//! Messages of the same chat are handled strictly in arrival order by a single
//! worker task; different chats proceed in parallel. Workers that sat idle for
//! `idle_timeout` are retired by the router (never by themselves), so a chat
//! can never have two live workers at once.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{sync::mpsc, time::Instant};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{domain::ChatId, messaging::types::InboundMessage, orchestrator::Orchestrator};

#[derive(Clone, Copy, Debug)]
pub struct DispatcherConfig {
    pub idle_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
        }
    }
}

struct Worker {
    tx: mpsc::UnboundedSender<InboundMessage>,
    /// Messages routed to the worker and not yet finished.
    pending: Arc<AtomicUsize>,
    last_used: Instant,
}

/// Live workers keyed by chat.
struct WorkerSet {
    orchestrator: Arc<Orchestrator>,
    workers: HashMap<ChatId, Worker>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl WorkerSet {
    fn new(orchestrator: Arc<Orchestrator>, shutdown: CancellationToken) -> Self {
        Self {
            orchestrator,
            workers: HashMap::new(),
            tracker: TaskTracker::new(),
            shutdown,
        }
    }

    fn len(&self) -> usize {
        self.workers.len()
    }

    fn route(&mut self, msg: InboundMessage) {
        let chat_id = msg.chat_id.clone();

        let msg = match self.workers.get_mut(&chat_id) {
            Some(worker) => {
                worker.pending.fetch_add(1, Ordering::SeqCst);
                worker.last_used = Instant::now();
                match worker.tx.send(msg) {
                    Ok(()) => return,
                    Err(mpsc::error::SendError(msg)) => {
                        // Worker task is gone (it panicked); start a fresh one.
                        warn!(chat_id = %chat_id, "chat worker died; restarting");
                        self.workers.remove(&chat_id);
                        msg
                    }
                }
            }
            None => msg,
        };

        let worker = self.spawn(chat_id.clone());
        worker.pending.fetch_add(1, Ordering::SeqCst);
        // The receiver was created just now and cannot be closed yet.
        let _ = worker.tx.send(msg);
        self.workers.insert(chat_id, worker);
    }

    fn spawn(&self, chat_id: ChatId) -> Worker {
        let (tx, mut rx) = mpsc::unbounded_channel::<InboundMessage>();
        let pending = Arc::new(AtomicUsize::new(0));

        let orchestrator = self.orchestrator.clone();
        let shutdown = self.shutdown.clone();
        let counter = pending.clone();
        debug!(chat_id = %chat_id, "starting chat worker");

        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => break,

                    msg = rx.recv() => {
                        let Some(msg) = msg else { break };
                        handle_one(&orchestrator, &msg).await;
                        counter.fetch_sub(1, Ordering::SeqCst);
                    }
                }
            }
            debug!(chat_id = %chat_id, "chat worker stopped");
        });

        Worker {
            tx,
            pending,
            last_used: Instant::now(),
        }
    }

    /// Retire workers with nothing queued that have been idle for `idle`.
    fn reap(&mut self, idle: Duration) {
        let now = Instant::now();
        let before = self.workers.len();
        self.workers.retain(|_, w| {
            w.pending.load(Ordering::SeqCst) > 0 || now.duration_since(w.last_used) < idle
        });
        let reaped = before - self.workers.len();
        if reaped > 0 {
            debug!(reaped, active = self.workers.len(), "retired idle chat workers");
        }
    }

    /// Close every worker's queue and wait for the tasks to exit.
    async fn finish(mut self) {
        self.workers.clear();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

async fn handle_one(orchestrator: &Orchestrator, msg: &InboundMessage) {
    match orchestrator.handle(msg).await {
        Ok(_) => {}
        Err(e) if e.is_transient() => warn!(
            chat_id = %msg.chat_id,
            msg_id = %msg.msg_id,
            error = %e,
            "transient failure; message left unmarked for redelivery"
        ),
        Err(e) => error!(
            chat_id = %msg.chat_id,
            msg_id = %msg.msg_id,
            error = %e,
            "message handling failed"
        ),
    }
}

pub struct Dispatcher {
    orchestrator: Arc<Orchestrator>,
    cfg: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(orchestrator: Arc<Orchestrator>, cfg: DispatcherConfig) -> Self {
        Self { orchestrator, cfg }
    }

    /// Route inbound messages until `shutdown` is cancelled or the inbound
    /// channel closes.
    ///
    /// On cancellation each worker finishes the message it is handling and
    /// leaves the rest of its queue unhandled (and unmarked). When the channel
    /// closes instead, workers drain their queues before exiting.
    pub async fn run(self, mut rx: mpsc::Receiver<InboundMessage>, shutdown: CancellationToken) {
        let mut workers = WorkerSet::new(self.orchestrator, shutdown.clone());

        let sweep_every = (self.cfg.idle_timeout / 2).max(Duration::from_millis(100));
        let mut sweep = tokio::time::interval(sweep_every);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(idle_timeout = ?self.cfg.idle_timeout, "dispatcher ready");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("dispatcher shutting down");
                    break;
                }

                msg = rx.recv() => match msg {
                    Some(msg) => workers.route(msg),
                    None => {
                        info!("inbound channel closed, dispatcher draining");
                        break;
                    }
                },

                _ = sweep.tick() => workers.reap(self.cfg.idle_timeout),
            }
        }

        debug!(active = workers.len(), "waiting for chat workers");
        workers.finish().await;
        info!("dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::LedgerSettings,
        domain::MessageKey,
        messaging::{port::ReplyPort, types::OutboundReply},
        ports::{DedupStore, LedgerStore},
        store::memory::MemoryStore,
        Result,
    };
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct RecordingReplier {
        sends: Mutex<Vec<OutboundReply>>,
    }

    #[async_trait]
    impl ReplyPort for RecordingReplier {
        async fn send_reply(&self, reply: &OutboundReply) -> Result<()> {
            self.sends.lock().unwrap().push(reply.clone());
            Ok(())
        }
    }

    /// Blocks every send until released, announcing each one.
    #[derive(Default)]
    struct GatedReplier {
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl ReplyPort for GatedReplier {
        async fn send_reply(&self, _reply: &OutboundReply) -> Result<()> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    fn orchestrator(store: &Arc<MemoryStore>, replier: Arc<dyn ReplyPort>) -> Arc<Orchestrator> {
        Arc::new(Orchestrator::new(
            LedgerSettings::default(),
            store.clone(),
            store.clone(),
            replier,
        ))
    }

    fn chat(id: &str) -> ChatId {
        ChatId(id.to_string())
    }

    #[tokio::test]
    async fn same_chat_messages_accumulate_in_order() {
        let store = Arc::new(MemoryStore::new(2));
        let replier = Arc::new(RecordingReplier::default());
        let dispatcher = Dispatcher::new(
            orchestrator(&store, replier.clone()),
            DispatcherConfig::default(),
        );

        let (tx, rx) = mpsc::channel(64);
        let run = tokio::spawn(dispatcher.run(rx, CancellationToken::new()));

        for i in 1..=50 {
            tx.send(InboundMessage::new("c", i.to_string(), format!("0 + {i}")))
                .await
                .unwrap();
            tx.send(InboundMessage::new("other", i.to_string(), "1 + 1"))
                .await
                .unwrap();
        }
        drop(tx);
        run.await.unwrap();

        assert_eq!(store.get(&chat("c")).await.unwrap(), Some(dec!(1275)));
        assert_eq!(store.get(&chat("other")).await.unwrap(), Some(dec!(100)));

        // Replies of one chat come out in arrival order.
        let totals: Vec<String> = replier
            .sends
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.chat_id == chat("c"))
            .map(|r| r.text.lines().last().unwrap_or_default().to_string())
            .collect();
        assert_eq!(totals.len(), 50);
        assert_eq!(totals[0], "Running total: 1.00");
        assert_eq!(totals[49], "Running total: 1,275.00");
    }

    #[tokio::test]
    async fn shutdown_finishes_in_flight_and_leaves_queue_unmarked() {
        let store = Arc::new(MemoryStore::new(2));
        let replier = Arc::new(GatedReplier::default());
        let dispatcher = Dispatcher::new(
            orchestrator(&store, replier.clone()),
            DispatcherConfig::default(),
        );

        let (tx, rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let run = tokio::spawn(dispatcher.run(rx, shutdown.clone()));

        for id in ["1", "2", "3"] {
            tx.send(InboundMessage::new("c", id, "2 + 2")).await.unwrap();
        }

        replier.started.notified().await;
        shutdown.cancel();
        replier.release.notify_one();
        run.await.unwrap();

        let done = MessageKey::new("c", "1");
        assert!(store.has_processed(&done).await.unwrap());
        for id in ["2", "3"] {
            assert!(!store.has_processed(&MessageKey::new("c", id)).await.unwrap());
        }
        assert_eq!(store.get(&chat("c")).await.unwrap(), Some(dec!(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_workers_are_reaped_and_recreated() {
        let store = Arc::new(MemoryStore::new(2));
        let orch = orchestrator(&store, Arc::new(RecordingReplier::default()));
        let mut workers = WorkerSet::new(orch, CancellationToken::new());
        let idle = Duration::from_secs(60);

        workers.route(InboundMessage::new("c", "1", "1 + 1"));
        while store.get(&chat("c")).await.unwrap().is_none() {
            tokio::task::yield_now().await;
        }
        while workers.workers[&chat("c")].pending.load(Ordering::SeqCst) > 0 {
            tokio::task::yield_now().await;
        }

        workers.reap(idle);
        assert_eq!(workers.len(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        workers.reap(idle);
        assert_eq!(workers.len(), 0);

        workers.route(InboundMessage::new("c", "2", "3 + 3"));
        assert_eq!(workers.len(), 1);
        workers.finish().await;

        assert_eq!(store.get(&chat("c")).await.unwrap(), Some(dec!(8)));
    }
}

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tally_core::{
    audit::AuditLogger,
    config::{Config, StoreTarget, TransportKind},
    dispatch::{Dispatcher, DispatcherConfig},
    messaging::{
        port::ReplyPort,
        throttled::{ThrottleConfig, ThrottledReplier},
    },
    orchestrator::Orchestrator,
    ports::{DedupStore, LedgerStore},
    store::memory::MemoryStore,
    Error, Result,
};
use tally_sqlite::SqliteStore;
use tally_telegram::TelegramMessenger;

mod console;

const INBOUND_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    tally_core::logging::init("tally")?;

    let cfg = Config::load()?;
    info!(
        session = %cfg.session_label,
        transport = ?cfg.transport,
        decimals = cfg.ledger.number_format.scale,
        continuation = ?cfg.ledger.continuation,
        "starting"
    );

    let (ledger, dedup) = open_store(&cfg).await?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
            }
            shutdown.cancel();
        });
    }

    let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);

    let (replier, transport): (Arc<dyn ReplyPort>, _) = match cfg.transport {
        TransportKind::Telegram => {
            let token = cfg
                .telegram_bot_token
                .clone()
                .ok_or_else(|| Error::Config("TELEGRAM_BOT_TOKEN is required".to_string()))?;
            let bot = teloxide::Bot::new(token);

            let raw: Arc<dyn ReplyPort> = Arc::new(TelegramMessenger::new(bot.clone()));
            let replier: Arc<dyn ReplyPort> = Arc::new(ThrottledReplier::new(
                raw,
                ThrottleConfig {
                    per_chat_min_interval: cfg.reply_min_interval,
                    max_wait: cfg.ledger.reply_timeout / 2,
                    ..ThrottleConfig::default()
                },
            ));

            let shutdown = shutdown.clone();
            let task = tokio::spawn(async move {
                tally_telegram::router::run_polling(bot, tx, shutdown)
                    .await
                    .map_err(|e| Error::Transport(format!("telegram polling failed: {e}")))
            });
            (replier, task)
        }
        TransportKind::Console => {
            let started = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis();
            let session = format!("{}-{started}", cfg.session_label);
            let shutdown = shutdown.clone();
            let task = tokio::spawn(async move {
                let stdin = tokio::io::BufReader::new(tokio::io::stdin());
                console::run_console(stdin, &session, tx, shutdown).await
            });
            (Arc::new(console::ConsoleReplier) as Arc<dyn ReplyPort>, task)
        }
    };

    let mut orchestrator = Orchestrator::new(cfg.ledger.clone(), ledger.clone(), dedup, replier);
    if let Some(path) = &cfg.audit_log_path {
        info!(path = %path.display(), json = cfg.audit_log_json, "audit log enabled");
        orchestrator = orchestrator.with_audit(AuditLogger::new(path.clone(), cfg.audit_log_json));
    }

    let dispatcher = Dispatcher::new(
        Arc::new(orchestrator),
        DispatcherConfig {
            idle_timeout: cfg.worker_idle,
        },
    );
    dispatcher.run(rx, shutdown.clone()).await;

    // The dispatcher also stops when the transport closes its side; make sure
    // the transport stops too before the store goes away.
    shutdown.cancel();
    match transport.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "transport stopped with an error"),
        Err(e) => error!(error = %e, "transport task panicked"),
    }

    ledger.close().await;
    info!("stopped");
    Ok(())
}

async fn open_store(cfg: &Config) -> Result<(Arc<dyn LedgerStore>, Arc<dyn DedupStore>)> {
    let scale = cfg.ledger.number_format.scale;
    match &cfg.store {
        StoreTarget::Sqlite(url) => {
            let mut store = SqliteStore::open(url, scale).await?;
            if let Some(retention) = cfg.dedup_retention {
                store = store.with_dedup_retention(retention);
            }
            let store = Arc::new(store);
            let ledger: Arc<dyn LedgerStore> = store.clone();
            let dedup: Arc<dyn DedupStore> = store;
            Ok((ledger, dedup))
        }
        StoreTarget::Memory => {
            warn!(
                "in-memory store selected: totals and dedup markers are lost on restart, \
                 and messages redelivered after a restart will be applied again"
            );
            let mut store = MemoryStore::new(scale);
            if let Some(retention) = cfg.dedup_retention {
                store = store.with_dedup_retention(retention);
            }
            let store = Arc::new(store);
            let ledger: Arc<dyn LedgerStore> = store.clone();
            let dedup: Arc<dyn DedupStore> = store;
            Ok((ledger, dedup))
        }
    }
}

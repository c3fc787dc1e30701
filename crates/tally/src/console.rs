//! Console transport: one line of stdin is one message in a single local chat.

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tally_core::{
    messaging::{
        port::ReplyPort,
        types::{InboundMessage, OutboundReply},
    },
    Error, Result,
};

pub const CONSOLE_CHAT: &str = "console";

/// Prints replies to stdout.
pub struct ConsoleReplier;

#[async_trait]
impl ReplyPort for ConsoleReplier {
    async fn send_reply(&self, reply: &OutboundReply) -> Result<()> {
        let mut out = tokio::io::stdout();
        out.write_all(format!("{}\n", reply.text).as_bytes())
            .await
            .map_err(|e| Error::Transport(format!("stdout: {e}")))?;
        out.flush()
            .await
            .map_err(|e| Error::Transport(format!("stdout: {e}")))
    }
}

/// Forward lines from `input` until it closes or `shutdown` is cancelled.
///
/// Message ids are `<session>-<line number>` so a restarted console never
/// collides with markers left by an earlier run.
pub async fn run_console<R>(
    input: R,
    session: &str,
    inbound: mpsc::Sender<InboundMessage>,
    shutdown: CancellationToken,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    info!(session, "console transport started, one expression per line");
    let mut lines = input.lines();
    let mut seq = 0u64;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("console transport shutting down");
                break;
            }

            line = lines.next_line() => match line {
                Err(e) => {
                    warn!(error = %e, "console read error");
                    return Err(Error::Io(e));
                }
                Ok(None) => {
                    info!("console input closed");
                    break;
                }
                Ok(Some(line)) => {
                    seq += 1;
                    let msg = InboundMessage::new(CONSOLE_CHAT, format!("{session}-{seq}"), line);
                    debug!(msg_id = %msg.msg_id, "console line received");
                    if inbound.send(msg).await.is_err() {
                        warn!("dispatcher is gone; console transport exiting");
                        break;
                    }
                }
            },
        }
    }
    Ok(())
}

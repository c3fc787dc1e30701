use crate::expression::ExprError;

/// Core error type for the ledger bot.
///
/// Adapter crates map their specific errors (sqlx, teloxide) into this type so
/// the orchestrator can tell a definitive rejection from a failure worth retrying.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Expression(#[from] ExprError),

    #[error("arithmetic error: {0}")]
    Arithmetic(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out: {0}")]
    Timeout(&'static str),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Infrastructure failures that must leave a message unmarked so a redelivery can retry it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Store(_) | Error::Transport(_) | Error::Timeout(_) | Error::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

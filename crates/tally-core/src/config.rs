use std::{
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use crate::{
    commands::CommandTokens,
    errors::Error,
    formatting::{Grouping, NumberFormat, SignLabels},
    Result,
};

/// Largest accepted `DECIMALS` value.
pub const MAX_DECIMALS: u32 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    Telegram,
    Console,
}

/// Where totals and dedup markers are kept.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreTarget {
    /// `sqlite://...` URL handed to the SQLite store.
    Sqlite(String),
    /// Process-local store; dedup does not survive restarts.
    Memory,
}

/// What happens to text that is neither a command nor valid arithmetic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvalidInputPolicy {
    Silent,
    Reply,
}

/// How a continuation (`+5`, `*2`) changes the total.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContinuationMode {
    /// The evaluated value is added, like any other expression.
    Accumulate,
    /// The evaluated value becomes the new total.
    Replace,
}

/// Knobs of the ledger engine itself (everything the orchestrator needs).
#[derive(Clone, Debug)]
pub struct LedgerSettings {
    pub number_format: NumberFormat,
    pub commands: CommandTokens,
    pub invalid_input: InvalidInputPolicy,
    pub continuation: ContinuationMode,
    pub store_timeout: Duration,
    pub reply_timeout: Duration,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            number_format: NumberFormat::default(),
            commands: CommandTokens::default(),
            invalid_input: InvalidInputPolicy::Silent,
            continuation: ContinuationMode::Accumulate,
            store_timeout: Duration::from_millis(5_000),
            reply_timeout: Duration::from_millis(10_000),
        }
    }
}

/// Typed configuration for the bot process.
#[derive(Clone, Debug)]
pub struct Config {
    pub session_label: String,

    // Transport
    pub transport: TransportKind,
    pub telegram_bot_token: Option<String>,
    pub reply_min_interval: Duration,

    // Persistence
    pub store: StoreTarget,
    pub dedup_retention: Option<Duration>,

    // Engine
    pub ledger: LedgerSettings,
    pub worker_idle: Duration,

    // Audit
    pub audit_log_path: Option<PathBuf>,
    pub audit_log_json: bool,
}

impl Config {
    /// Read configuration from the environment (and `.env` if present).
    ///
    /// Any error here is fatal: the process must not start half-configured.
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(&env_str)
    }

    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).and_then(non_empty);

        let session_label = var("SESSION_LABEL").unwrap_or_else(|| "tally".to_string());

        let transport = match var("TALLY_TRANSPORT").map(|s| s.trim().to_lowercase()) {
            None => TransportKind::Telegram,
            Some(s) if s == "telegram" => TransportKind::Telegram,
            Some(s) if s == "console" => TransportKind::Console,
            Some(other) => {
                return Err(Error::Config(format!(
                    "TALLY_TRANSPORT must be `telegram` or `console`, got `{other}`"
                )))
            }
        };

        let telegram_bot_token = var("TELEGRAM_BOT_TOKEN");
        if transport == TransportKind::Telegram && telegram_bot_token.is_none() {
            return Err(Error::Config(
                "TELEGRAM_BOT_TOKEN environment variable is required".to_string(),
            ));
        }

        let store = match var("DATABASE_URL") {
            None => {
                return Err(Error::Config(
                    "DATABASE_URL environment variable is required (`memory` selects the non-persistent store)"
                        .to_string(),
                ))
            }
            Some(url) if url.trim().eq_ignore_ascii_case("memory") => StoreTarget::Memory,
            Some(url) if url.starts_with("sqlite:") => StoreTarget::Sqlite(url.trim().to_string()),
            Some(other) => {
                return Err(Error::Config(format!(
                    "unsupported DATABASE_URL `{other}` (expected sqlite://... or memory)"
                )))
            }
        };
        let dedup_retention = parse_u64(var("DEDUP_RETENTION_SECS"), "DEDUP_RETENTION_SECS")?
            .map(Duration::from_secs);

        // Number formatting
        let scale = parse_u64(var("DECIMALS"), "DECIMALS")?.unwrap_or(2);
        if scale > u64::from(MAX_DECIMALS) {
            return Err(Error::Config(format!(
                "DECIMALS must be between 0 and {MAX_DECIMALS}, got {scale}"
            )));
        }
        let grouping = var("NUMBER_GROUPING")
            .map(|s| Grouping::from_str(&s))
            .transpose()?
            .unwrap_or(Grouping::SouthAsian);
        let separator = match var("GROUP_SEPARATOR") {
            None => ',',
            Some(s) => single_char(&s, "GROUP_SEPARATOR")?,
        };
        let negative_marker = lookup("NEGATIVE_MARKER")
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "\u{2212}".to_string());
        let labels = parse_bool(var("SIGN_LABELS"), "SIGN_LABELS")?
            .unwrap_or(false)
            .then(SignLabels::default);

        let number_format = NumberFormat {
            scale: scale as u32,
            grouping,
            separator,
            negative_marker,
            labels,
        };

        // Commands
        let defaults = CommandTokens::default();
        let commands = CommandTokens {
            total: token(var("CMD_TOTAL")).unwrap_or(defaults.total),
            reset: token(var("CMD_RESET")).unwrap_or(defaults.reset),
            set: token(var("CMD_SET")).unwrap_or(defaults.set),
        };

        let invalid_input = match var("INVALID_INPUT").map(|s| s.trim().to_lowercase()) {
            None => InvalidInputPolicy::Silent,
            Some(s) if s == "silent" => InvalidInputPolicy::Silent,
            Some(s) if s == "reply" => InvalidInputPolicy::Reply,
            Some(other) => {
                return Err(Error::Config(format!(
                    "INVALID_INPUT must be `silent` or `reply`, got `{other}`"
                )))
            }
        };

        let continuation = match var("CONTINUATION_MODE").map(|s| s.trim().to_lowercase()) {
            None => ContinuationMode::Accumulate,
            Some(s) if s == "accumulate" => ContinuationMode::Accumulate,
            Some(s) if s == "replace" => ContinuationMode::Replace,
            Some(other) => {
                return Err(Error::Config(format!(
                    "CONTINUATION_MODE must be `accumulate` or `replace`, got `{other}`"
                )))
            }
        };

        // Timeouts and workers
        let store_timeout = Duration::from_millis(
            parse_u64(var("STORE_TIMEOUT_MS"), "STORE_TIMEOUT_MS")?.unwrap_or(5_000),
        );
        let reply_timeout = Duration::from_millis(
            parse_u64(var("REPLY_TIMEOUT_MS"), "REPLY_TIMEOUT_MS")?.unwrap_or(10_000),
        );
        let worker_idle =
            Duration::from_secs(parse_u64(var("WORKER_IDLE_SECS"), "WORKER_IDLE_SECS")?.unwrap_or(300));
        let reply_min_interval = Duration::from_millis(
            parse_u64(var("REPLY_MIN_INTERVAL_MS"), "REPLY_MIN_INTERVAL_MS")?.unwrap_or(1_050),
        );

        // Audit
        let audit_log_path = var("AUDIT_LOG_PATH").map(PathBuf::from);
        let audit_log_json = parse_bool(var("AUDIT_LOG_JSON"), "AUDIT_LOG_JSON")?.unwrap_or(true);

        Ok(Self {
            session_label,
            transport,
            telegram_bot_token,
            reply_min_interval,
            store,
            dedup_retention,
            ledger: LedgerSettings {
                number_format,
                commands,
                invalid_input,
                continuation,
                store_timeout,
                reply_timeout,
            },
            worker_idle,
            audit_log_path,
            audit_log_json,
        })
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        env::set_var(key, unquote(v.trim()));
    }
}

fn unquote(val: &str) -> &str {
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        return &val[1..val.len() - 1];
    }
    val
}

fn parse_bool(v: Option<String>, key: &str) -> Result<Option<bool>> {
    v.map(|s| match s.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("{key} must be true or false, got `{s}`"))),
    })
    .transpose()
}

fn parse_u64(v: Option<String>, key: &str) -> Result<Option<u64>> {
    v.map(|s| {
        s.trim()
            .parse::<u64>()
            .map_err(|_| Error::Config(format!("{key} must be a non-negative integer, got `{s}`")))
    })
    .transpose()
}

fn single_char(s: &str, key: &str) -> Result<char> {
    let mut chars = s.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(c),
        _ => Err(Error::Config(format!("{key} must be a single character, got `{s}`"))),
    }
}

fn token(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_lowercase()).and_then(non_empty)
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(&|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_with_minimal_console_setup() {
        let cfg = load(&[("TALLY_TRANSPORT", "console"), ("DATABASE_URL", "memory")]).unwrap();
        assert_eq!(cfg.transport, TransportKind::Console);
        assert_eq!(cfg.store, StoreTarget::Memory);
        assert_eq!(cfg.ledger.number_format, NumberFormat::default());
        assert_eq!(cfg.ledger.commands, CommandTokens::default());
        assert_eq!(cfg.ledger.invalid_input, InvalidInputPolicy::Silent);
        assert_eq!(cfg.ledger.continuation, ContinuationMode::Accumulate);
        assert_eq!(cfg.worker_idle, Duration::from_secs(300));
        assert!(cfg.audit_log_path.is_none());
    }

    #[test]
    fn missing_persistence_target_is_fatal() {
        let err = load(&[("TALLY_TRANSPORT", "console")]).unwrap_err();
        assert!(matches!(err, Error::Config(m) if m.contains("DATABASE_URL")));

        let err = load(&[("TALLY_TRANSPORT", "console"), ("DATABASE_URL", "postgres://x")])
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn telegram_requires_token() {
        let err = load(&[("DATABASE_URL", "sqlite://tally.db")]).unwrap_err();
        assert!(matches!(err, Error::Config(m) if m.contains("TELEGRAM_BOT_TOKEN")));

        let cfg = load(&[
            ("DATABASE_URL", "sqlite://tally.db"),
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
        ])
        .unwrap();
        assert_eq!(cfg.store, StoreTarget::Sqlite("sqlite://tally.db".to_string()));
    }

    #[test]
    fn engine_overrides() {
        let cfg = load(&[
            ("TALLY_TRANSPORT", "console"),
            ("DATABASE_URL", "memory"),
            ("DECIMALS", "3"),
            ("NUMBER_GROUPING", "thousands"),
            ("GROUP_SEPARATOR", "."),
            ("SIGN_LABELS", "yes"),
            ("INVALID_INPUT", "reply"),
            ("CONTINUATION_MODE", "replace"),
            ("CMD_TOTAL", " Balance "),
            ("STORE_TIMEOUT_MS", "250"),
        ])
        .unwrap();
        let fmt = &cfg.ledger.number_format;
        assert_eq!(fmt.scale, 3);
        assert_eq!(fmt.grouping, Grouping::Thousands);
        assert_eq!(fmt.separator, '.');
        assert_eq!(fmt.labels, Some(SignLabels::default()));
        assert_eq!(cfg.ledger.invalid_input, InvalidInputPolicy::Reply);
        assert_eq!(cfg.ledger.continuation, ContinuationMode::Replace);
        assert_eq!(cfg.ledger.commands.total, "balance");
        assert_eq!(cfg.ledger.store_timeout, Duration::from_millis(250));
    }

    #[test]
    fn rejects_malformed_values() {
        for (k, v) in [
            ("DECIMALS", "11"),
            ("DECIMALS", "two"),
            ("NUMBER_GROUPING", "roman"),
            ("GROUP_SEPARATOR", ",,"),
            ("INVALID_INPUT", "shout"),
            ("CONTINUATION_MODE", "sometimes"),
            ("TALLY_TRANSPORT", "carrier-pigeon"),
            ("SIGN_LABELS", "ture"),
            ("AUDIT_LOG_JSON", "maybe"),
        ] {
            let res = load(&[("TALLY_TRANSPORT", "console"), ("DATABASE_URL", "memory"), (k, v)]);
            assert!(res.is_err(), "{k}={v} should be rejected");
        }
    }

    #[test]
    fn boolean_spellings() {
        assert_eq!(parse_bool(Some(" Yes ".into()), "K").unwrap(), Some(true));
        assert_eq!(parse_bool(Some("off".into()), "K").unwrap(), Some(false));
        assert_eq!(parse_bool(None, "K").unwrap(), None);
        assert!(parse_bool(Some("2".into()), "K").is_err());
    }

    #[test]
    fn dotenv_values_are_unquoted() {
        assert_eq!(unquote("\"a b\""), "a b");
        assert_eq!(unquote("'x'"), "x");
        assert_eq!(unquote("plain"), "plain");
    }
}

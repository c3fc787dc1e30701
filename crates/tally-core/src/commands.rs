//! Recognition of the plain-word commands (`total`, `reset`, `set <n>`).

use std::str::FromStr;

use rust_decimal::Decimal;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandTokens {
    pub total: String,
    pub reset: String,
    pub set: String,
}

impl Default for CommandTokens {
    fn default() -> Self {
        Self {
            total: "total".to_string(),
            reset: "reset".to_string(),
            set: "set".to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Total,
    Reset,
    Set(Decimal),
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("could not parse number {0:?}")]
    BadNumber(String),
}

/// Match `text` against the command tokens (case-insensitive, surrounding whitespace ignored).
///
/// Returns `None` when the text is not a command at all, so the caller can try
/// arithmetic next.
pub fn parse_command(
    text: &str,
    tokens: &CommandTokens,
) -> Option<Result<Command, CommandError>> {
    let lower = text.trim().to_lowercase();

    if lower == tokens.total {
        return Some(Ok(Command::Total));
    }
    if lower == tokens.reset {
        return Some(Ok(Command::Reset));
    }
    if lower == tokens.set {
        return Some(Err(CommandError::BadNumber(String::new())));
    }

    let rest = lower.strip_prefix(tokens.set.as_str())?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let arg = rest.trim();
    Some(
        parse_amount(arg)
            .map(Command::Set)
            .ok_or_else(|| CommandError::BadNumber(arg.to_string())),
    )
}

/// Plain decimal, or scientific notation (`1e3`, `2.5e-1`).
fn parse_amount(arg: &str) -> Option<Decimal> {
    Decimal::from_str(arg)
        .or_else(|_| Decimal::from_scientific(arg))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn recognizes_commands_case_insensitively() {
        let t = CommandTokens::default();
        assert_eq!(parse_command(" Total ", &t), Some(Ok(Command::Total)));
        assert_eq!(parse_command("RESET", &t), Some(Ok(Command::Reset)));
        assert_eq!(parse_command("set 42.5", &t), Some(Ok(Command::Set(dec!(42.5)))));
        assert_eq!(parse_command("SET   -10", &t), Some(Ok(Command::Set(dec!(-10)))));
    }

    #[test]
    fn bad_set_argument_is_a_command_error() {
        let t = CommandTokens::default();
        assert_eq!(
            parse_command("set lots", &t),
            Some(Err(CommandError::BadNumber("lots".to_string())))
        );
        assert!(matches!(parse_command("set", &t), Some(Err(_))));
    }

    #[test]
    fn set_accepts_scientific_notation() {
        let t = CommandTokens::default();
        assert_eq!(parse_command("set 1e3", &t), Some(Ok(Command::Set(dec!(1000)))));
        assert_eq!(parse_command("SET 2.5E-1", &t), Some(Ok(Command::Set(dec!(0.25)))));
        assert_eq!(parse_command("set -4e2", &t), Some(Ok(Command::Set(dec!(-400)))));
        assert!(matches!(parse_command("set 1e", &t), Some(Err(_))));
    }

    #[test]
    fn other_text_is_not_a_command() {
        let t = CommandTokens::default();
        assert_eq!(parse_command("settle up", &t), None);
        assert_eq!(parse_command("totals", &t), None);
        assert_eq!(parse_command("1 + 2", &t), None);
    }

    #[test]
    fn custom_tokens() {
        let t = CommandTokens {
            total: "balance".to_string(),
            reset: "clear".to_string(),
            set: "put".to_string(),
        };
        assert_eq!(parse_command("balance", &t), Some(Ok(Command::Total)));
        assert_eq!(parse_command("put 3", &t), Some(Ok(Command::Set(dec!(3)))));
        assert_eq!(parse_command("total", &t), None);
    }
}

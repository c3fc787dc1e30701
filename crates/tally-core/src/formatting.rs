//! Formatting utilities (grouped fixed-point amounts, reply texts).

use std::str::FromStr;

use rust_decimal::Decimal;

use crate::{errors::Error, ledger::round};

/// How the integer part of an amount is split into groups.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Grouping {
    /// `12,34,567`: three digits, then pairs.
    SouthAsian,
    /// `1,234,567`
    Thousands,
}

impl FromStr for Grouping {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "south-asian" | "south_asian" | "indian" | "nepali" | "lakh" => Ok(Grouping::SouthAsian),
            "thousands" | "western" | "international" => Ok(Grouping::Thousands),
            other => Err(Error::Config(format!("unknown number grouping: {other}"))),
        }
    }
}

/// Labels appended after an amount, chosen purely by its sign.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignLabels {
    pub negative: String,
    pub positive: String,
}

impl Default for SignLabels {
    fn default() -> Self {
        Self {
            negative: "advance".to_string(),
            positive: "dues".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NumberFormat {
    pub scale: u32,
    pub grouping: Grouping,
    pub separator: char,
    pub negative_marker: String,
    pub labels: Option<SignLabels>,
}

impl Default for NumberFormat {
    fn default() -> Self {
        Self {
            scale: 2,
            grouping: Grouping::SouthAsian,
            separator: ',',
            negative_marker: "\u{2212}".to_string(),
            labels: None,
        }
    }
}

impl NumberFormat {
    /// Render `value` rounded to `scale` places, grouped, signed and optionally labelled.
    pub fn format(&self, value: Decimal) -> String {
        let rounded = round(value, self.scale);
        let negative = rounded.is_sign_negative() && !rounded.is_zero();

        let digits = rounded.abs().to_string();
        let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits.as_str(), ""));

        let mut out = String::new();
        if negative {
            out.push_str(&self.negative_marker);
        }
        out.push_str(&group_digits(int_part, self.grouping, self.separator));
        if self.scale > 0 {
            out.push('.');
            out.push_str(&format!("{frac_part:0<width$}", width = self.scale as usize));
        }

        if let Some(labels) = &self.labels {
            if negative {
                out.push_str(&format!(" ({})", labels.negative));
            } else if !rounded.is_zero() {
                out.push_str(&format!(" ({})", labels.positive));
            }
        }
        out
    }
}

fn group_digits(int_part: &str, grouping: Grouping, separator: char) -> String {
    let (first, rest) = match grouping {
        Grouping::SouthAsian => (3, 2),
        Grouping::Thousands => (3, 3),
    };
    if int_part.len() <= first {
        return int_part.to_string();
    }

    let (head, tail) = int_part.split_at(int_part.len() - first);
    let mut groups = vec![tail];
    let mut remaining = head;
    while remaining.len() > rest {
        let (h, t) = remaining.split_at(remaining.len() - rest);
        groups.push(t);
        remaining = h;
    }
    groups.push(remaining);
    groups.reverse();
    groups.join(&separator.to_string())
}

// ============== Reply Texts ==============

pub const INVALID_REPLY: &str = "Sorry, I couldn't evaluate that.";
pub const BAD_NUMBER_REPLY: &str = "Could not understand that number.";
pub const NO_TOTAL_REPLY: &str = "No previous total to continue from.";

pub fn arithmetic_reply(fmt: &NumberFormat, expression: &str, value: Decimal, total: Decimal) -> String {
    format!(
        "{expression} = {}\nRunning total: {}",
        fmt.format(value),
        fmt.format(total)
    )
}

pub fn total_reply(fmt: &NumberFormat, total: Decimal) -> String {
    format!("Total: {}", fmt.format(total))
}

pub fn set_reply(fmt: &NumberFormat, total: Decimal) -> String {
    format!("Total set to {}", fmt.format(total))
}

pub fn reset_reply(fmt: &NumberFormat, total: Decimal) -> String {
    format!("Total reset to {}", fmt.format(total))
}

use std::fmt;
use std::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};

/// Bill amounts are exact decimals, currency-agnostic.
/// Shares keep full precision; rounding happens only when formatting.
pub type Amount = Decimal;

/// Format an amount as a human-readable string with two decimals.
/// Example: 100 -> "100.00", 33.3333 -> "33.33", -12.345 -> "-12.35"
pub fn format_amount(amount: Amount) -> String {
    let rounded = amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    format!("{:.2}", rounded)
}

/// Parse a user-entered decimal string into an amount.
/// Example: "50.00" -> 50, "12.5" -> 12.5, ".50" -> 0.5
pub fn parse_amount(input: &str) -> Result<Amount, ParseAmountError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ParseAmountError::InvalidFormat);
    }

    // Decimal::from_str rejects a bare leading dot
    let normalized = if let Some(rest) = input.strip_prefix('.') {
        format!("0.{}", rest)
    } else if let Some(rest) = input.strip_prefix("-.") {
        format!("-0.{}", rest)
    } else {
        input.to_string()
    };

    Decimal::from_str(&normalized)
        .map(|d| d.normalize())
        .map_err(|_| ParseAmountError::InvalidFormat)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseAmountError {
    InvalidFormat,
}

impl fmt::Display for ParseAmountError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseAmountError::InvalidFormat => write!(f, "invalid money format"),
        }
    }
}

impl std::error::Error for ParseAmountError {}

//! Money helpers on top of [`rust_decimal::Decimal`].
//!
//! Prices carry at most two fractional digits and per-request API costs at
//! most six. Decimal strings are the only external representation.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::ConfigError;

/// Fractional digits carried by every price.
pub const PRICE_DECIMALS: u32 = 2;

/// Fractional digits carried by per-request costs.
pub const COST_DECIMALS: u32 = 6;

/// Parse a non-negative price ("49.90", "12", "0.5"). The result always
/// carries two fractional digits.
pub fn parse_price(value: &str) -> Result<Decimal, ConfigError> {
    let mut amount = parse_bounded(value, PRICE_DECIMALS)?;
    amount.rescale(PRICE_DECIMALS);
    Ok(amount)
}

/// Parse a non-negative per-request cost ("0.0015").
pub fn parse_cost(value: &str) -> Result<Decimal, ConfigError> {
    parse_bounded(value, COST_DECIMALS)
}

fn parse_bounded(value: &str, decimals: u32) -> Result<Decimal, ConfigError> {
    let invalid = || ConfigError::InvalidAmount(value.to_string());
    let amount = Decimal::from_str_exact(value.trim()).map_err(|_| invalid())?;
    check_bounded(amount, decimals).ok_or_else(invalid)
}

/// `Some(amount)` when it is non-negative and fits in `decimals` digits.
pub fn check_bounded(amount: Decimal, decimals: u32) -> Option<Decimal> {
    let amount = amount.normalize();
    (!amount.is_sign_negative() && amount.scale() <= decimals).then_some(amount)
}

/// Render a price with exactly two fractional digits ("49.90").
pub fn price_string(amount: Decimal) -> String {
    let mut rounded = amount.round_dp_with_strategy(PRICE_DECIMALS, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(PRICE_DECIMALS);
    rounded.to_string()
}

/// Render a cost without trailing zeros ("0.0015", "2").
pub fn cost_string(amount: Decimal) -> String {
    amount.normalize().to_string()
}

/// Apply a rate expressed in basis points, rounding half away from zero to
/// two fractional digits. `None` on overflow.
pub fn apply_basis_points(amount: Decimal, bps: u32) -> Option<Decimal> {
    amount
        .checked_mul(Decimal::new(i64::from(bps), 4))
        .map(|tax| tax.round_dp_with_strategy(PRICE_DECIMALS, RoundingStrategy::MidpointAwayFromZero))
}

/// Whole number of currency units scaled by `10^decimals`, as expected by
/// providers that bill in the smallest currency unit.
pub fn to_smallest_unit(amount: Decimal, decimals: u32) -> Option<i64> {
    amount
        .checked_mul(Decimal::from(10i64.checked_pow(decimals)?))?
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
}

/// Per-currency display conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrencyFormat {
    pub symbol: &'static str,
    pub symbol_first: bool,
    pub spaced: bool,
    pub decimal_separator: char,
    pub group_separator: char,
}

impl CurrencyFormat {
    /// Display conventions for a lowercase ISO-4217 code. Unknown codes fall
    /// back to the code itself after the amount.
    pub fn for_currency(currency: &str) -> Option<Self> {
        let f = |symbol, symbol_first, spaced, decimal_separator, group_separator| CurrencyFormat {
            symbol,
            symbol_first,
            spaced,
            decimal_separator,
            group_separator,
        };
        match currency {
            "usd" => Some(f("$", true, false, '.', ',')),
            "brl" => Some(f("R$", true, true, ',', '.')),
            "eur" => Some(f("€", false, true, ',', '.')),
            "gbp" => Some(f("£", true, false, '.', ',')),
            "inr" => Some(f("₹", true, false, '.', ',')),
            "jpy" => Some(f("¥", true, false, '.', ',')),
            "mxn" => Some(f("MX$", true, false, '.', ',')),
            "zar" => Some(f("R", true, true, ',', ' ')),
            "sgd" => Some(f("S$", true, false, '.', ',')),
            _ => None,
        }
    }
}

/// Format a price for display in the given currency.
pub fn format_localized(amount: Decimal, currency: &str) -> String {
    let currency = currency.to_ascii_lowercase();
    let plain = price_string(amount.abs());
    let (whole, fraction) = plain.split_once('.').unwrap_or((plain.as_str(), "00"));
    let sign = if amount.is_sign_negative() && !amount.is_zero() { "-" } else { "" };

    match CurrencyFormat::for_currency(&currency) {
        Some(fmt) => {
            let number = format!(
                "{}{}{}",
                group_digits(whole, fmt.group_separator),
                fmt.decimal_separator,
                fraction
            );
            let space = if fmt.spaced { " " } else { "" };
            if fmt.symbol_first {
                format!("{sign}{}{space}{number}", fmt.symbol)
            } else {
                format!("{sign}{number}{space}{}", fmt.symbol)
            }
        }
        None => format!(
            "{sign}{}.{} {}",
            group_digits(whole, ','),
            fraction,
            currency.to_ascii_uppercase()
        ),
    }
}

fn group_digits(digits: &str, separator: char) -> String {
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(separator);
        }
        out.push(c);
    }
    out
}

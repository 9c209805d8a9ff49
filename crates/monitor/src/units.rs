//! Decimal conversions. Quantities never pass through floating point.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::Value;
use thiserror::Error;

/// Digits a `Decimal` can always hold.
const MAX_DIGITS: usize = 28;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot convert `{amount}` to a decimal quantity")]
pub struct AmountError {
    pub amount: String,
}

/// Convert a base-unit amount (`"1500000"`, or a decimal string such as a
/// cosmos `DecCoin`) into whole units by shifting `decimals` places.
pub fn parse_units(amount: &str, decimals: u32) -> Result<Decimal, AmountError> {
    let err = || AmountError {
        amount: amount.to_string(),
    };

    let trimmed = amount.trim();
    let (int_part, frac_part) = trimmed.split_once('.').unwrap_or((trimmed, ""));
    if (int_part.is_empty() && frac_part.is_empty())
        || !int_part.bytes().all(|b| b.is_ascii_digit())
        || !frac_part.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(err());
    }

    let digits = format!("{int_part}{frac_part}");
    let point = int_part.len() as i64 - decimals as i64;

    let (whole, fraction) = if point <= 0 {
        (String::new(), format!("{}{}", "0".repeat(point.unsigned_abs() as usize), digits))
    } else {
        let (w, f) = digits.split_at(point as usize);
        (w.to_string(), f.to_string())
    };

    let whole = whole.trim_start_matches('0');
    let whole = if whole.is_empty() { "0" } else { whole };
    let fraction = fraction.trim_end_matches('0');

    if whole.len() > MAX_DIGITS + 1 {
        return Err(err());
    }
    let keep = fraction.len().min(MAX_DIGITS.saturating_sub(whole.len()));
    let text = if keep == 0 {
        whole.to_string()
    } else {
        format!("{whole}.{}", &fraction[..keep])
    };

    Decimal::from_str(&text).map(|d| d.normalize()).map_err(|_| err())
}

/// Read a price from JSON, accepting both strings and numbers.
pub fn decimal_from_json(value: &Value) -> Option<Decimal> {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

/// `"cosmoshub"` -> `"Cosmoshub"`, `"binance-smart_chain"` -> `"Binance Smart Chain"`.
pub fn humanize(name: &str) -> String {
    name.split(['-', '_', ' '])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

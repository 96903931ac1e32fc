use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntervalParseError {
    #[error("empty interval string")]
    Empty,

    #[error("interval {0:?} has no leading number")]
    MissingNumber(String),

    #[error("unknown interval unit {0:?}")]
    UnknownUnit(String),

    #[error("interval {0:?} overflows")]
    Overflow(String),
}

fn unit_nanos(unit: &str) -> Option<u64> {
    let nanos = match unit {
        "ns" => 1,
        "us" => 1_000,
        "ms" => 1_000_000,
        "s" => 1_000_000_000,
        "min" => 60 * 1_000_000_000,
        "h" | "hr" => 3600 * 1_000_000_000,
        _ => return None,
    };
    Some(nanos)
}

/// Parses an interval of the form `<count><unit>`, with optional whitespace
/// between the two. Accepted units: `ns`, `us`, `ms`, `s`, `min`, `h`, `hr`.
/// A bare count takes `default_unit`.
pub fn parse_interval(text: &str, default_unit: &str) -> Result<Duration, IntervalParseError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(IntervalParseError::Empty);
    }

    let digits_end = text
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let (count_str, unit_str) = text.split_at(digits_end);
    if count_str.is_empty() {
        return Err(IntervalParseError::MissingNumber(text.to_string()));
    }
    let count: u64 = count_str
        .parse()
        .map_err(|_| IntervalParseError::Overflow(text.to_string()))?;

    let unit_str = unit_str.trim();
    let unit_str = if unit_str.is_empty() {
        default_unit
    } else {
        unit_str
    };
    let nanos_per_unit =
        unit_nanos(unit_str).ok_or_else(|| IntervalParseError::UnknownUnit(unit_str.to_string()))?;

    let total = count
        .checked_mul(nanos_per_unit)
        .ok_or_else(|| IntervalParseError::Overflow(text.to_string()))?;
    Ok(Duration::from_nanos(total))
}

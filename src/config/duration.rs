//! Go-style duration strings for config fields
//!
//! Durations in the config file are written the way the wider Kubernetes
//! ecosystem writes them: combinations of hours, minutes, seconds, and
//! milliseconds with positive integer values, e.g. `90s`, `5m`, `1h30m`.

use std::time::Duration;

use serde::{Deserialize, Deserializer};

/// Parse a Go-style duration string (e.g. "30s", "5m", "1h30m", "250ms")
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("duration cannot be empty".to_string());
    }

    let mut total = Duration::ZERO;
    let mut remaining = s;

    while !remaining.is_empty() {
        let num_end = remaining
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("missing unit at end of duration '{s}'"))?;
        if num_end == 0 {
            return Err(format!(
                "expected a number at position {} in '{}'",
                s.len() - remaining.len(),
                s
            ));
        }
        let value: u64 = remaining[..num_end]
            .parse()
            .map_err(|_| format!("invalid number in duration '{s}'"))?;
        remaining = &remaining[num_end..];

        let unit_end = remaining
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(remaining.len());
        let unit = &remaining[..unit_end];
        remaining = &remaining[unit_end..];

        total += match unit {
            "h" => Duration::from_secs(value * 3600),
            "m" => Duration::from_secs(value * 60),
            "s" => Duration::from_secs(value),
            "ms" => Duration::from_millis(value),
            _ => return Err(format!("unknown unit '{unit}' in duration '{s}'")),
        };
    }

    Ok(total)
}

/// Deserialize a duration field from its string form
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

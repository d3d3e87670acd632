// src/config/duration.rs

use std::time::Duration;

/// Parse a duration such as `"250ms"`, `"1.5s"`, `"30m"` or `"2h"`.
///
/// A unit is mandatory; the number may have a fractional part.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .ok_or_else(|| format!("duration '{s}' is missing a unit (ms, s, m or h)"))?;
    let (number, unit) = s.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid number '{number}' in duration '{s}'"))?;

    let seconds = match unit.trim().to_ascii_lowercase().as_str() {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => {
            return Err(format!(
                "unsupported duration unit '{other}'; expected ms, s, m or h"
            ));
        }
    };

    Duration::try_from_secs_f64(seconds)
        .map_err(|e| format!("duration '{s}' is out of range: {e}"))
}

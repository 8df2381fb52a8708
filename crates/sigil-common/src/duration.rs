//! Human-friendly duration strings used in configuration.
//!
//! A value is either a bare integer (milliseconds) or an integer followed by
//! one of `s`, `m`, `h`, `d`, `w`, `y`. An empty string means "unset".

const SECOND: i64 = 1000;
const MINUTE: i64 = 60 * SECOND;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;
const WEEK: i64 = 7 * DAY;
const YEAR: i64 = 365 * DAY;

/// Error returned for a duration string that is neither empty nor parseable.
#[derive(Debug, thiserror::Error)]
#[error("Invalid duration '{0}': expected milliseconds or <n>[s|m|h|d|w|y]")]
pub struct DurationParseError(pub String);

/// Parse a duration into milliseconds. `Ok(None)` for an empty value.
pub fn parse_duration(value: &str) -> Result<Option<i64>, DurationParseError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }

    if let Ok(ms) = value.parse::<i64>() {
        return Ok(Some(ms));
    }

    let unit_len = value.chars().last().map_or(0, char::len_utf8);
    let (number, unit) = value.split_at(value.len() - unit_len);
    let size = match unit {
        "s" => SECOND,
        "m" => MINUTE,
        "h" => HOUR,
        "d" => DAY,
        "w" => WEEK,
        "y" => YEAR,
        _ => return Err(DurationParseError(value.to_owned())),
    };

    number
        .parse::<i64>()
        .ok()
        .and_then(|n| n.checked_mul(size))
        .map(Some)
        .ok_or_else(|| DurationParseError(value.to_owned()))
}

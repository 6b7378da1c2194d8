//! Duration values as written in config files and flags.

use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

static SEGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+)(ms|h|m|s)").unwrap_or_else(|e| unreachable!("static pattern: {e}"))
});

/// A duration as written in TOML: integer seconds or a suffixed string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum DurationValue {
    /// Whole seconds.
    Seconds(u64),
    /// Text such as `500ms`, `10s`, `5m` or `1h30m`.
    Text(String),
}

impl DurationValue {
    /// Parses the value.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the text is malformed.
    pub fn resolve(&self) -> Result<Duration, String> {
        match self {
            Self::Seconds(secs) => Ok(Duration::from_secs(*secs)),
            Self::Text(text) => parse_duration(text),
        }
    }
}

impl fmt::Display for DurationValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Seconds(secs) => write!(f, "{secs}"),
            Self::Text(text) => f.write_str(text),
        }
    }
}

/// Parses `90`, `90s`, `500ms`, `5m`, `1h` or concatenations like `1m30s`.
///
/// A bare integer is seconds.
///
/// # Errors
///
/// Returns a description of the problem if `input` is not a duration.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let text = input.trim();
    if text.is_empty() {
        return Err("duration is empty".to_string());
    }
    if let Ok(secs) = text.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut consumed = 0;
    for caps in SEGMENT.captures_iter(text) {
        let whole = caps.get(0).map_or(0..0, |m| m.range());
        if whole.start != consumed {
            break;
        }
        consumed = whole.end;

        let amount: u64 = caps[1]
            .parse()
            .map_err(|_| format!("'{input}' is out of range"))?;
        let segment = match &caps[2] {
            "ms" => Duration::from_millis(amount),
            "s" => Duration::from_secs(amount),
            "m" => Duration::from_secs(amount.saturating_mul(60)),
            _ => Duration::from_secs(amount.saturating_mul(3600)),
        };
        total = total.saturating_add(segment);
    }

    if consumed == text.len() {
        Ok(total)
    } else {
        Err(format!(
            "'{input}' is not a duration (use seconds or a ms|s|m|h suffix, e.g. 500ms, 10s, 5m)"
        ))
    }
}

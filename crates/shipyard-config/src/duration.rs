//! Human-readable duration parsing.
//!
//! A duration is one or more `<number><unit>` segments, e.g. `10m`, `1h30m`,
//! `2.5s` or `250ms`. Units: `ms`, `s`, `m`, `h`, `d`, `w`. A bare number is
//! read as seconds.

use crate::{ConfigError, ConfigResult};
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

static SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)(ms|s|m|h|d|w)").expect("valid regex"));

static FULL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\d+(?:\.\d+)?(?:ms|s|m|h|d|w))+$").expect("valid regex")
});

/// Parse a duration string.
pub fn parse_duration(input: &str) -> ConfigResult<Duration> {
    let text: String = input.split_whitespace().collect();
    if text.is_empty() {
        return Err(ConfigError::InvalidDuration(input.to_string()));
    }

    if let Ok(seconds) = text.parse::<f64>() {
        return to_duration(seconds, input);
    }

    if !FULL.is_match(&text) {
        return Err(ConfigError::InvalidDuration(input.to_string()));
    }

    let mut total = 0.0;
    for caps in SEGMENT.captures_iter(&text) {
        let value: f64 = caps[1]
            .parse()
            .map_err(|_| ConfigError::InvalidDuration(input.to_string()))?;
        let unit = match &caps[2] {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3_600.0,
            "d" => 86_400.0,
            "w" => 604_800.0,
            _ => return Err(ConfigError::InvalidDuration(input.to_string())),
        };
        total += value * unit;
    }

    to_duration(total, input)
}

fn to_duration(seconds: f64, input: &str) -> ConfigResult<Duration> {
    Duration::try_from_secs_f64(seconds).map_err(|_| ConfigError::InvalidDuration(input.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_units() {
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7_200));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_compound_and_fractional() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5_400));
        assert_eq!(parse_duration("1m 30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1_500));
    }

    #[test]
    fn test_bare_number_is_seconds() {
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn test_rejects_garbage() {
        for bad in ["", "ten minutes", "10x", "m10", "-5s", "10m!"] {
            assert!(
                matches!(parse_duration(bad), Err(ConfigError::InvalidDuration(_))),
                "{bad:?} should be rejected"
            );
        }
    }
}

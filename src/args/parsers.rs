use std::time::Duration;

use crate::error::{AppError, AppResult, ConfigError};

/// Parses a duration argument with an optional ms/s/m/h unit (default: s).
pub(crate) fn parse_duration_arg(s: &str) -> AppResult<Duration> {
    parse_duration(s).map_err(AppError::config)
}

pub(super) fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let value = s.trim();
    if value.is_empty() {
        return Err(ConfigError::DurationEmpty);
    }

    let mut digits_len = 0usize;
    for ch in value.chars() {
        if ch.is_ascii_digit() {
            digits_len = digits_len.saturating_add(1);
        } else {
            break;
        }
    }
    if digits_len == 0 {
        return Err(ConfigError::InvalidDurationFormat {
            value: value.to_owned(),
        });
    }
    let (num_part, unit_part) = value.split_at(digits_len);
    let number: u64 = num_part
        .parse()
        .map_err(|err| ConfigError::InvalidDurationNumber {
            value: value.to_owned(),
            source: err,
        })?;

    let unit = if unit_part.is_empty() { "s" } else { unit_part };
    let duration = match unit {
        "ms" => Duration::from_millis(number),
        "s" => Duration::from_secs(number),
        "m" => {
            let secs = number.checked_mul(60).ok_or(ConfigError::DurationOverflow)?;
            Duration::from_secs(secs)
        }
        "h" => {
            let secs = number
                .checked_mul(60)
                .and_then(|seconds| seconds.checked_mul(60))
                .ok_or(ConfigError::DurationOverflow)?;
            Duration::from_secs(secs)
        }
        _ => {
            return Err(ConfigError::InvalidDurationUnit {
                unit: unit.to_owned(),
            });
        }
    };

    if duration.as_millis() == 0 {
        return Err(ConfigError::DurationZero);
    }

    Ok(duration)
}

/// Parses a ramp spec: `"N"` means a step of N per second, `"N/D"` a step
/// of N per duration D (e.g. `"100/2s"`).
pub(crate) fn parse_rate_spec(spec: &str) -> Result<(i64, Duration), ConfigError> {
    let value = spec.trim();
    if let Some((step_part, interval_part)) = value.split_once('/') {
        if step_part.is_empty() || interval_part.is_empty() {
            return Err(ConfigError::InvalidIncreaseRateFormat {
                value: value.to_owned(),
            });
        }
        let step: i64 = step_part
            .parse()
            .map_err(|err| ConfigError::InvalidIncreaseStep {
                value: value.to_owned(),
                source: err,
            })?;
        let interval =
            parse_duration(interval_part).map_err(|err| ConfigError::InvalidIncreaseInterval {
                value: value.to_owned(),
                source: Box::new(err),
            })?;
        return Ok((step, interval));
    }

    let step: i64 = value
        .parse()
        .map_err(|err| ConfigError::InvalidIncreaseStep {
            value: value.to_owned(),
            source: err,
        })?;
    Ok((step, Duration::from_secs(1)))
}

//! Flexible string duration: the overlay's human-readable duration literal
//! (`30s`, `5m`, `1.5h`) used for every `tbon.*` timeout knob.

use std::time::Duration;

use crate::ConfigError;

const UNITS: &[(&str, f64)] = &[
    ("ms", 0.001),
    ("s", 1.0),
    ("m", 60.0),
    ("h", 3600.0),
    ("d", 86400.0),
];

/// Parse an FSD literal. A bare number with no unit is seconds.
pub fn parse(input: &str) -> Result<Duration, ConfigError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(ConfigError::Fsd(input.to_string()));
    }

    let split_at = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (mantissa, unit) = s.split_at(split_at);

    let value: f64 = mantissa
        .parse()
        .map_err(|_| ConfigError::Fsd(input.to_string()))?;
    if value < 0.0 {
        return Err(ConfigError::Fsd(input.to_string()));
    }

    let seconds = if unit.is_empty() {
        value
    } else {
        let (_, scale) = UNITS
            .iter()
            .find(|(name, _)| *name == unit)
            .ok_or_else(|| ConfigError::Fsd(input.to_string()))?;
        value * scale
    };

    Ok(Duration::from_secs_f64(seconds))
}

/// Format a duration back into the largest unit that represents it exactly,
/// falling back to seconds with up to three decimal places. Used only for
/// diagnostics (e.g. logging how long a child has been torpid).
pub fn format(d: Duration) -> String {
    let secs = d.as_secs_f64();
    for (name, scale) in UNITS.iter().rev() {
        if *name == "ms" {
            continue;
        }
        let scaled = secs / scale;
        if scaled >= 1.0 && (scaled * scale - secs).abs() < 1e-9 {
            return format_value(scaled, name);
        }
    }
    format_value(secs, "s")
}

fn format_value(value: f64, unit: &str) -> String {
    if value.fract() == 0.0 {
        format!("{}{unit}", value as i64)
    } else {
        format!("{value:.3}{unit}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_number_is_seconds() {
        assert_eq!(parse("30").unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn unit_suffixes_scale_correctly() {
        assert_eq!(parse("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse("1d").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse("500ms").unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn fractional_mantissa_is_accepted() {
        let d = parse("1.5h").unwrap();
        assert_eq!(d, Duration::from_secs(5400));
    }

    #[test]
    fn unknown_unit_is_rejected() {
        assert!(parse("3x").is_err());
    }

    #[test]
    fn negative_is_rejected() {
        assert!(parse("-5s").is_err());
    }

    #[test]
    fn empty_is_rejected() {
        assert!(parse("").is_err());
        assert!(parse("   ").is_err());
    }

    #[test]
    fn format_round_trips_whole_units() {
        assert_eq!(format(Duration::from_secs(30)), "30s");
        assert_eq!(format(Duration::from_secs(300)), "5m");
        assert_eq!(format(Duration::from_secs(7200)), "2h");
    }
}

//! Schedule interval grammar: a concatenation of `N(d|h|m|s)` terms such as
//! `5m1s`, `2h` or `1d 12h`. Values may be decimal.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{MacroError, Result};

const MINUTE: f64 = 60.0;
const HOUR: f64 = 60.0 * MINUTE;
const DAY: f64 = 24.0 * HOUR;

/// Shortest accepted schedule interval.
pub const MIN_INTERVAL_SECS: f64 = 0.1;

/// A schedule interval in seconds, at least [`MIN_INTERVAL_SECS`] and
/// representable as a `Duration`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Interval(f64);

impl Interval {
    pub fn from_secs(secs: f64) -> Result<Self> {
        if !(secs.is_finite() && secs > 0.0) {
            return Err(MacroError::Interval(format!("{} is not a positive interval", secs)));
        }
        if secs < MIN_INTERVAL_SECS {
            return Err(MacroError::Interval(format!(
                "{}s is shorter than the minimum of {}s",
                secs, MIN_INTERVAL_SECS
            )));
        }
        if Duration::try_from_secs_f64(secs).is_err() {
            return Err(MacroError::Interval(format!("{}s is too long", secs)));
        }
        Ok(Interval(secs))
    }

    pub fn as_secs(&self) -> f64 {
        self.0
    }

    pub fn as_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.0).unwrap_or(Duration::MAX)
    }
}

fn unit_seconds(unit: char) -> Option<f64> {
    match unit.to_ascii_lowercase() {
        'd' => Some(DAY),
        'h' => Some(HOUR),
        'm' => Some(MINUTE),
        's' => Some(1.0),
        _ => None,
    }
}

impl FromStr for Interval {
    type Err = MacroError;

    fn from_str(s: &str) -> Result<Self> {
        let input = s.trim();
        if input.is_empty() {
            return Err(MacroError::Interval("empty interval".into()));
        }

        let mut total = 0.0;
        let mut number = String::new();
        for c in input.chars() {
            if c.is_ascii_digit() || c == '.' {
                number.push(c);
            } else if c.is_whitespace() {
                if !number.is_empty() {
                    return Err(MacroError::Interval(format!("missing unit after {:?} in {:?}", number, s)));
                }
            } else if let Some(scale) = unit_seconds(c) {
                if number.is_empty() {
                    return Err(MacroError::Interval(format!("missing number before {:?} in {:?}", c, s)));
                }
                let value: f64 = number
                    .parse()
                    .map_err(|_| MacroError::Interval(format!("bad number {:?} in {:?}", number, s)))?;
                total += value * scale;
                number.clear();
            } else {
                return Err(MacroError::Interval(format!("unexpected {:?} in {:?}", c, s)));
            }
        }

        if !number.is_empty() {
            return Err(MacroError::Interval(format!("missing unit after {:?} in {:?}", number, s)));
        }
        Interval::from_secs(total)
    }
}

/// Canonical form. Whole seconds are split into `d`/`h`/`m`/`s` terms with
/// zero terms omitted; anything fractional is written as plain seconds so it
/// parses back to the identical value.
impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0;
        if secs.fract() != 0.0 || secs >= u64::MAX as f64 {
            return write!(f, "{}s", secs);
        }

        let mut rest = secs as u64;
        let days = rest / 86_400;
        rest %= 86_400;
        let hours = rest / 3_600;
        rest %= 3_600;
        let minutes = rest / 60;
        let seconds = rest % 60;

        for (value, unit) in [(days, 'd'), (hours, 'h'), (minutes, 'm'), (seconds, 's')] {
            if value > 0 {
                write!(f, "{}{}", value, unit)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn secs(s: &str) -> f64 {
        s.parse::<Interval>().unwrap().as_secs()
    }

    #[test]
    fn parses_terms() {
        assert_eq!(secs("30s"), 30.0);
        assert_eq!(secs("5m1s"), 301.0);
        assert_eq!(secs("2h"), 7200.0);
        assert_eq!(secs("1d 2h 3m 4s"), 93_784.0);
        assert_eq!(secs("1.5m"), 90.0);
        assert_eq!(secs("2H30M"), 9000.0);
    }

    #[test]
    fn rejects_malformed() {
        for bad in ["", "   ", "5", "m", "5x", "1h 5", "0s", "1..2s", "-5s"] {
            assert!(bad.parse::<Interval>().is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn rejects_unrepresentable_lengths() {
        assert!("99999999999999999999999s".parse::<Interval>().is_err());
        assert!("0.0000000001s".parse::<Interval>().is_err());
        assert!("0.05s".parse::<Interval>().is_err());
        assert!(Interval::from_secs(f64::INFINITY).is_err());

        let shortest = "0.1s".parse::<Interval>().unwrap();
        assert_eq!(shortest.as_duration(), Duration::from_millis(100));
        let long = "106751991167d".parse::<Interval>().unwrap();
        assert!(long.as_duration() > Duration::from_secs(9_000_000_000_000_000));
    }

    #[test]
    fn formats_canonically() {
        assert_eq!(Interval::from_secs(301.0).unwrap().to_string(), "5m1s");
        assert_eq!(Interval::from_secs(93_784.0).unwrap().to_string(), "1d2h3m4s");
        assert_eq!(Interval::from_secs(7200.0).unwrap().to_string(), "2h");
        assert_eq!(Interval::from_secs(0.25).unwrap().to_string(), "0.25s");
    }

    proptest! {
        #[test]
        fn format_parses_back_to_same_seconds(
            d in 0u32..5,
            h in 0u32..30,
            m in 0u32..90,
            s in 0.0f64..600.0,
        ) {
            let text = format!("{}d{}h{}m{}s", d, h, m, s);
            if let Ok(parsed) = text.parse::<Interval>() {
                let again: Interval = parsed.to_string().parse().unwrap();
                prop_assert_eq!(again.as_secs(), parsed.as_secs());
            }
        }

        #[test]
        fn whole_seconds_round_trip(total in 1u64..10_000_000) {
            let interval = Interval::from_secs(total as f64).unwrap();
            let again: Interval = interval.to_string().parse().unwrap();
            prop_assert_eq!(again.as_secs(), total as f64);
        }
    }
}

//! Human-readable durations such as `"1 hour"`, `"30 minutes"` or `"90s"`.

use std::fmt;
use std::time::Duration;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseDurationError(pub String);

impl fmt::Display for ParseDurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid duration '{}'", self.0)
    }
}

impl std::error::Error for ParseDurationError {}

/// Parse `<amount><unit>` with optional whitespace between the two.
///
/// A bare number is read as seconds.
pub fn parse(input: &str) -> Result<Duration, ParseDurationError> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (amount, unit) = trimmed.split_at(split);
    let amount: u64 = amount
        .parse()
        .map_err(|_| ParseDurationError(input.to_string()))?;

    let secs_per_unit = match unit.trim().to_lowercase().as_str() {
        "ms" | "millis" | "millisecond" | "milliseconds" => return Ok(Duration::from_millis(amount)),
        "" | "s" | "sec" | "secs" | "second" | "seconds" => 1,
        "m" | "min" | "mins" | "minute" | "minutes" => 60,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3_600,
        "d" | "day" | "days" => 86_400,
        _ => return Err(ParseDurationError(input.to_string())),
    };
    amount
        .checked_mul(secs_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| ParseDurationError(input.to_string()))
}

/// A [`Duration`] that (de)serializes as a human-readable string.
///
/// Integers are accepted on input and read as seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HumanDuration(pub Duration);

impl HumanDuration {
    pub fn get(&self) -> Duration {
        self.0
    }
}

impl From<Duration> for HumanDuration {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();
        if self.0.subsec_millis() != 0 {
            write!(f, "{}ms", self.0.as_millis())
        } else if secs != 0 && secs % 3_600 == 0 {
            write!(f, "{}h", secs / 3_600)
        } else if secs != 0 && secs % 60 == 0 {
            write!(f, "{}m", secs / 60)
        } else {
            write!(f, "{secs}s")
        }
    }
}

impl Serialize for HumanDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HumanDurationVisitor;

        impl Visitor<'_> for HumanDurationVisitor {
            type Value = HumanDuration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a duration such as \"1 hour\" or a number of seconds")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(HumanDuration(Duration::from_secs(v)))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                u64::try_from(v)
                    .map(|s| HumanDuration(Duration::from_secs(s)))
                    .map_err(|_| E::custom("duration must not be negative"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                parse(v).map(HumanDuration).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(HumanDurationVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!(parse("1 hour").unwrap(), Duration::from_secs(3_600));
        assert_eq!(parse("30 minutes").unwrap(), Duration::from_secs(1_800));
        assert_eq!(parse("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse("2d").unwrap(), Duration::from_secs(172_800));
        assert_eq!(parse("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse("45").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse("soon").is_err());
        assert!(parse("10 fortnights").is_err());
        assert!(parse("").is_err());
    }

    #[test]
    fn test_human_duration_serde() {
        let d: HumanDuration = serde_json::from_str("\"30 minutes\"").unwrap();
        assert_eq!(d.get(), Duration::from_secs(1_800));
        assert_eq!(serde_json::to_string(&d).unwrap(), "\"30m\"");

        let d: HumanDuration = serde_json::from_str("120").unwrap();
        assert_eq!(d.get(), Duration::from_secs(120));
        assert!(serde_json::from_str::<HumanDuration>("\"later\"").is_err());
    }
}

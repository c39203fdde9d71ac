//! Signed wire duration.
//!
//! Timeouts are serialized as humantime strings (`"15s"`, `"1h30m"`). The
//! wire format admits a leading `-` so that an invalid negative timeout can
//! be deserialized and then rejected by validation with a proper field error
//! instead of a parse failure.

use std::fmt;
use std::ops::Add;

use chrono::Duration;
use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// A signed duration with humantime wire representation.
///
/// Internally a [`chrono::Duration`]; negative values survive
/// deserialization so validation can report them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct ApiDuration(Duration);

impl ApiDuration {
    /// A zero duration (the "unbounded" sentinel for timeouts).
    #[must_use]
    pub fn zero() -> Self {
        Self(Duration::zero())
    }

    /// Creates a duration from whole seconds.
    #[must_use]
    pub fn from_secs(secs: i64) -> Self {
        Self(Duration::seconds(secs))
    }

    /// Returns the wrapped signed duration.
    #[must_use]
    pub const fn inner(&self) -> Duration {
        self.0
    }

    /// Returns true when the duration is exactly zero.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == Duration::zero()
    }

    /// Returns true when the duration is negative.
    #[must_use]
    pub fn is_negative(&self) -> bool {
        self.0 < Duration::zero()
    }

    /// Converts to a non-negative std duration; negative values clamp to zero.
    #[must_use]
    pub fn to_std(&self) -> std::time::Duration {
        self.0.to_std().unwrap_or(std::time::Duration::ZERO)
    }
}

impl From<Duration> for ApiDuration {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

impl Add for ApiDuration {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl fmt::Display for ApiDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_negative() {
            let positive = -self.0;
            write!(f, "-{}", humantime::format_duration(positive.to_std().unwrap_or_default()))
        } else {
            write!(f, "{}", humantime::format_duration(self.to_std()))
        }
    }
}

impl Serialize for ApiDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ApiDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DurationVisitor;

        impl Visitor<'_> for DurationVisitor {
            type Value = ApiDuration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a humantime duration string such as \"15s\" or \"1h30m\"")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<ApiDuration, E> {
                let (negative, body) = match v.strip_prefix('-') {
                    Some(rest) => (true, rest),
                    None => (false, v),
                };
                let std = humantime::parse_duration(body.trim())
                    .map_err(|e| E::custom(format!("invalid duration '{v}': {e}")))?;
                let signed = Duration::from_std(std)
                    .map_err(|_| E::custom(format!("duration '{v}' out of range")))?;
                Ok(ApiDuration(if negative { -signed } else { signed }))
            }
        }

        deserializer.deserialize_str(DurationVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_humantime_strings() {
        let d: ApiDuration = serde_json::from_str("\"15s\"").unwrap();
        assert_eq!(d, ApiDuration::from_secs(15));

        let d: ApiDuration = serde_json::from_str("\"1h 30m\"").unwrap();
        assert_eq!(d, ApiDuration::from_secs(5400));
    }

    #[test]
    fn negative_durations_survive_deserialization() {
        let d: ApiDuration = serde_json::from_str("\"-48h\"").unwrap();
        assert!(d.is_negative());
        assert_eq!(d.inner(), chrono::Duration::hours(-48));
    }

    #[test]
    fn round_trips_through_serialization() {
        let d = ApiDuration::from_secs(90);
        let json = serde_json::to_string(&d).unwrap();
        let back: ApiDuration = serde_json::from_str(&json).unwrap();
        assert_eq!(d, back);
    }

    #[test]
    fn zero_is_unbounded_sentinel() {
        assert!(ApiDuration::zero().is_zero());
        assert!(!ApiDuration::zero().is_negative());
    }
}

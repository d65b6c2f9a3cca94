//! Duration strings
//!
//! Configuration accepts durations either as integer milliseconds or as a
//! number with one of the suffixes `ns`, `us`, `ms`, `s`, `m`, `h`, `d`.

use std::time::Duration;

use crate::error::LoomError;

/// Parse `"250ms"`, `"5m"`, `"24h"`, or a bare integer (milliseconds).
pub fn parse_duration(input: &str) -> Result<Duration, LoomError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(LoomError::validation("duration must not be empty"));
    }

    let split = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);

    let value: u64 = digits.parse().map_err(|_| {
        LoomError::validation(format!("invalid duration {input:?}: expected <number><unit>"))
    })?;

    match unit {
        "ns" => Ok(Duration::from_nanos(value)),
        "us" => Ok(Duration::from_micros(value)),
        "" | "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        "d" => Ok(Duration::from_secs(value * 86_400)),
        other => Err(LoomError::validation(format!(
            "invalid duration unit {other:?}: expected ns, us, ms, s, m, h, or d"
        ))),
    }
}

/// Serde support for `Duration` fields that accept integer milliseconds or
/// suffixed strings, and serialize back to milliseconds.
pub mod serde_millis {
    use std::fmt;
    use std::time::Duration;

    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(d.as_millis() as u64)
    }

    struct MillisOrString;

    impl<'de> Visitor<'de> for MillisOrString {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("integer milliseconds or a duration string like \"5m\"")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
            Ok(Duration::from_millis(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
            if v < 0 {
                return Err(E::custom("duration must not be negative"));
            }
            Ok(Duration::from_millis(v as u64))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
            super::parse_duration(v).map_err(|e| E::custom(e.to_string()))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        de.deserialize_any(MillisOrString)
    }
}

/// Like [`serde_millis`], for optional fields.
pub mod serde_opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(d: &Option<Duration>, ser: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => ser.serialize_some(&(d.as_millis() as u64)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Duration>, D::Error> {
        let raw: Option<Raw> = Option::deserialize(de)?;
        match raw {
            None => Ok(None),
            Some(Raw::Millis(ms)) => Ok(Some(Duration::from_millis(ms))),
            Some(Raw::Text(s)) => super::parse_duration(&s)
                .map(Some)
                .map_err(|e| serde::de::Error::custom(e.to_string())),
        }
    }
}

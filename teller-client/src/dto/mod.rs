//! Request and response types of the typed operations.
//!
//! * [`common`]: primary protocol (accounts, operations, receipts).
//! * [`invest`]: secondary protocol (brokerage accounts and operations).
//!
//! Only the commonly used fields are modelled; unknown fields are ignored.
//! This module holds the date encodings the provider mixes across endpoints.

pub mod common;
pub mod invest;

use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serializer};

/// The provider's home timezone. Plain dates are midnight here.
pub const HOME_TZ: Tz = chrono_tz::Europe::Moscow;

// ─── Response date types ──────────────────────────────────────────────────────

/// `{"milliseconds": 1700000000000}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Milliseconds(pub DateTime<Utc>);

impl Milliseconds {
    pub fn time(&self) -> DateTime<Utc> { self.0 }
}

impl<'de> Deserialize<'de> for Milliseconds {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw { milliseconds: i64 }

        let raw = Raw::deserialize(d)?;
        DateTime::from_timestamp_millis(raw.milliseconds)
            .map(Self)
            .ok_or_else(|| serde::de::Error::custom(format!("timestamp out of range: {}", raw.milliseconds)))
    }
}

/// Bare Unix seconds: `1700000000`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Seconds(pub DateTime<Utc>);

impl Seconds {
    pub fn time(&self) -> DateTime<Utc> { self.0 }
}

impl<'de> Deserialize<'de> for Seconds {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let secs = i64::deserialize(d)?;
        DateTime::from_timestamp(secs, 0)
            .map(Self)
            .ok_or_else(|| serde::de::Error::custom(format!("timestamp out of range: {secs}")))
    }
}

/// `"2023-04-05"`, midnight in [`HOME_TZ`].
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Date(pub DateTime<Tz>);

impl Date {
    pub fn time(&self) -> DateTime<Tz> { self.0.clone() }

    pub fn parse(s: &str) -> Result<Self, String> {
        let day = NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| format!("{s:?}: {e}"))?;
        let midnight = day.and_hms_opt(0, 0, 0).ok_or_else(|| format!("{s:?}: no midnight"))?;
        HOME_TZ.from_local_datetime(&midnight)
            .earliest()
            .map(Self)
            .ok_or_else(|| format!("{s:?}: no such local time"))
    }
}

impl<'de> Deserialize<'de> for Date {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// `"2023-04-05T10:11:12.345+03:00"`; the fraction is optional.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DateTimeMilliOffset(pub DateTime<FixedOffset>);

impl DateTimeMilliOffset {
    pub fn time(&self) -> DateTime<FixedOffset> { self.0 }
}

impl<'de> Deserialize<'de> for DateTimeMilliOffset {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&s)
            .map(Self)
            .map_err(|e| serde::de::Error::custom(format!("{s:?}: {e}")))
    }
}

impl fmt::Display for DateTimeMilliOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

// ─── Request encodings ────────────────────────────────────────────────────────

/// Form/query encoders for `#[serde(serialize_with = ...)]`.
pub(crate) mod encode {
    use super::*;

    pub fn unix_millis<S: Serializer>(t: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(t.timestamp_millis())
    }

    pub fn opt_unix_millis<S: Serializer>(t: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        match t {
            Some(t) => unix_millis(t, s),
            None    => s.serialize_none(),
        }
    }

    /// `2023-04-05T10:11:12.345Z`.
    pub fn opt_utc_millis<S: Serializer>(t: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        match t {
            Some(t) => s.serialize_str(&t.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()),
            None    => s.serialize_none(),
        }
    }

    /// Nested values travel as a JSON string inside a form field.
    pub fn json_string<T: serde::Serialize, S: Serializer>(v: &T, s: S) -> Result<S::Ok, S::Error> {
        let json = serde_json::to_string(v).map_err(serde::ser::Error::custom)?;
        s.serialize_str(&json)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

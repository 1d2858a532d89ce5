// Lenient deserializers for values that arrive as strings from the
// environment: booleans in any case, durations as seconds or humantime
// text, comma-separated host lists.

use std::time::Duration;

use secrecy::SecretString;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
}

impl Scalar {
    fn into_text(self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Int(n) => n.to_string(),
            Self::UInt(n) => n.to_string(),
            Self::Float(x) => x.to_string(),
            Self::Str(s) => s,
        }
    }
}

pub(crate) fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    match Scalar::deserialize(deserializer)? {
        Scalar::Bool(b) => Ok(b),
        Scalar::Int(0) | Scalar::UInt(0) => Ok(false),
        Scalar::Int(1) | Scalar::UInt(1) => Ok(true),
        Scalar::Str(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(true),
            "false" | "no" | "off" | "0" => Ok(false),
            other => Err(de::Error::custom(format!("expected true or false, got '{other}'"))),
        },
        other => Err(de::Error::custom(format!(
            "expected true or false, got '{}'",
            other.into_text()
        ))),
    }
}

pub(crate) fn seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    match Scalar::deserialize(deserializer)? {
        Scalar::Int(n) => u64::try_from(n)
            .map(Duration::from_secs)
            .map_err(|_| de::Error::custom(format!("duration must not be negative, got {n}"))),
        Scalar::UInt(n) => Ok(Duration::from_secs(n)),
        Scalar::Float(x) => Duration::try_from_secs_f64(x).map_err(de::Error::custom),
        Scalar::Str(s) => {
            let s = s.trim();
            match s.parse::<u64>() {
                Ok(n) => Ok(Duration::from_secs(n)),
                Err(_) => humantime::parse_duration(s).map_err(de::Error::custom),
            }
        }
        Scalar::Bool(b) => Err(de::Error::custom(format!("expected a duration, got '{b}'"))),
    }
}

pub(crate) fn ser_seconds<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_secs())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HostList {
    List(Vec<String>),
    Joined(String),
}

pub(crate) fn hosts<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    let raw = match HostList::deserialize(deserializer)? {
        HostList::List(items) => items,
        HostList::Joined(joined) => joined.split(',').map(str::to_owned).collect(),
    };
    Ok(raw
        .into_iter()
        .map(|h| h.trim().to_owned())
        .filter(|h| !h.is_empty())
        .collect())
}

/// Optional text; numbers are accepted and empty strings mean unset.
pub(crate) fn opt_text<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    Ok(Option::<Scalar>::deserialize(deserializer)?
        .map(Scalar::into_text)
        .filter(|s| !s.trim().is_empty()))
}

pub(crate) fn opt_secret<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<SecretString>, D::Error> {
    Ok(opt_text(deserializer)?.map(SecretString::from))
}

pub(crate) fn text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Scalar::deserialize(deserializer)?.into_text().trim().to_owned())
}

pub(crate) fn count<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    let text = Scalar::deserialize(deserializer)?.into_text();
    text.trim()
        .parse()
        .map_err(|_| de::Error::custom(format!("expected a non-negative integer, got '{text}'")))
}

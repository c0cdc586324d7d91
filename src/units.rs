//! Human-readable sizes and durations used in settings and tool output.

use eyre::{bail, eyre, WrapErr};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;
const GB: u64 = 1024 * MB;
const TB: u64 = 1024 * GB;

static BYTES_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+(?:\.\d+)?)\s*([kKmMgGtT]i?[bB]|[bB])?$").expect("byte size pattern is valid")
});

/// A size in bytes, parsed from strings like `512MB` or `2.5GB`.
///
/// Units are binary multiples; `kB`, `KB` and `KiB` all mean 1024 bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub fn bytes(self) -> u64 {
        self.0
    }
}

impl FromStr for ByteSize {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        let captures = BYTES_PATTERN
            .captures(text)
            .ok_or_else(|| eyre!("invalid format for size in bytes ({text})"))?;
        let quantity: f64 = captures[1]
            .parse()
            .wrap_err_with(|| format!("invalid format for size in bytes ({text})"))?;
        let unit = captures
            .get(2)
            .map(|m| m.as_str().to_ascii_uppercase())
            .unwrap_or_default();
        let multiplier = match unit.chars().next() {
            None | Some('B') => 1,
            Some('K') => KB,
            Some('M') => MB,
            Some('G') => GB,
            Some('T') => TB,
            Some(_) => bail!("invalid unit for size in bytes ({text})"),
        };
        Ok(ByteSize((quantity * multiplier as f64).round() as u64))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (unit, divisor) = match self.0 {
            n if n >= GB && n % GB == 0 => ("GB", GB),
            n if n >= MB && n % MB == 0 => ("MB", MB),
            n if n >= KB && n % KB == 0 => ("KB", KB),
            _ => ("B", 1),
        };
        write!(f, "{}{}", self.0 / divisor, unit)
    }
}

impl Serialize for ByteSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(u64),
    Text(String),
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match NumberOrText::deserialize(deserializer)? {
            NumberOrText::Number(n) => Ok(ByteSize(n)),
            NumberOrText::Text(text) => text.parse().map_err(de::Error::custom),
        }
    }
}

/// Parses durations such as `90s`, `10m`, `1h30m` or `4w`.
///
/// Supported units are `s`, `m`, `h`, `d` and `w`. A bare number is read as
/// seconds.
pub fn parse_duration(text: &str) -> eyre::Result<Duration> {
    let text = text.trim();
    if text.is_empty() {
        bail!("empty duration");
    }
    if let Ok(seconds) = text.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }

    let mut total = 0u64;
    let mut digits = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 60 * 60,
            'd' => 24 * 60 * 60,
            'w' => 7 * 24 * 60 * 60,
            _ => bail!("invalid unit {c:?} in duration {text:?}"),
        };
        if digits.is_empty() {
            bail!("missing quantity before {c:?} in duration {text:?}");
        }
        let quantity: u64 = digits.parse().wrap_err_with(|| format!("invalid duration {text:?}"))?;
        total = total.saturating_add(quantity.saturating_mul(unit));
        digits.clear();
    }
    if !digits.is_empty() {
        bail!("missing unit after {digits} in duration {text:?}");
    }
    Ok(Duration::from_secs(total))
}

/// Serde adapter for [`Duration`] fields written with [`parse_duration`].
pub mod duration_text {
    use super::*;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match NumberOrText::deserialize(deserializer)? {
            NumberOrText::Number(n) => Ok(Duration::from_secs(n)),
            NumberOrText::Text(text) => parse_duration(&text).map_err(de::Error::custom),
        }
    }
}

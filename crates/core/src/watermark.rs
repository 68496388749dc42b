//! Per-stream watermark store.
//!
//! A watermark is the source-side modification timestamp up to which a
//! stream has been fully synchronized. It is persisted in the `watermarks`
//! table and only ever moves forward: [`WatermarkStore::advance`] re-reads the
//! stored value inside the same SQLite transaction that writes the new one,
//! and the connection mutex serializes concurrent writers.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::queries::{
    read_watermark, read_watermark_origin, write_watermark, write_watermark_origin, WatermarkEntry,
};
use crate::db::Database;
use crate::errors::WatermarkError;

/// A point in source time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Watermark(DateTime<Utc>);

impl Watermark {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self(at)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.0
    }

    /// RFC 3339 in UTC with the shortest exact fraction
    /// (`2025-01-01T00:00:00.123Z`). Sub-millisecond precision is kept so a
    /// stored watermark never sorts before the record it was taken from.
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::AutoSi, true)
    }

    pub fn parse(s: &str) -> Option<Self> {
        DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| Self(dt.with_timezone(&Utc)))
    }
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_rfc3339())
    }
}

/// Value used for a stream that has never been advanced.
///
/// Parsed from `now`, `now-<n><unit>` (unit one of `ms`, `s`, `m`, `h`, `d`)
/// or an RFC 3339 timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatermarkDefault {
    /// `now - grace`, evaluated once when the stream's origin is pinned.
    NowMinus(Duration),
    Fixed(Watermark),
}

impl WatermarkDefault {
    pub fn evaluate(&self) -> Result<Watermark, WatermarkError> {
        match self {
            Self::NowMinus(grace) => Utc::now()
                .checked_sub_signed(*grace)
                .map(Watermark)
                .ok_or_else(|| WatermarkError::InvalidExpression(format!("now-{}ms", grace.num_milliseconds()))),
            Self::Fixed(w) => Ok(*w),
        }
    }
}

static NOW_MINUS: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^now\s*-\s*(\d+)\s*(ms|s|m|h|d)$").ok());

impl FromStr for WatermarkDefault {
    type Err = WatermarkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || WatermarkError::InvalidExpression(s.to_string());
        let expr = s.trim();
        if expr == "now" {
            return Ok(Self::NowMinus(Duration::zero()));
        }

        let re = NOW_MINUS.as_ref().ok_or_else(invalid)?;
        if let Some(caps) = re.captures(expr) {
            let n: i64 = caps[1].parse().map_err(|_| invalid())?;
            let grace = match &caps[2] {
                "ms" => Duration::try_milliseconds(n),
                "s" => Duration::try_seconds(n),
                "m" => Duration::try_minutes(n),
                "h" => Duration::try_hours(n),
                _ => Duration::try_days(n),
            }
            .ok_or_else(invalid)?;
            // Reject offsets that reach past the representable range.
            Utc::now().checked_sub_signed(grace).ok_or_else(invalid)?;
            return Ok(Self::NowMinus(grace));
        }

        Watermark::parse(expr).map(Self::Fixed).ok_or_else(invalid)
    }
}

/// SQLite-backed watermark store shared by the orchestrator and status
/// readers.
pub struct WatermarkStore {
    db: Arc<Database>,
    fallback: WatermarkDefault,
    defaults: RwLock<HashMap<String, WatermarkDefault>>,
}

impl WatermarkStore {
    pub fn new(db: Arc<Database>, fallback: WatermarkDefault) -> Self {
        Self {
            db,
            fallback,
            defaults: RwLock::new(HashMap::new()),
        }
    }

    /// Register the default expression for one stream.
    pub fn set_default(&self, stream: &str, default: WatermarkDefault) {
        let mut defaults = self.defaults.write().unwrap_or_else(|e| e.into_inner());
        defaults.insert(stream.to_string(), default);
    }

    /// Current watermark for `stream`.
    ///
    /// Falls back to the pinned origin, then to a fresh evaluation of the
    /// default. Read-only: nothing is pinned here.
    pub fn get(&self, stream: &str) -> Result<Watermark, WatermarkError> {
        if let Some(raw) = self.db.get_watermark(stream)? {
            return parse_stored(stream, &raw);
        }
        let origin = read_watermark_origin(&self.db.conn(), stream)?;
        match origin {
            Some(raw) => parse_stored(stream, &raw),
            None => self.default_for(stream).evaluate(),
        }
    }

    /// Current watermark for `stream`, pinning the default as the stream's
    /// origin the first time it is needed.
    ///
    /// Until the first advance, every cycle starts from the same origin, so
    /// a record that failed in an earlier cycle is still inside the window.
    pub fn get_or_init(&self, stream: &str) -> Result<Watermark, WatermarkError> {
        let default = self.default_for(stream);
        self.db.transaction(|conn| {
            if let Some(raw) = read_watermark(conn, stream)? {
                return parse_stored(stream, &raw);
            }
            if let Some(raw) = read_watermark_origin(conn, stream)? {
                return parse_stored(stream, &raw);
            }
            let origin = default.evaluate()?;
            write_watermark_origin(conn, stream, &origin.to_rfc3339())?;
            info!(stream, origin = %origin, "no stored watermark, pinned default origin");
            Ok(origin)
        })
    }

    fn default_for(&self, stream: &str) -> WatermarkDefault {
        let defaults = self.defaults.read().unwrap_or_else(|e| e.into_inner());
        defaults.get(stream).unwrap_or(&self.fallback).clone()
    }

    /// Whether anything has been persisted for `stream` yet.
    pub fn is_persisted(&self, stream: &str) -> Result<bool, WatermarkError> {
        Ok(self.db.get_watermark(stream)?.is_some())
    }

    /// Move `stream` forward to `new`. Returns the stored value afterwards.
    ///
    /// Equal values are a no-op; an earlier value is a
    /// [`WatermarkError::Regression`].
    pub fn advance(&self, stream: &str, new: Watermark) -> Result<Watermark, WatermarkError> {
        self.db.transaction(|conn| {
            let current = read_watermark(conn, stream)?
                .map(|raw| parse_stored(stream, &raw))
                .transpose()?;

            match current {
                Some(cur) if new < cur => Err(WatermarkError::Regression {
                    stream: stream.to_string(),
                    current: cur.to_rfc3339(),
                    attempted: new.to_rfc3339(),
                }),
                Some(cur) if new == cur => Ok(cur),
                _ => {
                    write_watermark(conn, stream, &new.to_rfc3339())?;
                    info!(stream, from = ?current.map(|c| c.to_rfc3339()), to = %new, "watermark advanced");
                    Ok(new)
                }
            }
        })
    }

    pub fn list(&self) -> Result<Vec<WatermarkEntry>, WatermarkError> {
        Ok(self.db.list_watermarks()?)
    }
}

fn parse_stored(stream: &str, raw: &str) -> Result<Watermark, WatermarkError> {
    Watermark::parse(raw).ok_or_else(|| WatermarkError::Corrupt {
        stream: stream.to_string(),
        value: raw.to_string(),
    })
}

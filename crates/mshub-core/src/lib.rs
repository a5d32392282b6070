//! Core leaderboard domain model for mshub.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "mshub-core";

/// Time window a leaderboard ranks over.
///
/// The canonical text form (`7d`, `epoch-3`, `all`) is what gets stored as
/// the period key, so `Display` and `FromStr` must round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Period {
    Days(u16),
    Epoch(u32),
    AllTime,
}

impl Period {
    pub fn days(&self) -> Option<u16> {
        match self {
            Period::Days(d) => Some(*d),
            _ => None,
        }
    }

    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Period::Days(d) => write!(f, "{d}d"),
            Period::Epoch(e) => write!(f, "epoch-{e}"),
            Period::AllTime => f.write_str("all"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid period `{0}` (expected e.g. 7d, 30d, epoch-3, all)")]
pub struct PeriodParseError(pub String);

impl FromStr for Period {
    type Err = PeriodParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let s = input.trim().to_ascii_lowercase();
        if matches!(s.as_str(), "all" | "all-time" | "alltime") {
            return Ok(Period::AllTime);
        }
        if let Some(rest) = s.strip_prefix("epoch") {
            let rest = rest.trim_start_matches(['-', '_']);
            return rest
                .parse::<u32>()
                .map(Period::Epoch)
                .map_err(|_| PeriodParseError(input.to_string()));
        }
        let digits = s.strip_suffix('d').unwrap_or(&s);
        match digits.parse::<u16>() {
            Ok(d) if d > 0 => Ok(Period::Days(d)),
            _ => Err(PeriodParseError(input.to_string())),
        }
    }
}

impl TryFrom<String> for Period {
    type Error = PeriodParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Period> for String {
    fn from(value: Period) -> Self {
        value.to_string()
    }
}

/// What a paginated fetch does once a page exhausts its rate-limit retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop the run; the previous snapshot stays authoritative.
    #[default]
    Abort,
    /// Count the page as failed and continue with the next one.
    SkipPage,
}

/// One ranked entrant in the canonical shape every vendor is normalized to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardRow {
    pub rank: u32,
    pub username: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub score: f64,
    pub mindshare: f64,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

impl LeaderboardRow {
    pub fn new(rank: u32, username: impl Into<String>, score: f64) -> Self {
        Self {
            rank,
            username: username.into(),
            display_name: None,
            avatar_url: None,
            score,
            mindshare: 0.0,
            metrics: BTreeMap::new(),
        }
    }
}

/// One completed ingestion of one vendor's data for one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardSnapshot {
    pub snapshot_id: Uuid,
    pub source: String,
    pub period: Period,
    pub fetched_at: DateTime<Utc>,
    pub row_count: usize,
    pub failed_pages: u32,
}

impl LeaderboardSnapshot {
    pub fn pointer(&self) -> CachePointer {
        CachePointer {
            source: self.source.clone(),
            period: self.period.clone(),
            snapshot_id: self.snapshot_id,
            fetched_at: self.fetched_at,
            row_count: self.row_count,
        }
    }
}

/// The currently authoritative snapshot for a `(source, period)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePointer {
    pub source: String,
    pub period: Period,
    pub snapshot_id: Uuid,
    pub fetched_at: DateTime<Utc>,
    pub row_count: usize,
}

/// A row read back together with the stamp of the snapshot it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StampedRow {
    pub snapshot_id: Uuid,
    pub fetched_at: DateTime<Utc>,
    #[serde(flatten)]
    pub row: LeaderboardRow,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_parses_loose_inputs() {
        assert_eq!("7".parse::<Period>().unwrap(), Period::Days(7));
        assert_eq!("30D".parse::<Period>().unwrap(), Period::Days(30));
        assert_eq!("epoch-3".parse::<Period>().unwrap(), Period::Epoch(3));
        assert_eq!("epoch3".parse::<Period>().unwrap(), Period::Epoch(3));
        assert_eq!("All-Time".parse::<Period>().unwrap(), Period::AllTime);
        assert!("0d".parse::<Period>().is_err());
        assert!("weekly".parse::<Period>().is_err());
    }

    #[test]
    fn period_serializes_as_canonical_key() {
        let json = serde_json::to_string(&Period::Days(7)).unwrap();
        assert_eq!(json, "\"7d\"");
        let back: Period = serde_json::from_str("\"epoch-12\"").unwrap();
        assert_eq!(back, Period::Epoch(12));
        assert_eq!(Period::AllTime.key(), "all");
    }

    #[test]
    fn stamped_row_flattens_row_fields() {
        let stamped = StampedRow {
            snapshot_id: Uuid::nil(),
            fetched_at: DateTime::parse_from_rfc3339("2026-10-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            row: LeaderboardRow::new(1, "alice", 10.0),
        };
        let value = serde_json::to_value(&stamped).unwrap();
        assert_eq!(value["username"], "alice");
        assert_eq!(value["rank"], 1);
        assert!(value.get("row").is_none());
    }
}

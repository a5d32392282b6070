//! Vendor adapter contracts + one explicit adapter per leaderboard vendor.
//!
//! An adapter knows three things about its vendor: how to ask for page N of a
//! period, which envelope the rows arrive in, and how one raw record maps onto
//! [`LeaderboardRow`]. Everything else (retries, stamping, publishing) lives
//! outside this crate.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mshub_core::{LeaderboardRow, Period};
use mshub_storage::{ArtifactStore, FetchError, HttpFetcher, Page, PageSource};
use scraper::{Html, Selector};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "mshub-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    Json,
    Html,
}

impl PayloadFormat {
    pub fn extension(self) -> &'static str {
        match self {
            PayloadFormat::Json => "json",
            PayloadFormat::Html => "html",
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{source_id} does not serve period {period}")]
    UnsupportedPeriod { source_id: String, period: Period },
    #[error("invalid url {url}: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("unexpected response envelope: {0}")]
    Envelope(String),
    #[error("malformed record: {0}")]
    Record(String),
    #[error("no adapter registered for `{0}`")]
    UnknownAdapter(String),
}

/// Rows of one extracted page, still in the vendor's record shape.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedPage {
    pub records: Vec<JsonValue>,
    pub end_of_data: bool,
}

/// One vendor record mapped onto canonical fields, before rank assignment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowDraft {
    pub rank: Option<u32>,
    pub username: Option<String>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub score: f64,
    pub mindshare: f64,
    pub metrics: BTreeMap<String, f64>,
}

pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn display_name(&self) -> &str;
    fn default_base_url(&self) -> &str;
    fn default_periods(&self) -> Vec<Period>;

    fn default_page_size(&self) -> u32 {
        100
    }

    fn payload_format(&self) -> PayloadFormat {
        PayloadFormat::Json
    }

    /// URL for the zero-based `page_index` of `period`.
    fn page_url(
        &self,
        base_url: &str,
        period: &Period,
        page_index: u32,
        page_size: u32,
    ) -> Result<String, AdapterError>;

    fn extract_page(
        &self,
        body: &[u8],
        page_index: u32,
        page_size: u32,
    ) -> Result<ExtractedPage, AdapterError>;

    fn normalize_record(&self, record: &JsonValue) -> Result<RowDraft, AdapterError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub rows: Vec<LeaderboardRow>,
    pub dropped: usize,
}

/// Map raw records onto canonical rows with unique 1-based ranks.
///
/// Records without an identity are dropped. A record without a vendor rank
/// takes its 1-based position in `records`; if ranks then collide, the whole
/// set is re-ranked by `(rank, position)`.
pub fn normalize_records(
    adapter: &dyn SourceAdapter,
    records: &[JsonValue],
) -> Result<Normalized, AdapterError> {
    let mut ranked = Vec::with_capacity(records.len());
    let mut dropped = 0usize;

    for (position, record) in records.iter().enumerate() {
        let draft = adapter.normalize_record(record)?;
        let Some(username) = draft.username.clone() else {
            dropped += 1;
            warn!(source_id = adapter.source_id(), position, "dropping record without identity");
            continue;
        };
        let positional = u32::try_from(position + 1).unwrap_or(u32::MAX);
        ranked.push((draft.rank.unwrap_or(positional), position, username, draft));
    }

    let mut seen = HashSet::with_capacity(ranked.len());
    let collided = ranked.iter().any(|(rank, ..)| !seen.insert(*rank));
    ranked.sort_by_key(|(rank, position, ..)| (*rank, *position));

    let rows = ranked
        .into_iter()
        .enumerate()
        .map(|(idx, (rank, _, username, draft))| LeaderboardRow {
            rank: if collided {
                u32::try_from(idx + 1).unwrap_or(u32::MAX)
            } else {
                rank
            },
            username,
            display_name: draft.display_name,
            avatar_url: draft.avatar_url,
            score: draft.score,
            mindshare: draft.mindshare,
            metrics: draft.metrics,
        })
        .collect();

    Ok(Normalized { rows, dropped })
}

fn number_from_json(value: &JsonValue) -> Option<f64> {
    let n = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().trim_end_matches('%').replace(',', "").parse().ok(),
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

/// Absent, `null`, or unparseable numbers become 0.
fn lenient_f64<'de, D>(de: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(de)?;
    Ok(value.as_ref().and_then(number_from_json).unwrap_or(0.0))
}

fn lenient_rank<'de, D>(de: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(de)?;
    Ok(value
        .as_ref()
        .and_then(number_from_json)
        .filter(|r| *r >= 1.0 && r.fract() == 0.0 && *r <= f64::from(u32::MAX))
        .map(|r| r as u32))
}

fn clean_handle(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim().trim_start_matches('@').trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn clean_text(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn metrics<const N: usize>(pairs: [(&str, f64); N]) -> BTreeMap<String, f64> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn from_record<T: DeserializeOwned>(record: &JsonValue) -> Result<T, AdapterError> {
    T::deserialize(record).map_err(|e| AdapterError::Record(e.to_string()))
}

fn parse_envelope<T: DeserializeOwned>(body: &[u8]) -> Result<T, AdapterError> {
    serde_json::from_slice(body).map_err(|e| AdapterError::Envelope(e.to_string()))
}

fn build_url(
    base_url: &str,
    path: &str,
    params: &[(&str, String)],
) -> Result<String, AdapterError> {
    let joined = format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    Url::parse_with_params(&joined, params.iter().map(|(k, v)| (*k, v.as_str())))
        .map(|url| url.to_string())
        .map_err(|e| AdapterError::InvalidUrl {
            url: joined.clone(),
            message: e.to_string(),
        })
}

fn unsupported(adapter: &dyn SourceAdapter, period: &Period) -> AdapterError {
    AdapterError::UnsupportedPeriod {
        source_id: adapter.source_id().to_string(),
        period: period.clone(),
    }
}

// Goat Network yappers: {"data": [...], "hasMore": bool}, 1-based pages.

#[derive(Debug, Clone, Copy, Default)]
pub struct YappersAdapter;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct YappersEnvelope {
    data: Vec<JsonValue>,
    #[serde(default)]
    has_more: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct YapperRecord {
    #[serde(default, deserialize_with = "lenient_rank")]
    rank: Option<u32>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    avatar: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    mindshare: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    yap_score: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    tweet_count: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    engagement: f64,
}

impl SourceAdapter for YappersAdapter {
    fn source_id(&self) -> &str {
        "yappers"
    }

    fn display_name(&self) -> &str {
        "Goat Network Yappers"
    }

    fn default_base_url(&self) -> &str {
        "https://api.goat.network"
    }

    fn default_periods(&self) -> Vec<Period> {
        vec![Period::Days(7), Period::Days(30)]
    }

    fn page_url(
        &self,
        base_url: &str,
        period: &Period,
        page_index: u32,
        page_size: u32,
    ) -> Result<String, AdapterError> {
        let days = period.days().ok_or_else(|| unsupported(self, period))?;
        build_url(
            base_url,
            "/api/v1/yappers/leaderboard",
            &[
                ("days", days.to_string()),
                ("page", (page_index + 1).to_string()),
                ("limit", page_size.to_string()),
            ],
        )
    }

    fn extract_page(
        &self,
        body: &[u8],
        _page_index: u32,
        _page_size: u32,
    ) -> Result<ExtractedPage, AdapterError> {
        let envelope: YappersEnvelope = parse_envelope(body)?;
        Ok(ExtractedPage {
            records: envelope.data,
            end_of_data: envelope.has_more == Some(false),
        })
    }

    fn normalize_record(&self, record: &JsonValue) -> Result<RowDraft, AdapterError> {
        let rec: YapperRecord = from_record(record)?;
        Ok(RowDraft {
            rank: rec.rank,
            username: clean_handle(rec.username.as_deref()),
            display_name: clean_text(rec.display_name),
            avatar_url: clean_text(rec.avatar),
            score: rec.yap_score,
            mindshare: rec.mindshare,
            metrics: metrics([("tweet_count", rec.tweet_count), ("engagement", rec.engagement)]),
        })
    }
}

// DuelDuck: bare array, offset paging.

#[derive(Debug, Clone, Copy, Default)]
pub struct DuelDuckAdapter;

#[derive(Debug, Deserialize)]
struct DuelDuckRecord {
    #[serde(default, deserialize_with = "lenient_rank")]
    position: Option<u32>,
    #[serde(default)]
    handle: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    avatar_url: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    points: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    mindshare: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    duels_won: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    duels_played: f64,
}

impl SourceAdapter for DuelDuckAdapter {
    fn source_id(&self) -> &str {
        "duelduck"
    }

    fn display_name(&self) -> &str {
        "DuelDuck"
    }

    fn default_base_url(&self) -> &str {
        "https://api.duelduck.com"
    }

    fn default_periods(&self) -> Vec<Period> {
        vec![Period::Days(7), Period::Days(30), Period::AllTime]
    }

    fn default_page_size(&self) -> u32 {
        50
    }

    fn page_url(
        &self,
        base_url: &str,
        period: &Period,
        page_index: u32,
        page_size: u32,
    ) -> Result<String, AdapterError> {
        let period_param = match period {
            Period::Days(d) => format!("{d}d"),
            Period::AllTime => "all".to_string(),
            Period::Epoch(_) => return Err(unsupported(self, period)),
        };
        build_url(
            base_url,
            "/api/leaderboard",
            &[
                ("period", period_param),
                ("offset", (u64::from(page_index) * u64::from(page_size)).to_string()),
                ("limit", page_size.to_string()),
            ],
        )
    }

    fn extract_page(
        &self,
        body: &[u8],
        _page_index: u32,
        _page_size: u32,
    ) -> Result<ExtractedPage, AdapterError> {
        let records: Vec<JsonValue> = parse_envelope(body)?;
        Ok(ExtractedPage {
            records,
            end_of_data: false,
        })
    }

    fn normalize_record(&self, record: &JsonValue) -> Result<RowDraft, AdapterError> {
        let rec: DuelDuckRecord = from_record(record)?;
        Ok(RowDraft {
            rank: rec.position,
            username: clean_handle(rec.handle.as_deref()),
            display_name: clean_text(rec.name),
            avatar_url: clean_text(rec.avatar_url),
            score: rec.points,
            mindshare: rec.mindshare,
            metrics: metrics([("duels_won", rec.duels_won), ("duels_played", rec.duels_played)]),
        })
    }
}

// Adichain: {"entries": [...], "total": n}.

#[derive(Debug, Clone, Copy, Default)]
pub struct AdichainAdapter;

#[derive(Debug, Deserialize)]
struct AdichainEnvelope {
    entries: Vec<JsonValue>,
    #[serde(default)]
    total: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdichainRecord {
    #[serde(default, deserialize_with = "lenient_rank")]
    rank: Option<u32>,
    #[serde(default)]
    twitter_username: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    profile_image_url: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    score: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    mindshare_pct: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    followers: f64,
}

impl SourceAdapter for AdichainAdapter {
    fn source_id(&self) -> &str {
        "adichain"
    }

    fn display_name(&self) -> &str {
        "Adichain"
    }

    fn default_base_url(&self) -> &str {
        "https://api.adichain.io"
    }

    fn default_periods(&self) -> Vec<Period> {
        vec![Period::Days(7), Period::Days(30)]
    }

    fn page_url(
        &self,
        base_url: &str,
        period: &Period,
        page_index: u32,
        page_size: u32,
    ) -> Result<String, AdapterError> {
        let timeframe = match period {
            Period::Days(7) => "7D",
            Period::Days(30) => "30D",
            Period::AllTime => "ALL",
            _ => return Err(unsupported(self, period)),
        };
        build_url(
            base_url,
            "/v1/leaderboard",
            &[
                ("timeframe", timeframe.to_string()),
                ("page", (page_index + 1).to_string()),
                ("pageSize", page_size.to_string()),
            ],
        )
    }

    fn extract_page(
        &self,
        body: &[u8],
        page_index: u32,
        page_size: u32,
    ) -> Result<ExtractedPage, AdapterError> {
        let envelope: AdichainEnvelope = parse_envelope(body)?;
        let seen = (u64::from(page_index) + 1) * u64::from(page_size);
        Ok(ExtractedPage {
            end_of_data: envelope.total.is_some_and(|total| seen >= total),
            records: envelope.entries,
        })
    }

    fn normalize_record(&self, record: &JsonValue) -> Result<RowDraft, AdapterError> {
        let rec: AdichainRecord = from_record(record)?;
        Ok(RowDraft {
            rank: rec.rank,
            username: clean_handle(rec.twitter_username.as_deref()),
            display_name: clean_text(rec.name),
            avatar_url: clean_text(rec.profile_image_url),
            score: rec.score,
            mindshare: rec.mindshare_pct,
            metrics: metrics([("followers", rec.followers)]),
        })
    }
}

// HeyElsa: {"leaderboard": [...], "next_page": n | null}.

#[derive(Debug, Clone, Copy, Default)]
pub struct HeyElsaAdapter;

#[derive(Debug, Deserialize)]
struct HeyElsaEnvelope {
    leaderboard: Vec<JsonValue>,
    #[serde(default)]
    next_page: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct HeyElsaUser {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    avatar: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HeyElsaRecord {
    #[serde(default, deserialize_with = "lenient_rank")]
    rank: Option<u32>,
    #[serde(default)]
    user: HeyElsaUser,
    #[serde(default, deserialize_with = "lenient_f64")]
    xp: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    mindshare: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    referrals: f64,
}

impl SourceAdapter for HeyElsaAdapter {
    fn source_id(&self) -> &str {
        "heyelsa"
    }

    fn display_name(&self) -> &str {
        "HeyElsa"
    }

    fn default_base_url(&self) -> &str {
        "https://api.heyelsa.ai"
    }

    fn default_periods(&self) -> Vec<Period> {
        vec![Period::Days(7), Period::AllTime]
    }

    fn page_url(
        &self,
        base_url: &str,
        period: &Period,
        page_index: u32,
        page_size: u32,
    ) -> Result<String, AdapterError> {
        let window = match period {
            Period::Days(d) => format!("{d}d"),
            Period::AllTime => "all".to_string(),
            Period::Epoch(_) => return Err(unsupported(self, period)),
        };
        build_url(
            base_url,
            "/v1/mindshare/leaderboard",
            &[
                ("window", window),
                ("page", (page_index + 1).to_string()),
                ("per_page", page_size.to_string()),
            ],
        )
    }

    /// A missing or `null` `next_page` ends the run.
    fn extract_page(
        &self,
        body: &[u8],
        _page_index: u32,
        _page_size: u32,
    ) -> Result<ExtractedPage, AdapterError> {
        let envelope: HeyElsaEnvelope = parse_envelope(body)?;
        Ok(ExtractedPage {
            records: envelope.leaderboard,
            end_of_data: envelope.next_page.is_none(),
        })
    }

    fn normalize_record(&self, record: &JsonValue) -> Result<RowDraft, AdapterError> {
        let rec: HeyElsaRecord = from_record(record)?;
        Ok(RowDraft {
            rank: rec.rank,
            username: clean_handle(rec.user.username.as_deref()),
            display_name: clean_text(rec.user.display_name),
            avatar_url: clean_text(rec.user.avatar),
            score: rec.xp,
            mindshare: rec.mindshare,
            metrics: metrics([("referrals", rec.referrals)]),
        })
    }
}

// Wallchain: {"data": {"entries": [...], "isLastPage": bool}}, zero-based pages, epochs.

#[derive(Debug, Clone, Copy, Default)]
pub struct WallchainAdapter;

#[derive(Debug, Deserialize)]
struct WallchainEnvelope {
    data: WallchainData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WallchainData {
    entries: Vec<JsonValue>,
    #[serde(default)]
    is_last_page: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WallchainRecord {
    #[serde(default, deserialize_with = "lenient_rank")]
    position: Option<u32>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    x_handle: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    avatar_url: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    score: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    mindshare_percentage: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    relative_mindshare: f64,
}

impl SourceAdapter for WallchainAdapter {
    fn source_id(&self) -> &str {
        "wallchain"
    }

    fn display_name(&self) -> &str {
        "Wallchain Quacks"
    }

    fn default_base_url(&self) -> &str {
        "https://api.wallchain.xyz"
    }

    fn default_periods(&self) -> Vec<Period> {
        vec![Period::Days(7), Period::Days(30)]
    }

    fn page_url(
        &self,
        base_url: &str,
        period: &Period,
        page_index: u32,
        page_size: u32,
    ) -> Result<String, AdapterError> {
        let window = match period {
            Period::Epoch(e) => ("epoch", e.to_string()),
            Period::Days(d) => ("days", d.to_string()),
            Period::AllTime => ("period", "all".to_string()),
        };
        build_url(
            base_url,
            "/api/leaderboard",
            &[
                window,
                ("page", page_index.to_string()),
                ("size", page_size.to_string()),
            ],
        )
    }

    fn extract_page(
        &self,
        body: &[u8],
        _page_index: u32,
        _page_size: u32,
    ) -> Result<ExtractedPage, AdapterError> {
        let envelope: WallchainEnvelope = parse_envelope(body)?;
        Ok(ExtractedPage {
            records: envelope.data.entries,
            end_of_data: envelope.data.is_last_page,
        })
    }

    fn normalize_record(&self, record: &JsonValue) -> Result<RowDraft, AdapterError> {
        let rec: WallchainRecord = from_record(record)?;
        Ok(RowDraft {
            rank: rec.position,
            username: clean_handle(rec.username.as_deref())
                .or_else(|| clean_handle(rec.x_handle.as_deref())),
            display_name: clean_text(rec.display_name),
            avatar_url: clean_text(rec.avatar_url),
            score: rec.score,
            mindshare: rec.mindshare_percentage,
            metrics: metrics([("relative_mindshare", rec.relative_mindshare)]),
        })
    }
}

/// Mindoshare-engine sites render the whole board into `__NEXT_DATA__`.
/// Several deployments share the engine, so the adapter is parameterized by
/// source id and base URL.
#[derive(Debug, Clone)]
pub struct MindoshareAdapter {
    source_id: String,
    display_name: String,
    base_url: String,
}

impl MindoshareAdapter {
    pub fn new(
        source_id: impl Into<String>,
        display_name: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            display_name: display_name.into(),
            base_url: base_url.into(),
        }
    }
}

impl Default for MindoshareAdapter {
    fn default() -> Self {
        Self::new("mindoshare", "Mindoshare", "https://mindoshare.xyz")
    }
}

#[derive(Debug, Deserialize)]
struct MindoshareRecord {
    #[serde(default, deserialize_with = "lenient_rank")]
    rank: Option<u32>,
    #[serde(default)]
    handle: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    pfp: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    mindshare: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    score: f64,
}

impl SourceAdapter for MindoshareAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn default_base_url(&self) -> &str {
        &self.base_url
    }

    fn default_periods(&self) -> Vec<Period> {
        vec![Period::Days(7), Period::Days(30)]
    }

    fn default_page_size(&self) -> u32 {
        1000
    }

    fn payload_format(&self) -> PayloadFormat {
        PayloadFormat::Html
    }

    fn page_url(
        &self,
        base_url: &str,
        period: &Period,
        _page_index: u32,
        _page_size: u32,
    ) -> Result<String, AdapterError> {
        let timeframe = match period {
            Period::Days(d) => format!("{d}d"),
            Period::AllTime => "all".to_string(),
            Period::Epoch(_) => return Err(unsupported(self, period)),
        };
        build_url(base_url, "/leaderboard", &[("timeframe", timeframe)])
    }

    fn extract_page(
        &self,
        body: &[u8],
        _page_index: u32,
        _page_size: u32,
    ) -> Result<ExtractedPage, AdapterError> {
        let html = String::from_utf8_lossy(body);
        let document = Html::parse_document(&html);
        let selector = Selector::parse("script#__NEXT_DATA__")
            .map_err(|e| AdapterError::Envelope(e.to_string()))?;
        let script = document
            .select(&selector)
            .next()
            .ok_or_else(|| AdapterError::Envelope("missing __NEXT_DATA__ script".to_string()))?;
        let payload: JsonValue = serde_json::from_str(&script.text().collect::<String>())
            .map_err(|e| AdapterError::Envelope(format!("invalid __NEXT_DATA__ JSON: {e}")))?;
        let records = payload
            .pointer("/props/pageProps/leaderboard")
            .and_then(JsonValue::as_array)
            .cloned()
            .ok_or_else(|| {
                AdapterError::Envelope("missing props.pageProps.leaderboard".to_string())
            })?;
        Ok(ExtractedPage {
            records,
            end_of_data: true,
        })
    }

    fn normalize_record(&self, record: &JsonValue) -> Result<RowDraft, AdapterError> {
        let rec: MindoshareRecord = from_record(record)?;
        Ok(RowDraft {
            rank: rec.rank,
            username: clean_handle(rec.handle.as_deref()),
            display_name: clean_text(rec.name),
            avatar_url: clean_text(rec.pfp),
            score: rec.score,
            mindshare: rec.mindshare,
            metrics: BTreeMap::new(),
        })
    }
}

pub const ADAPTER_KINDS: [&str; 6] = [
    "yappers",
    "duelduck",
    "adichain",
    "heyelsa",
    "wallchain",
    "mindoshare",
];

/// Resolve an adapter by kind. `source_id` only matters for engine-style
/// adapters that serve several sites.
pub fn adapter_for(kind: &str, source_id: &str) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    match kind {
        "yappers" => Ok(Box::new(YappersAdapter)),
        "duelduck" => Ok(Box::new(DuelDuckAdapter)),
        "adichain" => Ok(Box::new(AdichainAdapter)),
        "heyelsa" => Ok(Box::new(HeyElsaAdapter)),
        "wallchain" => Ok(Box::new(WallchainAdapter)),
        "mindoshare" => {
            let defaults = MindoshareAdapter::default();
            let adapter = if source_id == kind {
                defaults
            } else {
                MindoshareAdapter::new(source_id, source_id, defaults.base_url)
            };
            Ok(Box::new(adapter))
        }
        other => Err(AdapterError::UnknownAdapter(other.to_string())),
    }
}

/// Bridges one adapter + period to the paginator over live HTTP.
pub struct VendorPager<'a> {
    pub adapter: &'a dyn SourceAdapter,
    pub http: &'a HttpFetcher,
    pub archive: Option<&'a ArtifactStore>,
    pub run_id: Uuid,
    pub base_url: String,
    pub period: Period,
    pub page_size: u32,
    pub started_at: DateTime<Utc>,
}

#[async_trait]
impl<'a> PageSource for VendorPager<'a> {
    type Item = JsonValue;

    async fn fetch_page(&self, page_index: u32) -> Result<Page<JsonValue>, FetchError> {
        let url = self
            .adapter
            .page_url(&self.base_url, &self.period, page_index, self.page_size)
            .map_err(|e| FetchError::Malformed {
                url: self.base_url.clone(),
                message: e.to_string(),
            })?;
        let resp = self
            .http
            .fetch_once(self.run_id, self.adapter.source_id(), &url)
            .await?;

        if let Some(archive) = self.archive {
            if let Err(err) = archive
                .store_page(
                    self.started_at,
                    self.adapter.source_id(),
                    &self.period.key(),
                    self.adapter.payload_format().extension(),
                    &resp.body,
                )
                .await
            {
                warn!(
                    source_id = self.adapter.source_id(),
                    page_index,
                    error = %err,
                    "failed to archive page"
                );
            }
        }

        let page = self
            .adapter
            .extract_page(&resp.body, page_index, self.page_size)
            .map_err(|e| FetchError::Malformed {
                url: resp.final_url.clone(),
                message: e.to_string(),
            })?;
        Ok(Page {
            items: page.records,
            end_of_data: page.end_of_data,
        })
    }
}

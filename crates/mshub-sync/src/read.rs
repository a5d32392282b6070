//! Snapshot-consistent views over the published pointers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use mshub_core::{Period, StampedRow};
use mshub_storage::{SnapshotStore, StoreError};
use serde::Serialize;
use strsim::jaro_winkler;
use tracing::{debug, warn};
use uuid::Uuid;

const POINTER_RESOLVE_ATTEMPTS: usize = 3;
pub const SEARCH_SIMILARITY_THRESHOLD: f64 = 0.85;

/// Every row of exactly one snapshot, sorted by rank.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceView {
    pub source: String,
    pub period: Period,
    pub data: Vec<StampedRow>,
    pub last_updated: DateTime<Utc>,
    pub snapshot_id: Uuid,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnavailableSource {
    pub status: &'static str,
    pub period: Period,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SourceEntry {
    Available(SourceView),
    Unavailable(UnavailableSource),
}

impl SourceEntry {
    pub fn is_available(&self) -> bool {
        matches!(self, SourceEntry::Available(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergedView {
    pub sources: BTreeMap<String, SourceEntry>,
    pub available: usize,
    pub unavailable: usize,
}

/// Resolve the current pointer of `(source, period)` and return its rows.
///
/// The rows are fetched by snapshot id, never by "latest", so a publish that
/// lands mid-read cannot mix two snapshots. If the resolved snapshot was
/// pruned before its rows were read, the pointer is resolved again.
pub async fn read_source(
    store: &dyn SnapshotStore,
    source: &str,
    period: &Period,
) -> Result<Option<SourceView>, StoreError> {
    let mut last_err = None;
    for _ in 0..POINTER_RESOLVE_ATTEMPTS {
        let Some(pointer) = store.pointer(source, period).await? else {
            return Ok(None);
        };
        let data = match store.snapshot_rows(pointer.snapshot_id).await {
            Ok(rows) => rows,
            Err(StoreError::UnknownSnapshot(id)) => {
                debug!(
                    source_id = source,
                    %period,
                    snapshot_id = %id,
                    "snapshot pruned mid-read; re-resolving"
                );
                last_err = Some(StoreError::UnknownSnapshot(id));
                continue;
            }
            Err(err) => return Err(err),
        };
        if let Some(stray) = data.iter().find(|r| r.snapshot_id != pointer.snapshot_id) {
            return Err(StoreError::Corrupt(format!(
                "snapshot {} returned a row of snapshot {}",
                pointer.snapshot_id, stray.snapshot_id
            )));
        }
        return Ok(Some(SourceView {
            source: pointer.source,
            period: pointer.period,
            count: data.len(),
            data,
            last_updated: pointer.fetched_at,
            snapshot_id: pointer.snapshot_id,
        }));
    }
    Err(last_err.unwrap_or_else(|| StoreError::Unavailable(format!("{source}/{period}"))))
}

/// Read several sources at once. A source that has never been ingested, or
/// whose read fails, is reported unavailable without failing the others.
pub async fn merged_read(store: &dyn SnapshotStore, requests: &[(String, Period)]) -> MergedView {
    let mut view = MergedView::default();
    for (source, period) in requests {
        let entry = match read_source(store, source, period).await {
            Ok(Some(found)) => SourceEntry::Available(found),
            Ok(None) => SourceEntry::Unavailable(UnavailableSource {
                status: "unavailable",
                period: period.clone(),
                error: None,
            }),
            Err(err) => {
                warn!(source_id = %source, %period, error = %err, "source read failed");
                SourceEntry::Unavailable(UnavailableSource {
                    status: "unavailable",
                    period: period.clone(),
                    error: Some(err.to_string()),
                })
            }
        };
        if entry.is_available() {
            view.available += 1;
        } else {
            view.unavailable += 1;
        }
        view.sources.insert(source.clone(), entry);
    }
    view
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub source: String,
    pub period: Period,
    pub similarity: f64,
    #[serde(flatten)]
    pub row: StampedRow,
}

fn similarity(query: &str, candidate: &str) -> f64 {
    let candidate = candidate.to_lowercase();
    if candidate.contains(query) {
        1.0
    } else {
        jaro_winkler(query, &candidate)
    }
}

/// Find entrants matching `query` across every published source for `period`.
///
/// A source whose snapshot cannot be read is left out of the results.
pub async fn search(
    store: &dyn SnapshotStore,
    query: &str,
    period: &Period,
    limit: usize,
) -> Result<Vec<SearchHit>, StoreError> {
    let query = query.trim().trim_start_matches('@').to_lowercase();
    if query.is_empty() || limit == 0 {
        return Ok(Vec::new());
    }

    let mut hits = Vec::new();
    for pointer in store.pointers().await? {
        if &pointer.period != period {
            continue;
        }
        let view = match read_source(store, &pointer.source, period).await {
            Ok(Some(view)) => view,
            Ok(None) => continue,
            Err(err) => {
                warn!(
                    source_id = %pointer.source,
                    %period,
                    error = %err,
                    "skipping source in search"
                );
                continue;
            }
        };
        for row in view.data {
            let by_name = similarity(&query, &row.row.username);
            let by_display = row
                .row
                .display_name
                .as_deref()
                .map_or(0.0, |name| similarity(&query, name));
            let best = by_name.max(by_display);
            if best >= SEARCH_SIMILARITY_THRESHOLD {
                hits.push(SearchHit {
                    source: view.source.clone(),
                    period: view.period.clone(),
                    similarity: best,
                    row,
                });
            }
        }
    }

    hits.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then(a.row.row.rank.cmp(&b.row.row.rank))
            .then(a.source.cmp(&b.source))
    });
    hits.truncate(limit);
    Ok(hits)
}

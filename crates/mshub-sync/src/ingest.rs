//! Normalize, stamp, write, publish.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, SubsecRound, Utc};
use mshub_adapters::{normalize_records, AdapterError, SourceAdapter};
use mshub_core::{FailurePolicy, LeaderboardSnapshot, Period};
use mshub_storage::{
    fetch_all_pages, FetchStatus, PagePlan, PageSource, RetryPolicy, SnapshotStore, StoreError,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::SourceRegistry;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Published(LeaderboardSnapshot),
    Skipped { reason: String },
}

impl IngestOutcome {
    fn skipped(reason: impl Into<String>) -> Self {
        IngestOutcome::Skipped {
            reason: reason.into(),
        }
    }

    pub fn snapshot(&self) -> Option<&LeaderboardSnapshot> {
        match self {
            IngestOutcome::Published(snapshot) => Some(snapshot),
            IngestOutcome::Skipped { .. } => None,
        }
    }
}

/// Result of the paginated fetch that preceded an ingest.
#[derive(Debug, Clone, Serialize)]
pub struct PagerIngest {
    pub fetch_status: FetchStatus,
    pub pages_fetched: u32,
    pub failed_pages: u32,
    pub records: usize,
    pub outcome: IngestOutcome,
}

/// Payload pushed by an external scraper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeBatch {
    #[serde(default)]
    pub scraped_at: Option<DateTime<Utc>>,
    pub sources: Vec<BatchSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSource {
    pub source: String,
    pub period: Period,
    #[serde(default)]
    pub records: Vec<JsonValue>,
    #[serde(default)]
    pub failed_pages: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchEntryOutcome {
    pub source: String,
    pub period: Period,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl BatchEntryOutcome {
    fn new(entry: &BatchSource, status: &'static str, message: Option<String>) -> Self {
        Self {
            source: entry.source.clone(),
            period: entry.period.clone(),
            status,
            snapshot_id: None,
            row_count: None,
            message,
        }
    }
}

/// Turns raw vendor records into published snapshots.
///
/// Every ingest of one `(source, period)` runs under that key's lock, so a
/// cron run and a webhook push for the same key never interleave.
pub struct Ingestor {
    store: Arc<dyn SnapshotStore>,
    retain_snapshots: Option<usize>,
    clock: Clock,
    locks: Mutex<HashMap<(String, Period), Arc<Mutex<()>>>>,
}

impl Ingestor {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            store,
            retain_snapshots: None,
            clock: Arc::new(Utc::now),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Keep at most `keep` snapshots per `(source, period)` after each publish.
    pub fn with_retention(mut self, keep: Option<usize>) -> Self {
        self.retain_snapshots = keep.map(|k| k.max(1));
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    async fn lock_for(&self, source_id: &str, period: &Period) -> Arc<Mutex<()>> {
        let mut map = self.locks.lock().await;
        map.entry((source_id.to_string(), period.clone()))
            .or_default()
            .clone()
    }

    pub async fn ingest_records(
        &self,
        adapter: &dyn SourceAdapter,
        period: &Period,
        records: &[JsonValue],
        failed_pages: u32,
    ) -> Result<IngestOutcome, IngestError> {
        let span = info_span!("ingest", source_id = adapter.source_id(), period = %period);
        async {
            let lock = self.lock_for(adapter.source_id(), period).await;
            let _guard = lock.lock().await;
            self.ingest_locked(adapter, period, records, failed_pages).await
        }
        .instrument(span)
        .await
    }

    async fn ingest_locked(
        &self,
        adapter: &dyn SourceAdapter,
        period: &Period,
        records: &[JsonValue],
        failed_pages: u32,
    ) -> Result<IngestOutcome, IngestError> {
        let normalized = normalize_records(adapter, records)?;
        if normalized.rows.is_empty() {
            info!(records = records.len(), dropped = normalized.dropped, "nothing to publish");
            return Ok(IngestOutcome::skipped("no rows after normalization"));
        }

        let source_id = adapter.source_id();
        let previous = self.store.pointer(source_id, period).await?;
        let mut fetched_at = (self.clock)().trunc_subsecs(6);
        if let Some(prev) = &previous {
            let floor = prev.fetched_at + ChronoDuration::microseconds(1);
            if fetched_at < floor {
                fetched_at = floor;
            }
        }

        let snapshot = LeaderboardSnapshot {
            snapshot_id: Uuid::new_v4(),
            source: source_id.to_string(),
            period: period.clone(),
            fetched_at,
            row_count: normalized.rows.len(),
            failed_pages,
        };

        self.store.write_snapshot(&snapshot, &normalized.rows).await?;
        self.store.publish(&snapshot.pointer()).await?;
        info!(
            snapshot_id = %snapshot.snapshot_id,
            rows = snapshot.row_count,
            dropped = normalized.dropped,
            "published snapshot"
        );

        if let Some(keep) = self.retain_snapshots {
            match self.store.prune_superseded(source_id, period, keep).await {
                Ok(0) => {}
                Ok(pruned) => info!(pruned, "pruned superseded snapshots"),
                Err(err) => warn!(error = %err, "pruning superseded snapshots failed"),
            }
        }

        Ok(IngestOutcome::Published(snapshot))
    }

    /// Fetch every page, then ingest only if the fetch was complete.
    pub async fn ingest_from_pager<S>(
        &self,
        adapter: &dyn SourceAdapter,
        period: &Period,
        source: &S,
        plan: &PagePlan,
        retry: &RetryPolicy,
    ) -> Result<PagerIngest, IngestError>
    where
        S: PageSource<Item = JsonValue> + ?Sized,
    {
        let paged = fetch_all_pages(source, plan, retry).await;
        let fetch_status = paged.status();
        let outcome = match fetch_status {
            FetchStatus::Complete => {
                self.ingest_records(adapter, period, &paged.items, paged.failed_pages)
                    .await?
            }
            FetchStatus::Partial => {
                let reason = paged
                    .failure
                    .as_ref()
                    .map(|f| {
                        format!("partial fetch, page {} failed: {}", f.page_index, f.message)
                    })
                    .unwrap_or_else(|| "partial fetch".to_string());
                warn!(
                    source_id = adapter.source_id(),
                    period = %period,
                    %reason,
                    "keeping previous snapshot"
                );
                IngestOutcome::Skipped { reason }
            }
            FetchStatus::NoData => {
                let reason = match &paged.failure {
                    Some(f) => format!("no data, page {} failed: {}", f.page_index, f.message),
                    None => "vendor returned no rows".to_string(),
                };
                warn!(
                    source_id = adapter.source_id(),
                    period = %period,
                    %reason,
                    "keeping previous snapshot"
                );
                IngestOutcome::Skipped { reason }
            }
        };

        Ok(PagerIngest {
            fetch_status,
            pages_fetched: paged.pages_fetched,
            failed_pages: paged.failed_pages,
            records: paged.items.len(),
            outcome,
        })
    }

    /// Ingest every entry of a pushed batch independently.
    pub async fn ingest_batch(
        &self,
        registry: &SourceRegistry,
        batch: &ScrapeBatch,
    ) -> Vec<BatchEntryOutcome> {
        let mut outcomes = Vec::with_capacity(batch.sources.len());
        for entry in &batch.sources {
            outcomes.push(self.ingest_batch_entry(registry, batch.scraped_at, entry).await);
        }
        outcomes
    }

    async fn ingest_batch_entry(
        &self,
        registry: &SourceRegistry,
        scraped_at: Option<DateTime<Utc>>,
        entry: &BatchSource,
    ) -> BatchEntryOutcome {
        let Some(config) = registry.find(&entry.source) else {
            let err = AdapterError::UnknownAdapter(entry.source.clone());
            return BatchEntryOutcome::new(entry, "failed", Some(err.to_string()));
        };
        let adapter = match config.adapter() {
            Ok(adapter) => adapter,
            Err(err) => return BatchEntryOutcome::new(entry, "failed", Some(err.to_string())),
        };

        if entry.failed_pages > 0 && config.failure_policy == FailurePolicy::Abort {
            info!(
                source_id = %entry.source,
                period = %entry.period,
                failed_pages = entry.failed_pages,
                "keeping previous snapshot"
            );
            return BatchEntryOutcome::new(
                entry,
                "skipped",
                Some(format!("partial batch, {} failed pages", entry.failed_pages)),
            );
        }

        let span = info_span!("ingest", source_id = %entry.source, period = %entry.period);
        let result = self
            .ingest_unless_stale(adapter.as_ref(), scraped_at, entry)
            .instrument(span)
            .await;

        match result {
            Ok(IngestOutcome::Published(snapshot)) => BatchEntryOutcome {
                snapshot_id: Some(snapshot.snapshot_id),
                row_count: Some(snapshot.row_count),
                ..BatchEntryOutcome::new(entry, "published", None)
            },
            Ok(IngestOutcome::Skipped { reason }) => {
                BatchEntryOutcome::new(entry, "skipped", Some(reason))
            }
            Err(err) => {
                warn!(
                    source_id = %entry.source,
                    period = %entry.period,
                    error = %err,
                    "batch entry failed"
                );
                BatchEntryOutcome::new(entry, "failed", Some(err.to_string()))
            }
        }
    }

    /// Stale check and ingest under one hold of the key's lock, so no publish
    /// can land between them.
    async fn ingest_unless_stale(
        &self,
        adapter: &dyn SourceAdapter,
        scraped_at: Option<DateTime<Utc>>,
        entry: &BatchSource,
    ) -> Result<IngestOutcome, IngestError> {
        let lock = self.lock_for(&entry.source, &entry.period).await;
        let _guard = lock.lock().await;

        // Older than what is already published: a late or replayed push.
        if let Some(scraped_at) = scraped_at {
            if let Some(current) = self.store.pointer(&entry.source, &entry.period).await? {
                if current.fetched_at >= scraped_at {
                    return Ok(IngestOutcome::skipped(format!(
                        "scraped_at {scraped_at} is not newer than current snapshot {}",
                        current.fetched_at
                    )));
                }
            }
        }

        self.ingest_locked(adapter, &entry.period, &entry.records, entry.failed_pages)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mshub_adapters::DuelDuckAdapter;
    use mshub_core::{CachePointer, LeaderboardRow, StampedRow};
    use mshub_storage::{FetchError, MemorySnapshotStore, Page};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Memory store whose row writes can be made to fail.
    #[derive(Default)]
    struct FaultyStore {
        inner: MemorySnapshotStore,
        fail_writes: AtomicBool,
    }

    #[async_trait]
    impl SnapshotStore for FaultyStore {
        async fn write_snapshot(
            &self,
            snapshot: &LeaderboardSnapshot,
            rows: &[LeaderboardRow],
        ) -> Result<(), StoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("disk full".into()));
            }
            self.inner.write_snapshot(snapshot, rows).await
        }

        async fn publish(&self, pointer: &CachePointer) -> Result<(), StoreError> {
            self.inner.publish(pointer).await
        }

        async fn pointer(
            &self,
            source: &str,
            period: &Period,
        ) -> Result<Option<CachePointer>, StoreError> {
            self.inner.pointer(source, period).await
        }

        async fn pointers(&self) -> Result<Vec<CachePointer>, StoreError> {
            self.inner.pointers().await
        }

        async fn snapshot_rows(&self, snapshot_id: Uuid) -> Result<Vec<StampedRow>, StoreError> {
            self.inner.snapshot_rows(snapshot_id).await
        }

        async fn prune_superseded(
            &self,
            source: &str,
            period: &Period,
            keep: usize,
        ) -> Result<usize, StoreError> {
            self.inner.prune_superseded(source, period, keep).await
        }
    }

    struct OnePage(Vec<JsonValue>);

    #[async_trait]
    impl PageSource for OnePage {
        type Item = JsonValue;

        async fn fetch_page(&self, page_index: u32) -> Result<Page<JsonValue>, FetchError> {
            if page_index == 0 {
                Ok(Page::last(self.0.clone()))
            } else {
                Ok(Page::last(Vec::new()))
            }
        }
    }

    struct AlwaysRateLimited;

    #[async_trait]
    impl PageSource for AlwaysRateLimited {
        type Item = JsonValue;

        async fn fetch_page(&self, _page_index: u32) -> Result<Page<JsonValue>, FetchError> {
            Err(FetchError::HttpStatus {
                status: 429,
                url: "https://vendor.test".into(),
                retry_after: None,
            })
        }
    }

    fn records(n: usize) -> Vec<JsonValue> {
        (0..n)
            .map(|i| json!({"position": i + 1, "handle": format!("user{i}"), "points": 1000 - i}))
            .collect()
    }

    fn frozen_clock() -> Clock {
        let at = DateTime::parse_from_rfc3339("2026-10-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        Arc::new(move || at)
    }

    fn plan() -> PagePlan {
        PagePlan {
            page_size: 100,
            max_pages: 5,
            page_delay: Duration::ZERO,
            on_rate_limit_exhausted: FailurePolicy::Abort,
        }
    }

    #[tokio::test]
    async fn publishes_one_stamp_for_every_row() {
        let store = Arc::new(MemorySnapshotStore::new());
        let ingestor = Ingestor::new(store.clone());
        let outcome = ingestor
            .ingest_records(&DuelDuckAdapter, &Period::Days(7), &records(5), 0)
            .await
            .unwrap();
        let snapshot = outcome.snapshot().cloned().unwrap();

        let pointer = store.pointer("duelduck", &Period::Days(7)).await.unwrap().unwrap();
        assert_eq!(pointer.snapshot_id, snapshot.snapshot_id);
        let rows = store.snapshot_rows(pointer.snapshot_id).await.unwrap();
        assert_eq!(rows.len(), 5);
        assert!(rows
            .iter()
            .all(|r| r.snapshot_id == snapshot.snapshot_id && r.fetched_at == snapshot.fetched_at));
    }

    #[tokio::test]
    async fn fetched_at_strictly_increases_even_with_a_frozen_clock() {
        let store = Arc::new(MemorySnapshotStore::new());
        let ingestor = Ingestor::new(store.clone()).with_clock(frozen_clock());
        let mut stamps = Vec::new();
        for _ in 0..4 {
            let outcome = ingestor
                .ingest_records(&DuelDuckAdapter, &Period::Days(7), &records(2), 0)
                .await
                .unwrap();
            stamps.push(outcome.snapshot().unwrap().fetched_at);
        }
        assert!(stamps.windows(2).all(|w| w[0] < w[1]), "{stamps:?}");
    }

    #[tokio::test]
    async fn failed_write_leaves_pointer_unchanged() {
        let store = Arc::new(FaultyStore::default());
        let ingestor = Ingestor::new(store.clone());
        let first = ingestor
            .ingest_records(&DuelDuckAdapter, &Period::Days(7), &records(3), 0)
            .await
            .unwrap();
        let before = store.pointer("duelduck", &Period::Days(7)).await.unwrap();

        store.fail_writes.store(true, Ordering::SeqCst);
        let err = ingestor
            .ingest_records(&DuelDuckAdapter, &Period::Days(7), &records(9), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Store(StoreError::Unavailable(_))));

        let after = store.pointer("duelduck", &Period::Days(7)).await.unwrap();
        assert_eq!(before, after);
        assert_eq!(after.unwrap().snapshot_id, first.snapshot().unwrap().snapshot_id);
    }

    #[tokio::test]
    async fn malformed_records_abort_before_writing() {
        let store = Arc::new(MemorySnapshotStore::new());
        let ingestor = Ingestor::new(store.clone());
        let err = ingestor
            .ingest_records(&DuelDuckAdapter, &Period::Days(7), &[json!(42)], 0)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Adapter(_)));
        assert_eq!(store.snapshot_count().await, 0);
    }

    #[tokio::test]
    async fn empty_record_set_is_not_published() {
        let store = Arc::new(MemorySnapshotStore::new());
        let ingestor = Ingestor::new(store.clone());
        let outcome = ingestor
            .ingest_records(&DuelDuckAdapter, &Period::Days(7), &[], 0)
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Skipped { .. }));
        assert!(store.pointers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn aborted_fetch_keeps_previous_snapshot() {
        let store = Arc::new(MemorySnapshotStore::new());
        let ingestor = Ingestor::new(store.clone());
        let good = ingestor
            .ingest_from_pager(
                &DuelDuckAdapter,
                &Period::Days(7),
                &OnePage(records(3)),
                &plan(),
                &RetryPolicy::immediate(),
            )
            .await
            .unwrap();
        assert_eq!(good.fetch_status, FetchStatus::Complete);
        let published = good.outcome.snapshot().cloned().unwrap();

        let bad = ingestor
            .ingest_from_pager(
                &DuelDuckAdapter,
                &Period::Days(7),
                &AlwaysRateLimited,
                &plan(),
                &RetryPolicy::immediate(),
            )
            .await
            .unwrap();
        assert_eq!(bad.fetch_status, FetchStatus::NoData);
        assert!(matches!(bad.outcome, IngestOutcome::Skipped { .. }));

        let pointer = store.pointer("duelduck", &Period::Days(7)).await.unwrap().unwrap();
        assert_eq!(pointer.snapshot_id, published.snapshot_id);
    }

    #[tokio::test]
    async fn retention_prunes_superseded_snapshots() {
        let store = Arc::new(MemorySnapshotStore::new());
        let ingestor = Ingestor::new(store.clone()).with_retention(Some(2));
        for _ in 0..5 {
            ingestor
                .ingest_records(&DuelDuckAdapter, &Period::Days(7), &records(2), 0)
                .await
                .unwrap();
        }
        assert_eq!(store.snapshot_count().await, 2);
    }

    #[tokio::test]
    async fn batch_entries_are_isolated() {
        let store = Arc::new(MemorySnapshotStore::new());
        let ingestor = Ingestor::new(store.clone());
        let registry = SourceRegistry::builtin();
        let batch: ScrapeBatch = serde_json::from_value(json!({
            "sources": [
                {"source": "kaito", "period": "7d", "records": records(2)},
                {"source": "duelduck", "period": "30d", "records": records(2)},
                {"source": "duelduck", "period": "7d", "records": []}
            ]
        }))
        .unwrap();

        let outcomes = ingestor.ingest_batch(&registry, &batch).await;
        let statuses = outcomes.iter().map(|o| o.status).collect::<Vec<_>>();
        assert_eq!(statuses, vec!["failed", "published", "skipped"]);
        assert_eq!(outcomes[1].row_count, Some(2));
        assert!(store.pointer("duelduck", &Period::Days(30)).await.unwrap().is_some());
    }

    fn batch_entry(
        source: &str,
        period: Period,
        records: Vec<JsonValue>,
        failed_pages: u32,
    ) -> BatchSource {
        BatchSource {
            source: source.into(),
            period,
            records,
            failed_pages,
        }
    }

    #[tokio::test]
    async fn partial_batch_keeps_complete_snapshot_under_abort_policy() {
        let store = Arc::new(MemorySnapshotStore::new());
        let ingestor = Ingestor::new(store.clone());
        let registry = SourceRegistry::builtin();
        let complete = ingestor
            .ingest_records(&DuelDuckAdapter, &Period::Days(7), &records(50), 0)
            .await
            .unwrap();

        let batch = ScrapeBatch {
            scraped_at: None,
            sources: vec![batch_entry("duelduck", Period::Days(7), records(1), 3)],
        };
        let outcomes = ingestor.ingest_batch(&registry, &batch).await;
        assert_eq!(outcomes[0].status, "skipped");
        assert_eq!(outcomes[0].message.as_deref(), Some("partial batch, 3 failed pages"));

        let pointer = store.pointer("duelduck", &Period::Days(7)).await.unwrap().unwrap();
        assert_eq!(pointer.snapshot_id, complete.snapshot().unwrap().snapshot_id);
        assert_eq!(pointer.row_count, 50);
    }

    #[tokio::test]
    async fn partial_batch_publishes_under_skip_page_policy() {
        let store = Arc::new(MemorySnapshotStore::new());
        let ingestor = Ingestor::new(store.clone());
        let mut registry = SourceRegistry::builtin();
        for source in &mut registry.sources {
            source.failure_policy = FailurePolicy::SkipPage;
        }

        let batch = ScrapeBatch {
            scraped_at: None,
            sources: vec![batch_entry("duelduck", Period::Days(7), records(4), 2)],
        };
        let outcomes = ingestor.ingest_batch(&registry, &batch).await;
        assert_eq!(outcomes[0].status, "published");
        let pointer = store.pointer("duelduck", &Period::Days(7)).await.unwrap().unwrap();
        assert_eq!(pointer.row_count, 4);
    }

    #[tokio::test]
    async fn stale_check_sees_publish_that_lands_while_waiting_for_the_lock() {
        let store = Arc::new(MemorySnapshotStore::new());
        let ingestor = Ingestor::new(store.clone());
        let registry = SourceRegistry::builtin();
        let scraped_at = Utc::now().trunc_subsecs(6);
        let batch = ScrapeBatch {
            scraped_at: Some(scraped_at),
            sources: vec![batch_entry("duelduck", Period::Days(7), records(1), 0)],
        };

        let guard = ingestor
            .lock_for("duelduck", &Period::Days(7))
            .await
            .lock_owned()
            .await;
        let newer = LeaderboardSnapshot {
            snapshot_id: Uuid::new_v4(),
            source: "duelduck".into(),
            period: Period::Days(7),
            fetched_at: scraped_at + ChronoDuration::seconds(30),
            row_count: 3,
            failed_pages: 0,
        };
        let rows = (1..=3u32)
            .map(|rank| LeaderboardRow::new(rank, format!("cron{rank}"), 10.0))
            .collect::<Vec<_>>();

        let cron_publish = async {
            tokio::task::yield_now().await;
            store.write_snapshot(&newer, &rows).await.unwrap();
            store.publish(&newer.pointer()).await.unwrap();
            drop(guard);
        };
        let (outcomes, ()) = tokio::join!(ingestor.ingest_batch(&registry, &batch), cron_publish);

        assert_eq!(outcomes[0].status, "skipped");
        let pointer = store.pointer("duelduck", &Period::Days(7)).await.unwrap().unwrap();
        assert_eq!(pointer.snapshot_id, newer.snapshot_id);
    }

    #[tokio::test]
    async fn stale_batch_does_not_override_newer_snapshot() {
        let store = Arc::new(MemorySnapshotStore::new());
        let ingestor = Ingestor::new(store.clone());
        let registry = SourceRegistry::builtin();
        ingestor
            .ingest_records(&DuelDuckAdapter, &Period::Days(7), &records(3), 0)
            .await
            .unwrap();

        let batch = ScrapeBatch {
            scraped_at: Some(Utc::now() - ChronoDuration::hours(1)),
            sources: vec![batch_entry("duelduck", Period::Days(7), records(1), 0)],
        };
        let outcomes = ingestor.ingest_batch(&registry, &batch).await;
        assert_eq!(outcomes[0].status, "skipped");
        let pointer = store.pointer("duelduck", &Period::Days(7)).await.unwrap().unwrap();
        assert_eq!(pointer.row_count, 3);
    }
}

//! Snapshot store: append-only snapshot rows plus the `leaderboard_cache`
//! pointer table that decides which snapshot readers see.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mshub_core::{CachePointer, LeaderboardRow, LeaderboardSnapshot, Period, StampedRow};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

const INSERT_CHUNK: usize = 500;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("stale publish for {source_id}/{period}: {attempted} is not newer than {current}")]
    StalePointer {
        source_id: String,
        period: Period,
        attempted: DateTime<Utc>,
        current: DateTime<Utc>,
    },
    #[error("snapshot {0} has not been written")]
    UnknownSnapshot(Uuid),
    #[error("snapshot {0} already exists")]
    DuplicateSnapshot(Uuid),
    #[error("snapshot {snapshot_id} has duplicate rank {rank}")]
    DuplicateRank { snapshot_id: Uuid, rank: u32 },
    #[error("corrupt stored value: {0}")]
    Corrupt(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Storage client handed explicitly to the ingestor and readers.
///
/// `write_snapshot` never changes what readers see; only `publish` does, and
/// it is a single atomic replace of one pointer.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Durably write every row of one snapshot, all or nothing.
    async fn write_snapshot(
        &self,
        snapshot: &LeaderboardSnapshot,
        rows: &[LeaderboardRow],
    ) -> Result<(), StoreError>;

    /// Point `(source, period)` at an already-written snapshot. Rejects a
    /// pointer whose `fetched_at` is not newer than the current one.
    async fn publish(&self, pointer: &CachePointer) -> Result<(), StoreError>;

    async fn pointer(
        &self,
        source: &str,
        period: &Period,
    ) -> Result<Option<CachePointer>, StoreError>;

    async fn pointers(&self) -> Result<Vec<CachePointer>, StoreError>;

    /// Rows of one snapshot ordered by rank.
    async fn snapshot_rows(&self, snapshot_id: Uuid) -> Result<Vec<StampedRow>, StoreError>;

    /// Delete superseded snapshots of `(source, period)` beyond the newest
    /// `keep`. The pointed-to snapshot is never deleted.
    async fn prune_superseded(
        &self,
        source: &str,
        period: &Period,
        keep: usize,
    ) -> Result<usize, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    snapshots: HashMap<Uuid, (LeaderboardSnapshot, Vec<LeaderboardRow>)>,
    pointers: HashMap<(String, Period), CachePointer>,
}

/// Process-local store used when no database is configured, and in tests.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    state: RwLock<MemoryState>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot_count(&self) -> usize {
        self.state.read().await.snapshots.len()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn write_snapshot(
        &self,
        snapshot: &LeaderboardSnapshot,
        rows: &[LeaderboardRow],
    ) -> Result<(), StoreError> {
        let mut seen = HashSet::with_capacity(rows.len());
        for row in rows {
            if !seen.insert(row.rank) {
                return Err(StoreError::DuplicateRank {
                    snapshot_id: snapshot.snapshot_id,
                    rank: row.rank,
                });
            }
        }

        let mut state = self.state.write().await;
        if state.snapshots.contains_key(&snapshot.snapshot_id) {
            return Err(StoreError::DuplicateSnapshot(snapshot.snapshot_id));
        }
        let mut rows = rows.to_vec();
        rows.sort_by_key(|r| r.rank);
        state
            .snapshots
            .insert(snapshot.snapshot_id, (snapshot.clone(), rows));
        Ok(())
    }

    async fn publish(&self, pointer: &CachePointer) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if !state.snapshots.contains_key(&pointer.snapshot_id) {
            return Err(StoreError::UnknownSnapshot(pointer.snapshot_id));
        }
        let key = (pointer.source.clone(), pointer.period.clone());
        if let Some(current) = state.pointers.get(&key) {
            if current.fetched_at >= pointer.fetched_at {
                return Err(StoreError::StalePointer {
                    source_id: pointer.source.clone(),
                    period: pointer.period.clone(),
                    attempted: pointer.fetched_at,
                    current: current.fetched_at,
                });
            }
        }
        state.pointers.insert(key, pointer.clone());
        Ok(())
    }

    async fn pointer(
        &self,
        source: &str,
        period: &Period,
    ) -> Result<Option<CachePointer>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .pointers
            .get(&(source.to_string(), period.clone()))
            .cloned())
    }

    async fn pointers(&self) -> Result<Vec<CachePointer>, StoreError> {
        let state = self.state.read().await;
        let mut out = state.pointers.values().cloned().collect::<Vec<_>>();
        out.sort_by(|a, b| (&a.source, &a.period).cmp(&(&b.source, &b.period)));
        Ok(out)
    }

    async fn snapshot_rows(&self, snapshot_id: Uuid) -> Result<Vec<StampedRow>, StoreError> {
        let state = self.state.read().await;
        let (snapshot, rows) = state
            .snapshots
            .get(&snapshot_id)
            .ok_or(StoreError::UnknownSnapshot(snapshot_id))?;
        Ok(rows
            .iter()
            .map(|row| StampedRow {
                snapshot_id,
                fetched_at: snapshot.fetched_at,
                row: row.clone(),
            })
            .collect())
    }

    async fn prune_superseded(
        &self,
        source: &str,
        period: &Period,
        keep: usize,
    ) -> Result<usize, StoreError> {
        let mut state = self.state.write().await;
        let current = state
            .pointers
            .get(&(source.to_string(), period.clone()))
            .map(|p| p.snapshot_id);

        let mut candidates = state
            .snapshots
            .values()
            .filter(|(s, _)| s.source == source && &s.period == period)
            .map(|(s, _)| (s.fetched_at, s.snapshot_id))
            .collect::<Vec<_>>();
        candidates.sort_by(|a, b| b.cmp(a));

        let doomed = candidates
            .into_iter()
            .skip(keep)
            .map(|(_, id)| id)
            .filter(|id| Some(*id) != current)
            .collect::<Vec<_>>();
        for id in &doomed {
            state.snapshots.remove(id);
        }
        Ok(doomed.len())
    }
}

/// Postgres-backed store over the tables in `migrations/`.
#[derive(Debug, Clone)]
pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse_period(raw: &str) -> Result<Period, StoreError> {
    raw.parse()
        .map_err(|e: mshub_core::PeriodParseError| StoreError::Corrupt(e.to_string()))
}

fn pointer_from_row(row: &PgRow) -> Result<CachePointer, StoreError> {
    let period: String = row.try_get("period")?;
    let row_count: i32 = row.try_get("row_count")?;
    Ok(CachePointer {
        source: row.try_get("cache_type")?,
        period: parse_period(&period)?,
        snapshot_id: row.try_get("snapshot_id")?,
        fetched_at: row.try_get("last_updated")?,
        row_count: usize::try_from(row_count).unwrap_or_default(),
    })
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == "23503")
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn write_snapshot(
        &self,
        snapshot: &LeaderboardSnapshot,
        rows: &[LeaderboardRow],
    ) -> Result<(), StoreError> {
        let period_key = snapshot.period.key();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO leaderboard_snapshots
                   (snapshot_id, source, period, fetched_at, row_count, failed_pages)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(snapshot.snapshot_id)
        .bind(&snapshot.source)
        .bind(&period_key)
        .bind(snapshot.fetched_at)
        .bind(i32::try_from(snapshot.row_count).unwrap_or(i32::MAX))
        .bind(i32::try_from(snapshot.failed_pages).unwrap_or(i32::MAX))
        .execute(&mut *tx)
        .await?;

        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO leaderboard_rows \
                 (snapshot_id, source, period, rank, username, display_name, avatar_url, \
                 score, mindshare, metrics) ",
            );
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(snapshot.snapshot_id)
                    .push_bind(&snapshot.source)
                    .push_bind(&period_key)
                    .push_bind(i32::try_from(row.rank).unwrap_or(i32::MAX))
                    .push_bind(&row.username)
                    .push_bind(&row.display_name)
                    .push_bind(&row.avatar_url)
                    .push_bind(row.score)
                    .push_bind(row.mindshare)
                    .push_bind(Json(&row.metrics));
            });
            qb.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        debug!(snapshot_id = %snapshot.snapshot_id, rows = rows.len(), "snapshot rows committed");
        Ok(())
    }

    async fn publish(&self, pointer: &CachePointer) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO leaderboard_cache (cache_type, period, snapshot_id, last_updated, row_count)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (cache_type, period) DO UPDATE
               SET snapshot_id = EXCLUDED.snapshot_id,
                   last_updated = EXCLUDED.last_updated,
                   row_count = EXCLUDED.row_count
             WHERE leaderboard_cache.last_updated < EXCLUDED.last_updated
            "#,
        )
        .bind(&pointer.source)
        .bind(pointer.period.key())
        .bind(pointer.snapshot_id)
        .bind(pointer.fetched_at)
        .bind(i32::try_from(pointer.row_count).unwrap_or(i32::MAX))
        .execute(&self.pool)
        .await;

        let result = match result {
            Ok(result) => result,
            Err(err) if is_foreign_key_violation(&err) => {
                return Err(StoreError::UnknownSnapshot(pointer.snapshot_id))
            }
            Err(err) => return Err(err.into()),
        };

        if result.rows_affected() == 0 {
            let current = self
                .pointer(&pointer.source, &pointer.period)
                .await?
                .map(|p| p.fetched_at)
                .unwrap_or(pointer.fetched_at);
            return Err(StoreError::StalePointer {
                source_id: pointer.source.clone(),
                period: pointer.period.clone(),
                attempted: pointer.fetched_at,
                current,
            });
        }
        Ok(())
    }

    async fn pointer(
        &self,
        source: &str,
        period: &Period,
    ) -> Result<Option<CachePointer>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT cache_type, period, snapshot_id, last_updated, row_count
              FROM leaderboard_cache
             WHERE cache_type = $1
               AND period = $2
            "#,
        )
        .bind(source)
        .bind(period.key())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(pointer_from_row).transpose()
    }

    async fn pointers(&self) -> Result<Vec<CachePointer>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT cache_type, period, snapshot_id, last_updated, row_count
              FROM leaderboard_cache
             ORDER BY cache_type, period
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(pointer_from_row).collect()
    }

    async fn snapshot_rows(&self, snapshot_id: Uuid) -> Result<Vec<StampedRow>, StoreError> {
        let fetched_at: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT fetched_at FROM leaderboard_snapshots WHERE snapshot_id = $1",
        )
        .bind(snapshot_id)
        .fetch_optional(&self.pool)
        .await?;
        let fetched_at = fetched_at.ok_or(StoreError::UnknownSnapshot(snapshot_id))?;

        let rows = sqlx::query(
            r#"
            SELECT rank, username, display_name, avatar_url, score, mindshare, metrics
              FROM leaderboard_rows
             WHERE snapshot_id = $1
             ORDER BY rank
            "#,
        )
        .bind(snapshot_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let rank: i32 = row.try_get("rank")?;
            let metrics: Json<BTreeMap<String, f64>> = row.try_get("metrics")?;
            out.push(StampedRow {
                snapshot_id,
                fetched_at,
                row: LeaderboardRow {
                    rank: u32::try_from(rank)
                        .map_err(|_| StoreError::Corrupt(format!("negative rank {rank}")))?,
                    username: row.try_get("username")?,
                    display_name: row.try_get("display_name")?,
                    avatar_url: row.try_get("avatar_url")?,
                    score: row.try_get("score")?,
                    mindshare: row.try_get("mindshare")?,
                    metrics: metrics.0,
                },
            });
        }
        Ok(out)
    }

    async fn prune_superseded(
        &self,
        source: &str,
        period: &Period,
        keep: usize,
    ) -> Result<usize, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM leaderboard_snapshots s
             WHERE s.source = $1
               AND s.period = $2
               AND s.snapshot_id NOT IN (
                   SELECT snapshot_id
                     FROM leaderboard_snapshots
                    WHERE source = $1 AND period = $2
                    ORDER BY fetched_at DESC
                    LIMIT $3)
               AND s.snapshot_id NOT IN (
                   SELECT snapshot_id
                     FROM leaderboard_cache
                    WHERE cache_type = $1 AND period = $2)
            "#,
        )
        .bind(source)
        .bind(period.key())
        .bind(i64::try_from(keep).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?;
        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, SubsecRound};

    fn snapshot(
        source: &str,
        period: Period,
        fetched_at: DateTime<Utc>,
        rows: usize,
    ) -> LeaderboardSnapshot {
        LeaderboardSnapshot {
            snapshot_id: Uuid::new_v4(),
            source: source.to_string(),
            period,
            fetched_at,
            row_count: rows,
            failed_pages: 0,
        }
    }

    fn rows(n: u32) -> Vec<LeaderboardRow> {
        (1..=n)
            .map(|rank| LeaderboardRow::new(rank, format!("user{rank}"), f64::from(100 - rank)))
            .collect()
    }

    #[tokio::test]
    async fn written_snapshot_is_invisible_until_published() {
        let store = MemorySnapshotStore::new();
        let snap = snapshot("duelduck", Period::Days(7), Utc::now(), 3);
        store.write_snapshot(&snap, &rows(3)).await.unwrap();

        assert!(store.pointer("duelduck", &Period::Days(7)).await.unwrap().is_none());

        store.publish(&snap.pointer()).await.unwrap();
        let pointer = store.pointer("duelduck", &Period::Days(7)).await.unwrap().unwrap();
        assert_eq!(pointer.snapshot_id, snap.snapshot_id);
        let read = store.snapshot_rows(pointer.snapshot_id).await.unwrap();
        assert_eq!(read.len(), 3);
        assert!(read.iter().all(|r| r.snapshot_id == snap.snapshot_id));
    }

    #[tokio::test]
    async fn publish_rejects_unwritten_and_stale_pointers() {
        let store = MemorySnapshotStore::new();
        let now = Utc::now();
        let unwritten = snapshot("yappers", Period::Days(30), now, 0);
        assert!(matches!(
            store.publish(&unwritten.pointer()).await,
            Err(StoreError::UnknownSnapshot(_))
        ));

        let newer = snapshot("yappers", Period::Days(30), now, 2);
        let older = snapshot("yappers", Period::Days(30), now - ChronoDuration::seconds(5), 2);
        store.write_snapshot(&newer, &rows(2)).await.unwrap();
        store.write_snapshot(&older, &rows(2)).await.unwrap();
        store.publish(&newer.pointer()).await.unwrap();

        let err = store.publish(&older.pointer()).await.unwrap_err();
        assert!(matches!(err, StoreError::StalePointer { .. }));
        let pointer = store.pointer("yappers", &Period::Days(30)).await.unwrap().unwrap();
        assert_eq!(pointer.snapshot_id, newer.snapshot_id);
    }

    #[tokio::test]
    async fn duplicate_ranks_are_rejected_before_anything_is_written() {
        let store = MemorySnapshotStore::new();
        let snap = snapshot("adichain", Period::Days(7), Utc::now(), 2);
        let dup = vec![LeaderboardRow::new(1, "a", 1.0), LeaderboardRow::new(1, "b", 1.0)];
        assert!(matches!(
            store.write_snapshot(&snap, &dup).await,
            Err(StoreError::DuplicateRank { rank: 1, .. })
        ));
        assert_eq!(store.snapshot_count().await, 0);
    }

    #[tokio::test]
    async fn prune_keeps_newest_and_pointed_snapshot() {
        let store = MemorySnapshotStore::new();
        let base = Utc::now();
        let mut ids = Vec::new();
        for i in 0..4 {
            let snap = snapshot("heyelsa", Period::AllTime, base + ChronoDuration::seconds(i), 1);
            store.write_snapshot(&snap, &rows(1)).await.unwrap();
            ids.push(snap);
        }
        // pointer stays on the oldest snapshot, which must survive pruning
        store.publish(&ids[0].pointer()).await.unwrap();
        let other = snapshot("wallchain", Period::AllTime, base, 1);
        store.write_snapshot(&other, &rows(1)).await.unwrap();

        let removed = store.prune_superseded("heyelsa", &Period::AllTime, 1).await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.snapshot_rows(ids[0].snapshot_id).await.is_ok());
        assert!(store.snapshot_rows(ids[3].snapshot_id).await.is_ok());
        assert!(store.snapshot_rows(ids[1].snapshot_id).await.is_err());
        assert!(store.snapshot_rows(other.snapshot_id).await.is_ok());
    }

    /// Postgres-backed tests run only when `MSHUB_TEST_DATABASE_URL` is set.
    async fn pg_store() -> Option<PgSnapshotStore> {
        let url = std::env::var("MSHUB_TEST_DATABASE_URL").ok()?;
        let store = PgSnapshotStore::connect(&url).await.unwrap();
        store.migrate().await.unwrap();
        Some(store)
    }

    fn unique_source() -> String {
        format!("pgtest-{}", Uuid::new_v4())
    }

    #[tokio::test]
    async fn pg_publish_is_monotonic_and_requires_written_rows() {
        let Some(store) = pg_store().await else {
            return;
        };
        let source = unique_source();
        let now = Utc::now().trunc_subsecs(6);

        let unwritten = snapshot(&source, Period::Days(7), now, 0);
        assert!(matches!(
            store.publish(&unwritten.pointer()).await,
            Err(StoreError::UnknownSnapshot(id)) if id == unwritten.snapshot_id
        ));

        let newer = snapshot(&source, Period::Days(7), now, 3);
        let same_stamp = snapshot(&source, Period::Days(7), now, 3);
        let older = snapshot(&source, Period::Days(7), now - ChronoDuration::seconds(5), 3);
        for snap in [&newer, &same_stamp, &older] {
            store.write_snapshot(snap, &rows(3)).await.unwrap();
        }
        assert!(store.pointer(&source, &Period::Days(7)).await.unwrap().is_none());

        store.publish(&newer.pointer()).await.unwrap();
        for rejected in [&same_stamp, &older] {
            let err = store.publish(&rejected.pointer()).await.unwrap_err();
            assert!(matches!(err, StoreError::StalePointer { current, .. } if current == now));
        }

        let pointer = store.pointer(&source, &Period::Days(7)).await.unwrap().unwrap();
        assert_eq!(pointer.snapshot_id, newer.snapshot_id);
        assert_eq!(pointer.fetched_at, now);
        let read = store.snapshot_rows(pointer.snapshot_id).await.unwrap();
        let ranks = read.iter().map(|r| r.row.rank).collect::<Vec<_>>();
        assert_eq!(ranks, vec![1, 2, 3]);
        assert!(read.iter().all(|r| r.fetched_at == now));
    }

    #[tokio::test]
    async fn pg_prune_keeps_newest_and_pointed_snapshot() {
        let Some(store) = pg_store().await else {
            return;
        };
        let source = unique_source();
        let base = Utc::now().trunc_subsecs(6);
        let mut snaps = Vec::new();
        for i in 0..4 {
            let snap = snapshot(&source, Period::AllTime, base + ChronoDuration::seconds(i), 1);
            store.write_snapshot(&snap, &rows(1)).await.unwrap();
            snaps.push(snap);
        }
        store.publish(&snaps[0].pointer()).await.unwrap();

        let removed = store.prune_superseded(&source, &Period::AllTime, 1).await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.snapshot_rows(snaps[0].snapshot_id).await.is_ok());
        assert!(store.snapshot_rows(snaps[3].snapshot_id).await.is_ok());
        for pruned in &snaps[1..3] {
            assert!(matches!(
                store.snapshot_rows(pruned.snapshot_id).await,
                Err(StoreError::UnknownSnapshot(_))
            ));
        }
    }
}

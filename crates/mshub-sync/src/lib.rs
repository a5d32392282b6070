//! Sync orchestration: source registry, scheduled vendor runs, ingestion,
//! snapshot-consistent reads and run reports.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use mshub_adapters::{adapter_for, AdapterError, SourceAdapter, VendorPager, ADAPTER_KINDS};
use mshub_core::{FailurePolicy, Period, StampedRow};
use mshub_storage::{
    ArtifactStore, FetchStatus, HttpClientConfig, HttpFetcher, MemorySnapshotStore, PagePlan,
    PgSnapshotStore, RetryPolicy, SnapshotStore,
};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

mod ingest;
mod read;

pub use ingest::{
    BatchEntryOutcome, BatchSource, Clock, IngestError, IngestOutcome, Ingestor, PagerIngest,
    ScrapeBatch,
};
pub use read::{
    merged_read, read_source, search, MergedView, SearchHit, SourceEntry, SourceView,
    UnavailableSource, SEARCH_SIMILARITY_THRESHOLD,
};

pub const CRATE_NAME: &str = "mshub-sync";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    /// Adapter kind; defaults to `source_id`.
    #[serde(default)]
    pub adapter: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub periods: Vec<Period>,
    #[serde(default)]
    pub page_size: Option<u32>,
    #[serde(default)]
    pub max_pages: Option<u32>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub page_delay_ms: Option<u64>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceConfig {
    pub fn adapter_kind(&self) -> &str {
        self.adapter.as_deref().unwrap_or(&self.source_id)
    }

    pub fn adapter(&self) -> Result<Box<dyn SourceAdapter>, AdapterError> {
        adapter_for(self.adapter_kind(), &self.source_id)
    }

    pub fn periods_for(&self, adapter: &dyn SourceAdapter) -> Vec<Period> {
        if self.periods.is_empty() {
            adapter.default_periods()
        } else {
            self.periods.clone()
        }
    }

    pub fn page_plan(&self, adapter: &dyn SourceAdapter) -> PagePlan {
        let defaults = PagePlan::default();
        PagePlan {
            page_size: self.page_size.unwrap_or_else(|| adapter.default_page_size()).max(1),
            max_pages: self.max_pages.unwrap_or(defaults.max_pages).max(1),
            page_delay: self
                .page_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.page_delay),
            on_rate_limit_exhausted: self.failure_policy,
        }
    }

    pub fn base_url(&self, adapter: &dyn SourceAdapter) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| adapter.default_base_url().to_string())
    }
}

impl SourceRegistry {
    /// Every known adapter with its vendor defaults, all enabled.
    pub fn builtin() -> Self {
        let sources = ADAPTER_KINDS
            .iter()
            .filter_map(|kind| adapter_for(kind, kind).ok())
            .map(|adapter| SourceConfig {
                source_id: adapter.source_id().to_string(),
                display_name: adapter.display_name().to_string(),
                enabled: true,
                adapter: None,
                base_url: None,
                periods: Vec::new(),
                page_size: None,
                max_pages: None,
                failure_policy: FailurePolicy::default(),
                page_delay_ms: None,
                notes: None,
            })
            .collect();
        Self { sources }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing source registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// `<root>/sources.yaml` when present, otherwise [`SourceRegistry::builtin`].
    pub async fn load_or_builtin(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("sources.yaml");
        if fs::try_exists(&path).await.unwrap_or(false) {
            Self::load(&path).await
        } else {
            warn!(path = %path.display(), "no source registry found; using builtin sources");
            Ok(Self::builtin())
        }
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.source_id.as_str()) {
                bail!("duplicate source_id {}", source.source_id);
            }
            let adapter = source
                .adapter()
                .with_context(|| format!("no adapter registered for {}", source.source_id))?;
            if adapter.source_id() != source.source_id {
                bail!(
                    "source_id {} must match its adapter's id {}",
                    source.source_id,
                    adapter.source_id()
                );
            }
        }
        Ok(())
    }

    pub fn find(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    pub fn adapter(&self, source_id: &str) -> Result<Box<dyn SourceAdapter>, AdapterError> {
        self.find(source_id)
            .ok_or_else(|| AdapterError::UnknownAdapter(source_id.to_string()))?
            .adapter()
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub artifacts_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub retain_snapshots: Option<usize>,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            artifacts_dir: std::env::var("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./artifacts")),
            scheduler_enabled: std::env::var("MSHUB_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron_1: std::env::var("SYNC_CRON_1").unwrap_or_else(|_| "0 6 * * *".to_string()),
            sync_cron_2: std::env::var("SYNC_CRON_2").unwrap_or_else(|_| "0 18 * * *".to_string()),
            user_agent: std::env::var("MSHUB_USER_AGENT")
                .unwrap_or_else(|_| "mshub-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("MSHUB_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            retain_snapshots: std::env::var("MSHUB_RETAIN_SNAPSHOTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0),
            workspace_root: std::env::var("MSHUB_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

/// Postgres when a URL is configured, otherwise a process-local store.
pub async fn open_store(database_url: Option<&str>) -> Result<Arc<dyn SnapshotStore>> {
    match database_url {
        Some(url) => {
            let store = PgSnapshotStore::connect(url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; snapshots are kept in memory only");
            Ok(Arc::new(MemorySnapshotStore::new()))
        }
    }
}

/// Outcome of one `(source, period)` within a sync run.
#[derive(Debug, Clone, Serialize)]
pub struct SourceRunRecord {
    pub source_id: String,
    pub period: Period,
    pub status: &'static str,
    pub fetch_status: Option<FetchStatus>,
    pub pages_fetched: u32,
    pub failed_pages: u32,
    pub records: usize,
    pub rows: usize,
    pub snapshot_id: Option<Uuid>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

impl SourceRunRecord {
    fn from_pager(source_id: &str, period: &Period, result: PagerIngest) -> Self {
        let (status, snapshot, message) = match result.outcome {
            IngestOutcome::Published(snapshot) => ("published", Some(snapshot), None),
            IngestOutcome::Skipped { reason } => ("skipped", None, Some(reason)),
        };
        Self {
            source_id: source_id.to_string(),
            period: period.clone(),
            status,
            fetch_status: Some(result.fetch_status),
            pages_fetched: result.pages_fetched,
            failed_pages: result.failed_pages,
            records: result.records,
            rows: snapshot.as_ref().map_or(0, |s| s.row_count),
            snapshot_id: snapshot.as_ref().map(|s| s.snapshot_id),
            fetched_at: snapshot.as_ref().map(|s| s.fetched_at),
            message,
        }
    }

    fn failed(source_id: &str, period: &Period, message: String) -> Self {
        Self {
            source_id: source_id.to_string(),
            period: period.clone(),
            status: "failed",
            fetch_status: None,
            pages_fetched: 0,
            failed_pages: 0,
            records: 0,
            rows: 0,
            snapshot_id: None,
            fetched_at: None,
            message: Some(message),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub enabled_sources: usize,
    pub published: usize,
    pub skipped: usize,
    pub failed: usize,
    pub rows_published: usize,
    pub reports_dir: String,
    pub parquet_manifest: String,
    pub sources: Vec<SourceRunRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Everything one source task needs, cloned per task.
#[derive(Clone)]
struct RunContext {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    http: Arc<HttpFetcher>,
    archive: ArtifactStore,
    ingestor: Arc<Ingestor>,
    retry: RetryPolicy,
}

pub struct SyncPipeline {
    config: SyncConfig,
    registry: SourceRegistry,
    artifact_store: ArtifactStore,
    http: Arc<HttpFetcher>,
    ingestor: Arc<Ingestor>,
    retry: RetryPolicy,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        registry: SourceRegistry,
        store: Arc<dyn SnapshotStore>,
    ) -> Result<Self> {
        let artifact_store = ArtifactStore::new(config.artifacts_dir.clone());
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let ingestor = Ingestor::new(store).with_retention(config.retain_snapshots);
        Ok(Self {
            config,
            registry,
            artifact_store,
            http: Arc::new(http),
            ingestor: Arc::new(ingestor),
            retry: RetryPolicy::default(),
        })
    }

    /// Load the registry and open the store that `config` points at.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let registry = SourceRegistry::load_or_builtin(&config.workspace_root).await?;
        let store = open_store(config.database_url.as_deref()).await?;
        Self::new(config, registry, store)
    }

    pub async fn from_env() -> Result<Self> {
        Self::from_config(SyncConfig::from_env()).await
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Shared with the webhook so both paths serialize on the same locks.
    pub fn ingestor(&self) -> Arc<Ingestor> {
        self.ingestor.clone()
    }

    pub fn store(&self) -> Arc<dyn SnapshotStore> {
        self.ingestor.store().clone()
    }

    /// Fetch and ingest every enabled source. Sources run concurrently; one
    /// source failing never stops the others.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let enabled_sources: Vec<SourceConfig> = self.registry.enabled().cloned().collect();
        info!(%run_id, sources = enabled_sources.len(), "starting sync run");

        let ctx = RunContext {
            run_id,
            started_at,
            http: self.http.clone(),
            archive: self.artifact_store.clone(),
            ingestor: self.ingestor.clone(),
            retry: self.retry,
        };

        let mut tasks = JoinSet::new();
        for source in &enabled_sources {
            let adapter = source
                .adapter()
                .with_context(|| format!("no adapter registered for {}", source.source_id))?;
            let ctx = ctx.clone();
            let source = source.clone();
            tasks.spawn(async move { run_source(&ctx, &source, adapter.as_ref()).await });
        }

        let mut records = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(batch) => records.extend(batch),
                Err(err) => error!(%run_id, error = %err, "source task did not finish"),
            }
        }
        records.sort_by(|a, b| (&a.source_id, &a.period).cmp(&(&b.source_id, &b.period)));

        let finished_at = Utc::now();
        let reports_dir = self.config.workspace_root.join("reports").join(run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let exported = self.collect_published_rows(&records).await;
        let manifest_path = self
            .export_parquet_snapshots(&reports_dir, &records, &exported)
            .await?;

        let count = |status: &str| records.iter().filter(|r| r.status == status).count();
        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            enabled_sources: enabled_sources.len(),
            published: count("published"),
            skipped: count("skipped"),
            failed: count("failed"),
            rows_published: records.iter().map(|r| r.rows).sum(),
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest: manifest_path.display().to_string(),
            sources: records,
        };
        self.write_reports(&reports_dir, &summary, &exported).await?;
        info!(
            %run_id,
            published = summary.published,
            skipped = summary.skipped,
            failed = summary.failed,
            "sync run finished"
        );
        Ok(summary)
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cron in [&self.config.sync_cron_1, &self.config.sync_cron_2] {
            let pipeline = Arc::clone(self);
            let job = Job::new_async(cron, move |_uuid, _l| {
                let pipeline = pipeline.clone();
                Box::pin(async move {
                    match pipeline.run_once().await {
                        Ok(summary) => info!(
                            run_id = %summary.run_id,
                            published = summary.published,
                            "scheduled sync complete"
                        ),
                        Err(err) => error!(error = ?err, "scheduled sync failed"),
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }

    pub async fn start_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        let Some(sched) = self.maybe_build_scheduler().await? else {
            return Ok(None);
        };
        sched.start().await.context("starting scheduler")?;
        info!(
            cron_1 = %self.config.sync_cron_1,
            cron_2 = %self.config.sync_cron_2,
            "sync scheduler started"
        );
        Ok(Some(sched))
    }

    async fn collect_published_rows(
        &self,
        records: &[SourceRunRecord],
    ) -> Vec<(SourceRunRecord, Vec<StampedRow>)> {
        let store = self.store();
        let mut out = Vec::new();
        for record in records {
            let Some(snapshot_id) = record.snapshot_id else {
                continue;
            };
            match store.snapshot_rows(snapshot_id).await {
                Ok(rows) => out.push((record.clone(), rows)),
                Err(err) => warn!(
                    source_id = %record.source_id,
                    %snapshot_id,
                    error = %err,
                    "published snapshot missing from export"
                ),
            }
        }
        out
    }

    async fn write_reports(
        &self,
        reports_dir: &Path,
        summary: &SyncRunSummary,
        exported: &[(SourceRunRecord, Vec<StampedRow>)],
    ) -> Result<()> {
        let summary_json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(reports_dir.join("run_summary.json"), summary_json)
            .await
            .context("writing run_summary.json")?;

        fs::write(reports_dir.join("daily_brief.md"), daily_brief(summary, exported))
            .await
            .context("writing daily_brief.md")?;
        Ok(())
    }

    async fn export_parquet_snapshots(
        &self,
        reports_dir: &Path,
        records: &[SourceRunRecord],
        exported: &[(SourceRunRecord, Vec<StampedRow>)],
    ) -> Result<PathBuf> {
        let snapshot_dir = reports_dir.join("snapshots");
        fs::create_dir_all(&snapshot_dir)
            .await
            .with_context(|| format!("creating {}", snapshot_dir.display()))?;

        let rows_path = snapshot_dir.join("leaderboard_rows.parquet");
        let runs_path = snapshot_dir.join("source_runs.parquet");
        write_rows_parquet(&rows_path, exported)?;
        write_source_runs_parquet(&runs_path, records)?;

        let manifest = ParquetManifest {
            schema_version: 1,
            files: vec![
                manifest_entry("leaderboard_rows", reports_dir, &rows_path)?,
                manifest_entry("source_runs", reports_dir, &runs_path)?,
            ],
        };

        let manifest_path = snapshot_dir.join("manifest.json");
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
        fs::write(&manifest_path, bytes)
            .await
            .with_context(|| format!("writing {}", manifest_path.display()))?;
        Ok(manifest_path)
    }
}

async fn run_source(
    ctx: &RunContext,
    source: &SourceConfig,
    adapter: &dyn SourceAdapter,
) -> Vec<SourceRunRecord> {
    let plan = source.page_plan(adapter);
    let base_url = source.base_url(adapter);
    let mut records = Vec::new();

    for period in source.periods_for(adapter) {
        let pager = VendorPager {
            adapter,
            http: &ctx.http,
            archive: Some(&ctx.archive),
            run_id: ctx.run_id,
            base_url: base_url.clone(),
            period: period.clone(),
            page_size: plan.page_size,
            started_at: ctx.started_at,
        };
        let record = match ctx
            .ingestor
            .ingest_from_pager(adapter, &period, &pager, &plan, &ctx.retry)
            .await
        {
            Ok(result) => SourceRunRecord::from_pager(&source.source_id, &period, result),
            Err(err) => {
                warn!(source_id = %source.source_id, %period, error = %err, "ingest failed");
                SourceRunRecord::failed(&source.source_id, &period, err.to_string())
            }
        };
        records.push(record);
    }
    records
}

fn daily_brief(
    summary: &SyncRunSummary,
    exported: &[(SourceRunRecord, Vec<StampedRow>)],
) -> String {
    let mut lines = vec![
        "# Mindshare Daily Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Enabled sources: {}", summary.enabled_sources),
        format!(
            "- Published: {} / skipped: {} / failed: {}",
            summary.published, summary.skipped, summary.failed
        ),
        String::new(),
        "## Sources".to_string(),
    ];
    for record in &summary.sources {
        let detail = match (record.status, &record.message) {
            ("published", _) => format!("{} rows over {} pages", record.rows, record.pages_fetched),
            (_, Some(message)) => message.clone(),
            _ => String::new(),
        };
        lines.push(format!(
            "- {}/{}: {} {}",
            record.source_id, record.period, record.status, detail
        ));
    }

    if !exported.is_empty() {
        lines.push(String::new());
        lines.push("## Top entrants".to_string());
        for (record, rows) in exported {
            let top = rows
                .iter()
                .take(3)
                .map(|r| format!("#{} {} ({:.2}%)", r.row.rank, r.row.username, r.row.mindshare))
                .collect::<Vec<_>>()
                .join(", ");
            lines.push(format!("- {}/{}: {}", record.source_id, record.period, top));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    SyncPipeline::from_env().await?.run_once().await
}

/// Ingest a [`ScrapeBatch`] JSON file against the configured store.
pub async fn ingest_batch_file_from_env(path: &Path) -> Result<Vec<BatchEntryOutcome>> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let batch: ScrapeBatch =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    let pipeline = SyncPipeline::from_env().await?;
    Ok(pipeline.ingestor().ingest_batch(pipeline.registry(), &batch).await)
}

pub fn report_daily_markdown(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = root.join("reports");
    let mut dirs = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter(|entry| entry.path().join("run_summary.json").exists())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();
    let dirs = dirs.into_iter().take(runs.max(1)).collect::<Vec<_>>();

    let mut lines = vec!["# Mindshare Report".to_string(), String::new()];
    for dir in dirs {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let summary_path = dir.path().join("run_summary.json");
        let manifest_path = dir.path().join("snapshots").join("manifest.json");

        let summary: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&summary_path)
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;
        let field = |name: &str| summary.get(name).and_then(|v| v.as_u64()).unwrap_or(0);

        lines.push(format!("## Run `{run_id}`"));
        if let Some(finished) = summary.get("finished_at").and_then(|v| v.as_str()) {
            lines.push(format!("- finished: {finished}"));
        }
        lines.push(format!(
            "- published: {} / skipped: {} / failed: {}",
            field("published"),
            field("skipped"),
            field("failed")
        ));
        lines.push(format!("- rows published: {}", field("rows_published")));
        let mut by_status: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for source in summary
            .get("sources")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
        {
            let status = source.get("status").and_then(|v| v.as_str()).unwrap_or("unknown");
            let id = source.get("source_id").and_then(|v| v.as_str()).unwrap_or("?");
            let period = source.get("period").and_then(|v| v.as_str()).unwrap_or("?");
            by_status
                .entry(status.to_string())
                .or_default()
                .push(format!("{id}/{period}"));
        }
        for (status, keys) in by_status {
            lines.push(format!("- {status}: {}", keys.join(", ")));
        }
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn saturating_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

fn write_rows_parquet(path: &Path, exported: &[(SourceRunRecord, Vec<StampedRow>)]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("period", DataType::Utf8, false),
        ArrowField::new("snapshot_id", DataType::Utf8, false),
        ArrowField::new("fetched_at", DataType::Utf8, false),
        ArrowField::new("rank", DataType::UInt32, false),
        ArrowField::new("username", DataType::Utf8, false),
        ArrowField::new("display_name", DataType::Utf8, true),
        ArrowField::new("score", DataType::Float64, false),
        ArrowField::new("mindshare", DataType::Float64, false),
    ]));

    let flat = exported
        .iter()
        .flat_map(|(record, rows)| rows.iter().map(move |row| (record, row)))
        .collect::<Vec<_>>();

    let source_ids = StringArray::from(
        flat.iter()
            .map(|(r, _)| Some(r.source_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let periods = StringArray::from(
        flat.iter()
            .map(|(r, _)| Some(r.period.key()))
            .collect::<Vec<_>>(),
    );
    let snapshot_ids = StringArray::from(
        flat.iter()
            .map(|(_, row)| Some(row.snapshot_id.to_string()))
            .collect::<Vec<_>>(),
    );
    let fetched_at = StringArray::from(
        flat.iter()
            .map(|(_, row)| Some(row.fetched_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let ranks = UInt32Array::from(flat.iter().map(|(_, row)| row.row.rank).collect::<Vec<_>>());
    let usernames = StringArray::from(
        flat.iter()
            .map(|(_, row)| Some(row.row.username.as_str()))
            .collect::<Vec<_>>(),
    );
    let display_names = StringArray::from(
        flat.iter()
            .map(|(_, row)| row.row.display_name.as_deref())
            .collect::<Vec<_>>(),
    );
    let scores = Float64Array::from(flat.iter().map(|(_, row)| row.row.score).collect::<Vec<_>>());
    let mindshare =
        Float64Array::from(flat.iter().map(|(_, row)| row.row.mindshare).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(source_ids),
            Arc::new(periods),
            Arc::new(snapshot_ids),
            Arc::new(fetched_at),
            Arc::new(ranks),
            Arc::new(usernames),
            Arc::new(display_names),
            Arc::new(scores),
            Arc::new(mindshare),
        ],
    )
    .context("building leaderboard rows record batch")?;
    write_parquet(path, batch)
}

fn write_source_runs_parquet(path: &Path, records: &[SourceRunRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("period", DataType::Utf8, false),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("pages_fetched", DataType::UInt32, false),
        ArrowField::new("failed_pages", DataType::UInt32, false),
        ArrowField::new("rows", DataType::UInt32, false),
        ArrowField::new("snapshot_id", DataType::Utf8, true),
    ]));

    let source_ids = StringArray::from(
        records
            .iter()
            .map(|r| Some(r.source_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let periods =
        StringArray::from(records.iter().map(|r| Some(r.period.key())).collect::<Vec<_>>());
    let statuses = StringArray::from(records.iter().map(|r| Some(r.status)).collect::<Vec<_>>());
    let pages = UInt32Array::from(records.iter().map(|r| r.pages_fetched).collect::<Vec<_>>());
    let failed = UInt32Array::from(records.iter().map(|r| r.failed_pages).collect::<Vec<_>>());
    let rows =
        UInt32Array::from(records.iter().map(|r| saturating_u32(r.rows)).collect::<Vec<_>>());
    let snapshot_ids = StringArray::from(
        records
            .iter()
            .map(|r| r.snapshot_id.map(|id| id.to_string()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(source_ids),
            Arc::new(periods),
            Arc::new(statuses),
            Arc::new(pages),
            Arc::new(failed),
            Arc::new(rows),
            Arc::new(snapshot_ids),
        ],
    )
    .context("building source runs record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mshub_adapters::DuelDuckAdapter;
    use serde_json::json;
    use tempfile::tempdir;

    const REGISTRY: &str = r#"
sources:
  - source_id: yappers
    display_name: Goat Network Yappers
    enabled: true
    periods: ["7d", "30d"]
    page_size: 100
    max_pages: 20
  - source_id: cookie-board
    display_name: Cookie Board
    enabled: false
    adapter: mindoshare
    base_url: https://cookie.example
    failure_policy: skip_page
    page_delay_ms: 0
"#;

    fn test_config(root: &Path) -> SyncConfig {
        SyncConfig {
            database_url: None,
            artifacts_dir: root.join("artifacts"),
            scheduler_enabled: false,
            sync_cron_1: "0 6 * * *".into(),
            sync_cron_2: "0 18 * * *".into(),
            user_agent: "mshub-test".into(),
            http_timeout_secs: 1,
            retain_snapshots: None,
            workspace_root: root.to_path_buf(),
        }
    }

    #[test]
    fn registry_parses_overrides_and_defaults() {
        let registry = SourceRegistry::from_yaml_str(REGISTRY).unwrap();
        assert_eq!(registry.enabled().count(), 1);

        let yappers = registry.find("yappers").unwrap();
        let adapter = yappers.adapter().unwrap();
        assert_eq!(yappers.periods_for(adapter.as_ref()), vec![Period::Days(7), Period::Days(30)]);
        assert_eq!(yappers.page_plan(adapter.as_ref()).max_pages, 20);

        let cookie = registry.find("cookie-board").unwrap();
        let adapter = cookie.adapter().unwrap();
        assert_eq!(adapter.source_id(), "cookie-board");
        assert_eq!(cookie.base_url(adapter.as_ref()), "https://cookie.example");
        let plan = cookie.page_plan(adapter.as_ref());
        assert_eq!(plan.on_rate_limit_exhausted, FailurePolicy::SkipPage);
        assert_eq!(plan.page_delay, Duration::ZERO);
        assert_eq!(plan.page_size, 1000);
    }

    #[test]
    fn registry_rejects_unknown_adapters_and_mismatched_ids() {
        let unknown = "sources:\n  - {source_id: kaito, display_name: Kaito, enabled: true}\n";
        assert!(SourceRegistry::from_yaml_str(unknown).is_err());
        let mismatched = "sources:\n  - {source_id: goat, display_name: Goat, \
                          enabled: true, adapter: yappers}\n";
        assert!(SourceRegistry::from_yaml_str(mismatched).is_err());
    }

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    #[tokio::test]
    async fn workspace_registry_loads() {
        let registry = SourceRegistry::load_or_builtin(&workspace_root()).await.unwrap();
        assert!(registry.find("wallchain").is_some());
        assert!(registry.enabled().all(|s| s.adapter().is_ok()));
    }

    fn sample_batch() -> ScrapeBatch {
        let path = workspace_root().join("fixtures/batch/scrape_batch.json");
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn sample_batch_ingests_per_entry() {
        let store: Arc<dyn SnapshotStore> = Arc::new(MemorySnapshotStore::new());
        let ingestor = Ingestor::new(store.clone());
        let registry = SourceRegistry::load(&workspace_root().join("sources.yaml"))
            .await
            .unwrap();

        let outcomes = ingestor.ingest_batch(&registry, &sample_batch()).await;
        let statuses = outcomes.iter().map(|o| o.status).collect::<Vec<_>>();
        assert_eq!(statuses, vec!["published", "published", "skipped"]);

        let wallchain = store.pointer("wallchain", &Period::Epoch(2)).await.unwrap().unwrap();
        let rows = store.snapshot_rows(wallchain.snapshot_id).await.unwrap();
        assert_eq!(rows[0].row.username, "wallflower_x");
    }

    #[tokio::test]
    async fn partial_batch_entry_is_skipped_under_abort_policy() {
        let store: Arc<dyn SnapshotStore> = Arc::new(MemorySnapshotStore::new());
        let ingestor = Ingestor::new(store.clone());

        let outcomes = ingestor.ingest_batch(&SourceRegistry::builtin(), &sample_batch()).await;
        let statuses = outcomes.iter().map(|o| o.status).collect::<Vec<_>>();
        assert_eq!(statuses, vec!["published", "skipped", "skipped"]);
        assert_eq!(outcomes[1].message.as_deref(), Some("partial batch, 1 failed pages"));
        assert!(store.pointer("wallchain", &Period::Epoch(2)).await.unwrap().is_none());
    }

    #[test]
    fn builtin_registry_covers_every_adapter() {
        let registry = SourceRegistry::builtin();
        assert_eq!(registry.sources.len(), ADAPTER_KINDS.len());
        assert!(registry.validate().is_ok());
    }

    #[tokio::test]
    async fn run_with_no_enabled_sources_still_writes_reports() {
        let dir = tempdir().unwrap();
        let registry = SourceRegistry { sources: Vec::new() };
        let store: Arc<dyn SnapshotStore> = Arc::new(MemorySnapshotStore::new());
        let pipeline = SyncPipeline::new(test_config(dir.path()), registry, store).unwrap();

        let summary = pipeline.run_once().await.unwrap();
        assert_eq!(summary.enabled_sources, 0);
        let reports_dir = PathBuf::from(&summary.reports_dir);
        assert!(reports_dir.join("run_summary.json").exists());
        assert!(reports_dir.join("daily_brief.md").exists());
        assert!(reports_dir.join("snapshots/leaderboard_rows.parquet").exists());

        let markdown = report_daily_markdown(5, Some(dir.path().to_path_buf())).unwrap();
        assert!(markdown.contains(&summary.run_id.to_string()));
    }

    #[tokio::test]
    async fn parquet_export_covers_published_rows_with_manifest_hashes() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn SnapshotStore> = Arc::new(MemorySnapshotStore::new());
        let pipeline =
            SyncPipeline::new(test_config(dir.path()), SourceRegistry::builtin(), store).unwrap();
        let outcome = pipeline
            .ingestor()
            .ingest_records(
                &DuelDuckAdapter,
                &Period::Days(7),
                &[json!({"position": 1, "handle": "alpha", "points": 5})],
                0,
            )
            .await
            .unwrap();
        let snapshot = outcome.snapshot().cloned().unwrap();

        let record = SourceRunRecord {
            source_id: "duelduck".into(),
            period: Period::Days(7),
            status: "published",
            fetch_status: Some(FetchStatus::Complete),
            pages_fetched: 1,
            failed_pages: 0,
            records: 1,
            rows: 1,
            snapshot_id: Some(snapshot.snapshot_id),
            fetched_at: Some(snapshot.fetched_at),
            message: None,
        };
        let records = vec![record];
        let exported = pipeline.collect_published_rows(&records).await;
        assert_eq!(exported[0].1.len(), 1);

        let manifest_path = pipeline
            .export_parquet_snapshots(dir.path(), &records, &exported)
            .await
            .unwrap();
        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(manifest_path).unwrap()).unwrap();
        let files = manifest["files"].as_array().unwrap();
        assert_eq!(files.len(), 2);
        let rows_bytes =
            std::fs::read(dir.path().join("snapshots/leaderboard_rows.parquet")).unwrap();
        assert_eq!(files[0]["sha256"], ArtifactStore::sha256_hex(&rows_bytes));
    }
}

//! Axum JSON API over the published leaderboard snapshots.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path as AxumPath, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use mshub_core::Period;
use mshub_storage::SnapshotStore;
use mshub_sync::{
    merged_read, read_source, search, Ingestor, ScrapeBatch, SourceRegistry, SyncConfig,
    SyncPipeline,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mshub-web";

const DEFAULT_PERIOD: Period = Period::Days(7);
const DEFAULT_SEARCH_LIMIT: usize = 50;
const MAX_SEARCH_LIMIT: usize = 500;
/// A batch carries every vendor's full board at once.
pub const DEFAULT_WEBHOOK_MAX_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub webhook_secret: Option<String>,
    pub webhook_max_bytes: usize,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("MSHUB_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            webhook_secret: std::env::var("INGEST_WEBHOOK_SECRET")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            webhook_max_bytes: std::env::var("MSHUB_WEBHOOK_MAX_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(DEFAULT_WEBHOOK_MAX_BYTES),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SnapshotStore>,
    pub ingestor: Arc<Ingestor>,
    pub registry: Arc<SourceRegistry>,
    pub webhook_secret: Option<String>,
    pub webhook_max_bytes: usize,
}

impl AppState {
    pub fn new(ingestor: Arc<Ingestor>, registry: SourceRegistry) -> Self {
        Self {
            store: ingestor.store().clone(),
            ingestor,
            registry: Arc::new(registry),
            webhook_secret: None,
            webhook_max_bytes: DEFAULT_WEBHOOK_MAX_BYTES,
        }
    }

    pub fn with_webhook_secret(mut self, secret: Option<String>) -> Self {
        self.webhook_secret = secret;
        self
    }

    pub fn with_webhook_max_bytes(mut self, max_bytes: usize) -> Self {
        self.webhook_max_bytes = max_bytes;
        self
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/sources", get(sources_handler))
        .route("/api/leaderboards", get(merged_leaderboards_handler))
        .route("/api/leaderboards/{source}", get(source_leaderboard_handler))
        .route("/api/search", get(search_handler))
        .route(
            "/api/webhook/ingest",
            post(webhook_ingest_handler).layer(DefaultBodyLimit::max(state.webhook_max_bytes)),
        )
        .with_state(Arc::new(state))
}

/// Serve the API; the sync scheduler runs alongside when enabled.
pub async fn serve(web: WebConfig, sync: SyncConfig) -> anyhow::Result<()> {
    let pipeline = Arc::new(SyncPipeline::from_config(sync).await?);
    let scheduler = pipeline.start_scheduler().await?;

    let state = AppState::new(pipeline.ingestor(), pipeline.registry().clone())
        .with_webhook_secret(web.webhook_secret)
        .with_webhook_max_bytes(web.webhook_max_bytes);
    if state.webhook_secret.is_none() {
        warn!("INGEST_WEBHOOK_SECRET not set; webhook ingestion is disabled");
    }

    let listener = TcpListener::bind(("0.0.0.0", web.port))
        .await
        .with_context(|| format!("binding port {}", web.port))?;
    info!(port = web.port, "mshub api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(mut sched) = scheduler {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn parse_period(raw: Option<&str>) -> Result<Period, Response> {
    match raw {
        None => Ok(DEFAULT_PERIOD),
        Some(raw) => raw
            .parse::<Period>()
            .map_err(|err| json_error(StatusCode::BAD_REQUEST, err.to_string())),
    }
}

async fn healthz_handler() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct PeriodStatus {
    period: Period,
    available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_updated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    snapshot_id: Option<Uuid>,
    row_count: usize,
}

#[derive(Debug, Serialize)]
struct SourceStatus {
    source_id: String,
    display_name: String,
    enabled: bool,
    adapter: String,
    periods: Vec<PeriodStatus>,
}

async fn sources_handler(State(state): State<Arc<AppState>>) -> Response {
    let pointers = match state.store.pointers().await {
        Ok(pointers) => pointers,
        Err(err) => return json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };
    let mut by_key = pointers
        .into_iter()
        .map(|p| ((p.source.clone(), p.period.clone()), p))
        .collect::<BTreeMap<_, _>>();

    let mut sources = Vec::with_capacity(state.registry.sources.len());
    for source in &state.registry.sources {
        let mut periods = match source.adapter() {
            Ok(adapter) => source.periods_for(adapter.as_ref()),
            Err(_) => source.periods.clone(),
        }
        .into_iter()
        .collect::<BTreeSet<_>>();
        periods.extend(
            by_key
                .keys()
                .filter(|(id, _)| id == &source.source_id)
                .map(|(_, period)| period.clone()),
        );

        let periods = periods
            .into_iter()
            .map(|period| {
                let pointer = by_key.remove(&(source.source_id.clone(), period.clone()));
                PeriodStatus {
                    available: pointer.is_some(),
                    last_updated: pointer.as_ref().map(|p| p.fetched_at),
                    snapshot_id: pointer.as_ref().map(|p| p.snapshot_id),
                    row_count: pointer.as_ref().map_or(0, |p| p.row_count),
                    period,
                }
            })
            .collect();

        sources.push(SourceStatus {
            source_id: source.source_id.clone(),
            display_name: source.display_name.clone(),
            enabled: source.enabled,
            adapter: source.adapter_kind().to_string(),
            periods,
        });
    }
    Json(json!({ "sources": sources })).into_response()
}

/// `?period=7d&sources=a,b&a=30d`: a default period, an optional source
/// subset, and per-source period overrides keyed by source id.
async fn merged_leaderboards_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let default_period = match parse_period(params.get("period").map(String::as_str)) {
        Ok(period) => period,
        Err(resp) => return resp,
    };

    let selected: Vec<String> = match params.get("sources") {
        Some(list) => list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect(),
        None => state.registry.enabled().map(|s| s.source_id.clone()).collect(),
    };

    let mut requests = Vec::with_capacity(selected.len());
    for source in selected {
        let period = match params.get(&source) {
            Some(raw) => match parse_period(Some(raw)) {
                Ok(period) => period,
                Err(resp) => return resp,
            },
            None => default_period.clone(),
        };
        requests.push((source, period));
    }

    let view = merged_read(state.store.as_ref(), &requests).await;
    Json(view).into_response()
}

#[derive(Debug, Deserialize, Default)]
struct PeriodQuery {
    period: Option<String>,
}

async fn source_leaderboard_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(source): AxumPath<String>,
    Query(query): Query<PeriodQuery>,
) -> Response {
    if state.registry.find(&source).is_none() {
        return json_error(StatusCode::NOT_FOUND, format!("unknown source {source}"));
    }
    let period = match parse_period(query.period.as_deref()) {
        Ok(period) => period,
        Err(resp) => return resp,
    };

    match read_source(state.store.as_ref(), &source, &period).await {
        Ok(Some(view)) => Json(view).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "no cached data yet"),
        Err(err) => json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

#[derive(Debug, Deserialize, Default)]
struct SearchQuery {
    q: Option<String>,
    period: Option<String>,
    limit: Option<usize>,
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Response {
    let Some(q) = query.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) else {
        return json_error(StatusCode::BAD_REQUEST, "missing query parameter q");
    };
    let period = match parse_period(query.period.as_deref()) {
        Ok(period) => period,
        Err(resp) => return resp,
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_SEARCH_LIMIT)
        .clamp(1, MAX_SEARCH_LIMIT);

    match search(state.store.as_ref(), q, &period, limit).await {
        Ok(hits) => Json(json!({
            "query": q,
            "period": period,
            "count": hits.len(),
            "results": hits,
        }))
        .into_response(),
        Err(err) => json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

fn secrets_match(expected: &str, presented: &str) -> bool {
    let (a, b) = (expected.as_bytes(), presented.as_bytes());
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

async fn webhook_ingest_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(secret) = state.webhook_secret.as_deref() else {
        return json_error(StatusCode::SERVICE_UNAVAILABLE, "webhook ingestion is not configured");
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    if !presented.is_some_and(|token| secrets_match(secret, token)) {
        return json_error(StatusCode::UNAUTHORIZED, "invalid or missing bearer token");
    }

    let batch: ScrapeBatch = match serde_json::from_slice(&body) {
        Ok(batch) => batch,
        Err(err) => return json_error(StatusCode::BAD_REQUEST, format!("invalid batch: {err}")),
    };

    let results = state.ingestor.ingest_batch(&state.registry, &batch).await;
    let published = results.iter().filter(|r| r.status == "published").count();
    info!(entries = results.len(), published, "webhook batch ingested");
    Json(json!({ "published": published, "results": results })).into_response()
}

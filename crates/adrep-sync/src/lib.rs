//! Pipeline coordination: cache-gated phrase refresh and chunked report
//! pulls, with run summaries for completeness auditing.

use std::time::Duration;

use adrep_cache::PhraseCache;
use adrep_core::{
    plan_batches, DateRange, ReportKind, ReportRequest, ReportRow, CAMPAIGN_BATCH_LIMIT,
};
use adrep_protocol::{
    fetch_entities, ApiConfig, BulkFetchOutcome, BulkTransport, EntityKind, HttpTransport,
    ReportError, ReportProtocolClient, ReportTransport, VolumeSource,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "adrep-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub endpoint: String,
    pub token: String,
    pub client_login: Option<String>,
    pub http_timeout_secs: u64,
    pub wait_budget_secs: u64,
    pub cache_path: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            endpoint: std::env::var("ADREP_API_ENDPOINT")
                .unwrap_or_else(|_| "https://api.direct.example.com/json/v5".to_string()),
            token: std::env::var("ADREP_API_TOKEN").unwrap_or_default(),
            client_login: std::env::var("ADREP_CLIENT_LOGIN").ok(),
            http_timeout_secs: std::env::var("ADREP_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            wait_budget_secs: std::env::var("ADREP_WAIT_BUDGET_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30 * 60),
            cache_path: std::env::var("ADREP_CACHE_PATH")
                .unwrap_or_else(|_| "./phrases.db".to_string()),
        }
    }

    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            endpoint: self.endpoint.clone(),
            token: self.token.clone(),
            client_login: self.client_login.clone(),
            http_timeout: Duration::from_secs(self.http_timeout_secs),
            wait_budget: Duration::from_secs(self.wait_budget_secs),
            ..ApiConfig::default()
        }
    }
}

/// Builds the production protocol client for one account configuration.
pub fn protocol_client(config: &SyncConfig) -> Result<ReportProtocolClient<HttpTransport>> {
    let api = config.api_config();
    let default_retry = api.default_retry;
    let wait_budget = api.wait_budget;
    let transport = HttpTransport::new(api).context("building report transport")?;
    Ok(ReportProtocolClient::new(transport, default_retry, wait_budget))
}

pub fn open_cache(config: &SyncConfig) -> Result<PhraseCache> {
    PhraseCache::open(&config.cache_path)
        .with_context(|| format!("opening phrase cache at {}", config.cache_path))
}

/// Seam over the protocol client so the pipeline is testable without the
/// network.
#[async_trait]
pub trait ReportRunner: Send + Sync {
    async fn run(&self, request: &ReportRequest) -> Result<Vec<ReportRow>, ReportError>;
}

#[async_trait]
impl<T: ReportTransport> ReportRunner for ReportProtocolClient<T> {
    async fn run(&self, request: &ReportRequest) -> Result<Vec<ReportRow>, ReportError> {
        self.run_report(request).await
    }
}

/// Outcome of one chunked report pull. The aggregate omits failed chunks by
/// design; `failed_chunks` exists so that under-reporting is auditable.
#[derive(Debug, Clone, Serialize)]
pub struct ReportRunSummary {
    pub kind: ReportKind,
    pub rows: Vec<ReportRow>,
    pub planned_chunks: usize,
    pub failed_chunks: usize,
}

/// Pulls one report kind for a set of entity IDs, chunked to the service's
/// per-call limit. Chunk outputs are concatenated in input order; a failing
/// chunk is logged and dropped, never fatal.
pub async fn pull_report<R: ReportRunner>(
    runner: &R,
    kind: ReportKind,
    entity_ids: &[u64],
    date_range: DateRange,
    excluded_group_ids: &[u64],
) -> ReportRunSummary {
    let chunks = plan_batches(entity_ids, CAMPAIGN_BATCH_LIMIT);
    let planned_chunks = chunks.len();
    let mut rows = Vec::new();
    let mut failed_chunks = 0usize;

    for (index, chunk) in chunks.into_iter().enumerate() {
        // The service requires report names to be unique per account.
        let report_name = format!(
            "{:?} {} chunk {}",
            kind,
            Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            index + 1
        );
        let request = ReportRequest::from_preset(kind, report_name, chunk.clone(), date_range)
            .with_excluded_groups(excluded_group_ids.to_vec());

        match runner.run(&request).await {
            Ok(chunk_rows) => {
                info!(
                    kind = ?kind,
                    chunk = index + 1,
                    rows = chunk_rows.len(),
                    "report chunk completed"
                );
                rows.extend(chunk_rows);
            }
            Err(err) => {
                warn!(
                    kind = ?kind,
                    chunk = index + 1,
                    entity_ids = ?chunk,
                    error = %err,
                    "report chunk failed, aggregate will omit its entities"
                );
                failed_chunks += 1;
            }
        }
    }

    ReportRunSummary {
        kind,
        rows,
        planned_chunks,
        failed_chunks,
    }
}

/// Pulls campaign-scoped entities through the batched bulk lookup, logging
/// a completeness summary. Same skip-on-failure policy as report chunks.
pub async fn pull_entities<T: BulkTransport>(
    transport: &T,
    kind: EntityKind,
    ids: &[u64],
) -> BulkFetchOutcome {
    let outcome = fetch_entities(transport, kind, ids).await;
    info!(
        kind = ?kind,
        entities = outcome.entities.len(),
        failed_batches = outcome.failed_batches,
        "bulk entity pull completed"
    );
    outcome
}

/// Outcome of one cache-gated phrase refresh pass.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct PhraseRunSummary {
    pub checked: usize,
    pub fresh_skipped: usize,
    pub fetched: usize,
    pub failed: usize,
}

/// Refreshes search volumes for a set of phrases. Phrases with a fresh
/// cache record never reach the volume service; the rest are fetched and
/// reconciled. Lookup and storage failures are logged and counted, not
/// propagated: staleness is safer than a stopped run.
pub async fn refresh_phrases<S: VolumeSource>(
    cache: &PhraseCache,
    source: &S,
    phrases: &[String],
) -> PhraseRunSummary {
    let mut summary = PhraseRunSummary {
        checked: phrases.len(),
        ..Default::default()
    };

    for phrase in phrases {
        if cache.is_fresh(phrase) {
            info!(phrase = %phrase, "phrase still fresh, skipping volume lookup");
            summary.fresh_skipped += 1;
            continue;
        }

        let volume = match source.top_requests(phrase).await {
            Ok(volume) => volume,
            Err(err) => {
                warn!(phrase = %phrase, error = %err, "volume lookup failed, phrase left stale");
                summary.failed += 1;
                continue;
            }
        };

        let related: Vec<(String, i64)> = volume
            .related
            .iter()
            .map(|r| (r.phrase.clone(), r.count))
            .collect();

        match cache.reconcile(&volume.phrase, volume.total_count, &related) {
            Ok(_) => summary.fetched += 1,
            Err(err) => {
                warn!(phrase = %phrase, error = %err, "phrase reconcile failed, batch rolled back");
                summary.failed += 1;
            }
        }
    }

    summary
}

/// Serializes reshaped rows the way downstream consumers expect them.
pub fn rows_to_json(rows: &[ReportRow]) -> serde_json::Value {
    json!({
        "result": { "rows": rows },
        "_meta": { "total_rows": rows.len() },
    })
}

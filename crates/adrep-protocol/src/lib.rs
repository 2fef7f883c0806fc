//! Client-side protocol for the remote reporting service: response
//! classification, the request/poll/backoff state machine, synchronous bulk
//! entity lookups, and the phrase-volume call.

use std::time::Duration;

use adrep_core::{plan_batches, reshape, ReportRequest, ReportRow, CAMPAIGN_BATCH_LIMIT};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "adrep-protocol";

/// Server-advised retry interval to assume when the header is absent.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Immutable client configuration, passed to each call site instead of a
/// shared mutable connection object.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub endpoint: String,
    pub token: String,
    pub client_login: Option<String>,
    pub accept_language: String,
    pub http_timeout: Duration,
    pub default_retry: Duration,
    /// Total time the poll loop may spend waiting on Queued/Processing
    /// before giving up with `ReportError::WaitBudgetExceeded`.
    pub wait_budget: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.direct.example.com/json/v5".to_string(),
            token: String::new(),
            client_login: None,
            accept_language: "ru".to_string(),
            http_timeout: Duration::from_secs(60),
            default_retry: DEFAULT_RETRY_INTERVAL,
            wait_budget: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("connection to reporting service failed: {message}")]
    Transport { message: String },
    #[error("report request rejected (request_id {request_id:?}): {message}")]
    BadRequest {
        request_id: Option<String>,
        message: String,
    },
    #[error("report generation failed on the server (request_id {request_id:?}): {message}")]
    ServerError {
        request_id: Option<String>,
        message: String,
    },
    #[error(
        "report exceeded the server time budget (request_id {request_id:?}); \
         shrink the date range or entity count and resubmit"
    )]
    ScopeExceeded { request_id: Option<String> },
    #[error("unexpected status {status} from reporting service (request_id {request_id:?})")]
    Unexpected {
        status: u16,
        request_id: Option<String>,
    },
    #[error("gave up waiting for offline report after {waited:?}")]
    WaitBudgetExceeded { waited: Duration },
}

impl ReportError {
    /// Whether resubmitting the same operation unchanged can succeed.
    /// Bad requests need different parameters, scope errors a smaller
    /// request; only transient classes are worth retrying as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReportError::Transport { .. }
                | ReportError::ServerError { .. }
                | ReportError::WaitBudgetExceeded { .. }
        )
    }
}

/// One raw reply from the reporting endpoint, reduced to what the state
/// machine observes.
#[derive(Debug, Clone)]
pub struct RawReportResponse {
    pub status: u16,
    pub retry_in: Option<u64>,
    pub request_id: Option<String>,
    pub body: String,
}

/// Closed classification of a report submission reply. Produced by
/// `classify_response` and consumed exhaustively by the poll loop.
#[derive(Debug)]
pub enum ReportSignal {
    /// Finished report payload arrived inline.
    Ready { payload: String },
    /// Job accepted into the offline queue; re-submit after the interval.
    Queued { retry_in: Duration },
    /// Job already building offline; same handling as Queued, kept distinct
    /// for observability.
    Processing { retry_in: Duration },
    /// Terminal failure; the loop stops and surfaces the error.
    Rejected(ReportError),
}

pub fn classify_response(resp: &RawReportResponse, default_retry: Duration) -> ReportSignal {
    let retry_in = resp
        .retry_in
        .map(Duration::from_secs)
        .unwrap_or(default_retry);

    match resp.status {
        200 => ReportSignal::Ready {
            payload: resp.body.clone(),
        },
        201 => ReportSignal::Queued { retry_in },
        202 => ReportSignal::Processing { retry_in },
        400 => ReportSignal::Rejected(ReportError::BadRequest {
            request_id: resp.request_id.clone(),
            message: resp.body.clone(),
        }),
        500 => ReportSignal::Rejected(ReportError::ServerError {
            request_id: resp.request_id.clone(),
            message: resp.body.clone(),
        }),
        502 => ReportSignal::Rejected(ReportError::ScopeExceeded {
            request_id: resp.request_id.clone(),
        }),
        status => ReportSignal::Rejected(ReportError::Unexpected {
            status,
            request_id: resp.request_id.clone(),
        }),
    }
}

/// Builds the submission body for one report job. The same body is re-sent
/// verbatim on every poll.
pub fn report_body(request: &ReportRequest) -> JsonValue {
    let mut filters = vec![json!({
        "Field": request.filter.field,
        "Operator": request.filter.operator.as_str(),
        "Values": request.filter.ids,
    })];
    if let Some(exclusion) = &request.exclusion {
        filters.push(json!({
            "Field": exclusion.field,
            "Operator": exclusion.operator.as_str(),
            "Values": exclusion.ids,
        }));
    }

    json!({
        "params": {
            "SelectionCriteria": {
                "Filter": filters,
                "DateFrom": request.date_range.from.format("%Y-%m-%d").to_string(),
                "DateTo": request.date_range.to.format("%Y-%m-%d").to_string(),
            },
            "FieldNames": request.field_names(),
            "ReportName": request.report_name,
            "ReportType": request.report_type,
            "DateRangeType": "CUSTOM_DATE",
            "Format": request.format.as_str(),
            "IncludeVAT": "YES",
            "IncludeDiscount": "NO",
        }
    })
}

/// Transport seam for report submission; production uses HTTP, tests use a
/// scripted sequence of replies.
#[async_trait]
pub trait ReportTransport: Send + Sync {
    async fn submit(&self, body: &JsonValue) -> Result<RawReportResponse, ReportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobPhase {
    Requesting,
    QueuedOffline,
    ProcessingOffline,
}

/// Transient poll-sequence state, owned by one `run_report` call and
/// destroyed when it reaches a terminal outcome.
#[derive(Debug)]
struct ReportJobState {
    phase: JobPhase,
    waited: Duration,
    request_id: Option<String>,
}

/// Drives one report job to a terminal outcome: submit, classify, sleep on
/// Queued/Processing for the server-advised interval, re-submit. No payload
/// state survives between polls beyond the immutable request.
pub struct ReportProtocolClient<T> {
    transport: T,
    default_retry: Duration,
    wait_budget: Duration,
}

impl<T: ReportTransport> ReportProtocolClient<T> {
    pub fn new(transport: T, default_retry: Duration, wait_budget: Duration) -> Self {
        Self {
            transport,
            default_retry,
            wait_budget,
        }
    }

    pub async fn run_report(&self, request: &ReportRequest) -> Result<Vec<ReportRow>, ReportError> {
        let body = report_body(request);
        let mut state = ReportJobState {
            phase: JobPhase::Requesting,
            waited: Duration::ZERO,
            request_id: None,
        };

        loop {
            let resp = self.transport.submit(&body).await?;
            if resp.request_id.is_some() {
                state.request_id = resp.request_id.clone();
            }

            let retry_in = match classify_response(&resp, self.default_retry) {
                ReportSignal::Ready { payload } => {
                    info!(
                        report_name = %request.report_name,
                        request_id = ?state.request_id,
                        waited_secs = state.waited.as_secs(),
                        "report ready"
                    );
                    return Ok(reshape(&payload, &request.fields));
                }
                ReportSignal::Rejected(err) => {
                    warn!(
                        report_name = %request.report_name,
                        request_id = ?state.request_id,
                        error = %err,
                        "report job terminated"
                    );
                    return Err(err);
                }
                ReportSignal::Queued { retry_in } => {
                    state.phase = JobPhase::QueuedOffline;
                    info!(
                        report_name = %request.report_name,
                        request_id = ?state.request_id,
                        retry_in_secs = retry_in.as_secs(),
                        "report queued offline"
                    );
                    retry_in
                }
                ReportSignal::Processing { retry_in } => {
                    state.phase = JobPhase::ProcessingOffline;
                    info!(
                        report_name = %request.report_name,
                        request_id = ?state.request_id,
                        retry_in_secs = retry_in.as_secs(),
                        "report building offline"
                    );
                    retry_in
                }
            };

            if state.waited + retry_in > self.wait_budget {
                warn!(
                    report_name = %request.report_name,
                    request_id = ?state.request_id,
                    phase = ?state.phase,
                    waited_secs = state.waited.as_secs(),
                    "wait budget exhausted, giving up on offline report"
                );
                return Err(ReportError::WaitBudgetExceeded {
                    waited: state.waited,
                });
            }

            tokio::time::sleep(retry_in).await;
            state.waited += retry_in;
        }
    }
}

/// Transport seam for the synchronous `get`-style calls (no polling).
#[async_trait]
pub trait BulkTransport: Send + Sync {
    async fn get(&self, method: &str, body: &JsonValue) -> Result<JsonValue, ReportError>;
}

/// Entity families exposed through bulk lookup, each with its own selection
/// key and result key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Campaigns,
    AdGroups,
    Ads,
}

impl EntityKind {
    pub fn method(&self) -> &'static str {
        match self {
            EntityKind::Campaigns => "campaigns",
            EntityKind::AdGroups => "adgroups",
            EntityKind::Ads => "ads",
        }
    }

    fn selection_key(&self) -> &'static str {
        match self {
            EntityKind::Campaigns => "Ids",
            EntityKind::AdGroups | EntityKind::Ads => "CampaignIds",
        }
    }

    fn result_key(&self) -> &'static str {
        match self {
            EntityKind::Campaigns => "Campaigns",
            EntityKind::AdGroups => "AdGroups",
            EntityKind::Ads => "Ads",
        }
    }

    fn field_names(&self) -> Vec<&'static str> {
        match self {
            EntityKind::Campaigns => vec![
                "Id",
                "Name",
                "Type",
                "Status",
                "State",
                "Currency",
                "DailyBudget",
                "StartDate",
                "EndDate",
                "NegativeKeywords",
            ],
            EntityKind::AdGroups => vec![
                "Id",
                "Name",
                "CampaignId",
                "Type",
                "Status",
                "NegativeKeywords",
                "TrackingParams",
            ],
            EntityKind::Ads => vec!["Id", "Type", "AdGroupId", "CampaignId", "State", "Status"],
        }
    }
}

/// Aggregate outcome of a batched bulk lookup. Failed batches are skipped,
/// never fatal; `failed_batches` lets callers audit completeness.
#[derive(Debug, Default)]
pub struct BulkFetchOutcome {
    pub entities: Vec<JsonValue>,
    pub failed_batches: usize,
}

/// Fetches entities by ID in order-preserving chunks of at most
/// `CAMPAIGN_BATCH_LIMIT`. A batch that errors, or whose reply carries an
/// embedded `error` object, is logged and dropped from the aggregate.
pub async fn fetch_entities<T: BulkTransport>(
    transport: &T,
    kind: EntityKind,
    ids: &[u64],
) -> BulkFetchOutcome {
    let mut outcome = BulkFetchOutcome::default();

    for batch in plan_batches(ids, CAMPAIGN_BATCH_LIMIT) {
        let body = json!({
            "method": "get",
            "params": {
                "SelectionCriteria": { (kind.selection_key()): batch },
                "FieldNames": kind.field_names(),
            }
        });

        let reply = match transport.get(kind.method(), &body).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(
                    method = kind.method(),
                    batch = ?batch,
                    error = %err,
                    "bulk lookup batch failed, skipping"
                );
                outcome.failed_batches += 1;
                continue;
            }
        };

        if let Some(api_error) = reply.get("error") {
            warn!(
                method = kind.method(),
                batch = ?batch,
                error = %api_error,
                "bulk lookup batch rejected by service, skipping"
            );
            outcome.failed_batches += 1;
            continue;
        }

        match reply
            .get("result")
            .and_then(|r| r.get(kind.result_key()))
            .and_then(JsonValue::as_array)
        {
            Some(entities) => outcome.entities.extend(entities.iter().cloned()),
            None => {
                warn!(
                    method = kind.method(),
                    batch = ?batch,
                    "bulk lookup batch returned no entities, skipping"
                );
                outcome.failed_batches += 1;
            }
        }
    }

    outcome
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedPhrase {
    pub phrase: String,
    pub count: i64,
}

/// Search-volume result for one phrase: its own total plus the top related
/// phrases the service reports alongside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhraseVolume {
    pub phrase: String,
    pub total_count: i64,
    pub related: Vec<RelatedPhrase>,
}

/// Seam for the keyword-volume call feeding the phrase cache.
#[async_trait]
pub trait VolumeSource: Send + Sync {
    async fn top_requests(&self, phrase: &str) -> Result<PhraseVolume, ReportError>;
}

/// HTTP transport over the reporting service family. One immutable value
/// per account; construction never mutates shared state.
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    config: ApiConfig,
}

impl HttpTransport {
    pub fn new(config: ApiConfig) -> Result<Self, ReportError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.http_timeout)
            .build()
            .map_err(|err| ReportError::Transport {
                message: err.to_string(),
            })?;
        Ok(Self { client, config })
    }

    fn request(&self, path: &str, body: &JsonValue) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(format!("{}/{path}", self.config.endpoint))
            .bearer_auth(&self.config.token)
            .header("Accept-Language", &self.config.accept_language)
            .json(body);
        if let Some(login) = &self.config.client_login {
            builder = builder.header("Client-Login", login);
        }
        builder
    }
}

#[async_trait]
impl ReportTransport for HttpTransport {
    async fn submit(&self, body: &JsonValue) -> Result<RawReportResponse, ReportError> {
        let response = self
            .request("reports", body)
            .header("processingMode", "auto")
            .header("returnMoneyInMicros", "false")
            .send()
            .await
            .map_err(|err| ReportError::Transport {
                message: err.to_string(),
            })?;

        let status = response.status().as_u16();
        let retry_in = response
            .headers()
            .get("retryIn")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let request_id = response
            .headers()
            .get("RequestId")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .text()
            .await
            .map_err(|err| ReportError::Transport {
                message: err.to_string(),
            })?;

        Ok(RawReportResponse {
            status,
            retry_in,
            request_id,
            body,
        })
    }
}

#[async_trait]
impl BulkTransport for HttpTransport {
    async fn get(&self, method: &str, body: &JsonValue) -> Result<JsonValue, ReportError> {
        let response = self
            .request(method, body)
            .send()
            .await
            .map_err(|err| ReportError::Transport {
                message: err.to_string(),
            })?;

        let status = response.status().as_u16();
        if status != 200 {
            return Err(ReportError::Unexpected {
                status,
                request_id: None,
            });
        }

        response
            .json::<JsonValue>()
            .await
            .map_err(|err| ReportError::Transport {
                message: err.to_string(),
            })
    }
}

#[derive(Debug, Deserialize)]
struct TopRequestsReply {
    #[serde(rename = "requestPhrase")]
    request_phrase: Option<String>,
    #[serde(rename = "totalCount", default)]
    total_count: i64,
    #[serde(rename = "topRequests", default)]
    top_requests: Vec<TopRequestEntry>,
}

#[derive(Debug, Deserialize)]
struct TopRequestEntry {
    phrase: String,
    count: i64,
}

#[async_trait]
impl VolumeSource for HttpTransport {
    async fn top_requests(&self, phrase: &str) -> Result<PhraseVolume, ReportError> {
        let body = json!({ "phrase": phrase });
        let reply = BulkTransport::get(self, "wordstat", &body).await?;
        let parsed: TopRequestsReply =
            serde_json::from_value(reply).map_err(|err| ReportError::Transport {
                message: format!("malformed volume reply: {err}"),
            })?;

        Ok(PhraseVolume {
            phrase: parsed.request_phrase.unwrap_or_else(|| phrase.to_string()),
            total_count: parsed.total_count,
            related: parsed
                .top_requests
                .into_iter()
                .map(|entry| RelatedPhrase {
                    phrase: entry.phrase,
                    count: entry.count,
                })
                .collect(),
        })
    }
}

//! Paginated, retrying query fetches.
//!
//! The remote protocol has no cursors: the caller asks for page 1, 2, 3, ...
//! of a fixed page size and the server reports the total number of records on
//! every page. The engine walks pages until the accumulated count reaches that
//! total, checking that the total never changes mid-read.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use crate::callsite;
use crate::contract::{QueryBody, RawResponse, RemoteSite};
use crate::dedup_log::{DedupLogger, LogEvent, LogLevel};
use crate::error::{Result, SyncError};
use crate::session::{SessionManager, TenantKey};
use crate::templates::QueryTemplates;

pub const MAX_PAGE_SIZE: u32 = 500;

/// Field added to every fetched record: seconds since the epoch when its page arrived.
pub const RESPONSE_TIMESTAMP_FIELD: &str = "__response_timestamp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultShape {
    #[default]
    List,
    Single,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    operation: String,
    page_size: u32,
    substitutions: Vec<(String, String)>,
    shape: ResultShape,
}

impl FetchRequest {
    pub fn new(operation: impl Into<String>, page_size: u32) -> Result<Self> {
        if !(1..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(SyncError::InvalidPageSize(page_size));
        }
        Ok(Self {
            operation: operation.into(),
            page_size,
            substitutions: Vec::new(),
            shape: ResultShape::List,
        })
    }

    pub fn with_substitution(mut self, tag: impl Into<String>, value: impl Into<String>) -> Self {
        self.substitutions.push((tag.into(), value.into()));
        self
    }

    pub fn single(mut self) -> Self {
        self.shape = ResultShape::Single;
        self
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn substitutions(&self) -> &[(String, String)] {
        &self.substitutions
    }

    pub fn shape(&self) -> ResultShape {
        self.shape
    }
}

/// Retry budget for one fetch. The attempt counter is shared by every page.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_timeout: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_timeout: Duration::from_secs(5),
            multiplier: 3.0,
        }
    }
}

impl RetryPolicy {
    /// Sleep before the `retry`-th consecutive retry of one page (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.saturating_sub(1) as i32);
        scale(self.initial_timeout, factor)
    }
}

/// `d * factor`, saturating at `Duration::MAX` instead of panicking.
fn scale(d: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(d.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationInfo {
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageResult {
    pub page: u32,
    pub records: Vec<Value>,
    pub pagination: Option<PaginationInfo>,
}

/// Result of a successful fetch. An empty `Records` is a valid outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutput {
    Records(Vec<Value>),
    Single(Value),
}

impl FetchOutput {
    pub fn len(&self) -> usize {
        match self {
            FetchOutput::Records(records) => records.len(),
            FetchOutput::Single(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_value(self) -> Value {
        match self {
            FetchOutput::Records(records) => Value::Array(records),
            FetchOutput::Single(value) => value,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub processed: u64,
    pub successful: u64,
    pub total: u64,
    pub ratio: f64,
    pub message: String,
}

impl Progress {
    fn new(fetched: u64, total: u64, message: String) -> Self {
        let ratio = if total == 0 {
            1.0
        } else {
            (fetched as f64 / total as f64).min(1.0)
        };
        Self {
            processed: fetched,
            successful: fetched,
            total,
            ratio,
            message,
        }
    }
}

pub type ProgressFn<'a> = &'a mut (dyn FnMut(Progress) + Send);

enum PageReply {
    Page(PageResult),
    Single(Value),
}

pub struct PaginatedFetchEngine {
    sessions: Arc<SessionManager>,
    remote: Arc<dyn RemoteSite>,
    templates: Arc<QueryTemplates>,
    logger: Arc<DedupLogger>,
    policy: RetryPolicy,
    log_pages: bool,
}

impl PaginatedFetchEngine {
    pub fn new(
        sessions: Arc<SessionManager>,
        remote: Arc<dyn RemoteSite>,
        templates: Arc<QueryTemplates>,
        logger: Arc<DedupLogger>,
    ) -> Self {
        Self {
            sessions,
            remote,
            templates,
            logger,
            policy: RetryPolicy::default(),
            log_pages: false,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Record every fetched page in the durable log, not only failures.
    pub fn with_page_logging(mut self, enabled: bool) -> Self {
        self.log_pages = enabled;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn fetch(
        &self,
        tenant: &TenantKey,
        request: &FetchRequest,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<FetchOutput> {
        self.fetch_with_policy(tenant, request, self.policy, progress).await
    }

    pub async fn fetch_with_policy(
        &self,
        tenant: &TenantKey,
        request: &FetchRequest,
        policy: RetryPolicy,
        mut progress: Option<ProgressFn<'_>>,
    ) -> Result<FetchOutput> {
        let op = request.operation();
        let rendered = self
            .templates
            .render(op, request.page_size(), request.substitutions())?;

        let session = self
            .sessions
            .session(tenant)
            .filter(|s| s.last_login_at().is_some())
            .ok_or_else(|| SyncError::NotAuthenticated {
                tenant: tenant.to_string(),
            })?;

        let mut report = |p: Progress| {
            if let Some(cb) = progress.as_mut() {
                cb(p);
            }
        };
        report(Progress {
            ratio: 0.0,
            ..Progress::new(0, 0, format!("Fetching {op} for {tenant}"))
        });

        let mut records: Vec<Value> = Vec::new();
        let mut total: Option<u64> = None;
        let mut page: u32 = 1;
        let mut attempt: u32 = 1;
        let mut timeout = policy.initial_timeout;

        loop {
            session.wait_ready().await;

            let body = QueryBody {
                operation_name: op.to_string(),
                query: rendered.for_page(page),
                variables: Value::Object(Default::default()),
            };
            tracing::debug!(tenant = %tenant, operation = op, page, attempt, "Requesting page");

            let outcome = match self.remote.post_query(&session, &body).await {
                Ok(raw) if raw.is_success() && !raw.body.trim().is_empty() => {
                    match parse_reply(op, page, request.shape(), &raw.body) {
                        Ok(reply) => Ok((reply, raw)),
                        Err(reason) => {
                            let err = SyncError::ProtocolMalformed {
                                operation: op.to_string(),
                                page,
                                reason,
                            };
                            self.report_malformed(&err, &raw).await;
                            return Err(err);
                        }
                    }
                }
                Ok(raw) if raw.is_success() => Err(SyncError::transport(Some(raw.status), "empty response body")),
                Ok(raw) => Err(SyncError::transport(
                    Some(raw.status),
                    format!("query {op} page {page} rejected"),
                )),
                Err(e) => Err(e),
            };

            let (reply, raw) = match outcome {
                Ok(ok) => ok,
                Err(e) if e.is_transient() => {
                    if attempt < policy.attempts {
                        self.logger
                            .log(
                                LogEvent::new(
                                    LogLevel::Warning,
                                    callsite!(),
                                    format!(
                                        "Retrying {op} page {page} in {:.1}s (attempt {attempt} of {})",
                                        timeout.as_secs_f64(),
                                        policy.attempts
                                    ),
                                )
                                .with_error(&e),
                            )
                            .await;
                        tokio::time::sleep(timeout).await;
                        timeout = scale(timeout, policy.multiplier);
                        attempt += 1;
                        continue;
                    }
                    let err = SyncError::RetriesExhausted {
                        operation: op.to_string(),
                        page,
                        attempts: attempt,
                        last: e.to_string(),
                    };
                    self.logger
                        .log(
                            LogEvent::new(LogLevel::Error, callsite!(), format!("FAILED fetching {op} for {tenant}"))
                                .with_error(&err),
                        )
                        .await;
                    return Err(err);
                }
                Err(e) => return Err(e),
            };

            timeout = policy.initial_timeout;

            let mut page_result = match reply {
                PageReply::Single(value) => {
                    report(Progress::new(1, 1, format!("Fetched {op}")));
                    return Ok(FetchOutput::Single(value));
                }
                PageReply::Page(p) => p,
            };

            if let Some(info) = page_result.pagination {
                match total {
                    None => total = Some(info.total),
                    Some(expected) if expected != info.total => {
                        let err = SyncError::PaginationConsistencyViolation {
                            operation: op.to_string(),
                            page,
                            expected,
                            actual: info.total,
                        };
                        self.logger
                            .log(
                                LogEvent::new(LogLevel::Error, callsite!(), format!("FAILED fetching {op} for {tenant}"))
                                    .with_error(&err),
                            )
                            .await;
                        return Err(err);
                    }
                    Some(_) => {}
                }
            } else if let Some(expected) = total {
                let err = SyncError::ProtocolMalformed {
                    operation: op.to_string(),
                    page,
                    reason: format!("page without paginator info after total of {expected} was reported"),
                };
                self.report_malformed(&err, &raw).await;
                return Err(err);
            }

            let received = page_result.records.len();
            let stamp = Utc::now().timestamp_micros() as f64 / 1_000_000.0;
            for record in page_result.records.iter_mut() {
                if let Value::Object(fields) = record {
                    fields.insert(RESPONSE_TIMESTAMP_FIELD.to_string(), Value::from(stamp));
                }
            }
            records.append(&mut page_result.records);

            let fetched = records.len() as u64;
            let Some(expected) = page_result.pagination.map(|info| info.total) else {
                tracing::debug!(operation = op, page, fetched, "Page without paginator info, treating as final");
                break;
            };

            report(Progress::new(
                fetched,
                expected,
                format!("Fetched page {page} of {op}: {fetched}/{expected}"),
            ));
            if self.log_pages {
                self.logger
                    .log(
                        LogEvent::new(LogLevel::Debug, callsite!(), format!("OK page {page} of {op}"))
                            .with_payload(serde_json::json!({
                                "tenant": tenant.to_string(),
                                "records": received,
                                "fetched": fetched,
                                "total": expected,
                                "status": raw.status,
                            })),
                    )
                    .await;
            }

            if fetched >= expected {
                break;
            }
            if received == 0 {
                let err = SyncError::ProtocolMalformed {
                    operation: op.to_string(),
                    page,
                    reason: format!("empty page with {fetched} of {expected} records fetched"),
                };
                self.report_malformed(&err, &raw).await;
                return Err(err);
            }
            page += 1;
        }

        let fetched = records.len() as u64;
        report(Progress::new(
            fetched,
            total.unwrap_or(fetched),
            format!("Fetched {fetched} records of {op}"),
        ));
        tracing::info!(tenant = %tenant, operation = op, records = fetched, pages = page, "Fetch complete");
        Ok(FetchOutput::Records(records))
    }

    async fn report_malformed(&self, err: &SyncError, raw: &RawResponse) {
        let mut event = LogEvent::new(LogLevel::Error, callsite!(), "FAILED to parse query response").with_error(err);
        if let Some(content) = raw.content_payload() {
            event = event.with_payload(content);
        }
        self.logger.log(event).await;
    }
}

fn parse_reply(op: &str, page: u32, shape: ResultShape, body: &str) -> std::result::Result<PageReply, String> {
    let root: Value = serde_json::from_str(body).map_err(|e| format!("invalid JSON: {e}"))?;
    let Some(data) = root.get("data").and_then(Value::as_object) else {
        return Err(match root.get("errors") {
            Some(errors) => format!("server reported errors: {errors}"),
            None => "missing data object".to_string(),
        });
    };

    let payload = match data.get(op) {
        Some(v) => v,
        None if data.len() == 1 => data.values().next().unwrap_or(&Value::Null),
        None => return Err(format!("operation {op} missing from data")),
    };

    match shape {
        ResultShape::Single => match payload {
            Value::Object(fields) if !fields.is_empty() => Ok(PageReply::Single(payload.clone())),
            other => Err(format!("expected an object, got {}", kind(other))),
        },
        ResultShape::List => {
            let records = payload
                .get("data")
                .and_then(Value::as_array)
                .ok_or_else(|| format!("expected a record list, got {}", kind(payload)))?
                .clone();
            let pagination = payload
                .get("paginatorInfo")
                .and_then(|info| info.get("total"))
                .and_then(Value::as_u64)
                .map(|total| PaginationInfo { total });
            Ok(PageReply::Page(PageResult {
                page,
                records,
                pagination,
            }))
        }
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(m) if m.is_empty() => "an empty object",
        Value::Object(_) => "an object without a record list",
    }
}

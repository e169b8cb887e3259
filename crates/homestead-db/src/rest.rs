//! Channel over the hosted tabular REST gateway (PostgREST dialect).
//!
//! Writes use the service-role key. Verification reads use the anon key when
//! one is configured, so the sample shows what the public site can see.

use std::collections::HashSet;

use async_trait::async_trait;
use homestead_common::config::RestTarget;
use homestead_common::error::{ReconcileError, ReconcileResult};
use homestead_common::models::{NaturalKey, NewProperty, Property};
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::{Map, Value};

use crate::channel::{Channel, ChannelKind, FailureKind, InsertOutcome, SkipReason, TableState};
use crate::schema::TableSchema;

const CONNECTION_HINT: &str = "Check that:\n\
  - rest.url points at the project (https://<project-ref>.supabase.co)\n\
  - rest.service_role_key is the service_role key, not the anon key\n\
  - this machine can reach the gateway over HTTPS";

/// PostgREST/Postgres codes meaning "relation does not exist".
const MISSING_TABLE_CODES: &[&str] = &["42P01", "PGRST205"];

/// Rows requested per page when reading existing keys. The gateway may cap
/// pages lower (`max-rows`); paging follows what it actually returns.
pub const KEY_PAGE_SIZE: i64 = 1000;

pub struct RestChannel {
    client: Client,
    rest_url: String,
    anon_key: Option<String>,
    endpoint: String,
}

impl RestChannel {
    /// Build the HTTP client. No request is sent until the first operation.
    pub fn connect(target: &RestTarget) -> ReconcileResult<Self> {
        let client = Client::builder()
            .default_headers(auth_headers(&target.service_role_key)?)
            .timeout(target.timeout)
            .user_agent(concat!("homestead/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ReconcileError::configuration(format!("HTTP client: {e}")))?;

        let endpoint = target.describe();
        tracing::info!(%endpoint, "Using the REST gateway");

        Ok(Self {
            client,
            rest_url: format!("{}/rest/v1", target.base_url.as_str().trim_end_matches('/')),
            anon_key: target.anon_key.clone(),
            endpoint,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{table}", self.rest_url)
    }

    /// Apply the low-privilege key to a read request when one is configured.
    fn read_as_anon(&self, request: RequestBuilder) -> ReconcileResult<RequestBuilder> {
        match &self.anon_key {
            Some(key) => Ok(request.headers(auth_headers(key)?)),
            None => Ok(request),
        }
    }

    async fn send(&self, request: RequestBuilder) -> ReconcileResult<Response> {
        request
            .send()
            .await
            .map_err(|e| transport_error(&self.endpoint, e))
    }

    /// Exact row count, or `None` when the table does not exist.
    async fn count(&self, table: &str) -> ReconcileResult<Option<i64>> {
        let request = self
            .client
            .get(self.table_url(table))
            .query(&[("select", "*"), ("limit", "0")])
            .header("Prefer", "count=exact");
        let resp = self.send(request).await?;
        let status = resp.status();
        let range = resp
            .headers()
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        if status.is_success() {
            return range
                .as_deref()
                .and_then(parse_content_range)
                .map(Some)
                .ok_or_else(|| {
                    ReconcileError::unexpected(
                        "counting rows",
                        format!("missing or malformed Content-Range header: {range:?}"),
                    )
                });
        }

        let body = body_text(resp).await;
        if status == StatusCode::NOT_FOUND || is_missing_table(&body) {
            return Ok(None);
        }
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(ReconcileError::Connection {
                endpoint: self.endpoint.clone(),
                message: format!("authentication rejected ({})", error_detail(status, &body)),
                hint: CONNECTION_HINT.to_string(),
            });
        }
        Err(ReconcileError::unexpected(
            "counting rows",
            error_detail(status, &body),
        ))
    }

    async fn fetch_rows(
        &self,
        request: RequestBuilder,
        context: &str,
    ) -> ReconcileResult<Vec<Map<String, Value>>> {
        self.fetch_page(request, context).await.map(|(rows, _)| rows)
    }

    /// Rows of one response plus the total from `Content-Range`, when given.
    async fn fetch_page(
        &self,
        request: RequestBuilder,
        context: &str,
    ) -> ReconcileResult<(Vec<Map<String, Value>>, Option<i64>)> {
        let resp = self.send(request).await?;
        let status = resp.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok((Vec::new(), None));
        }
        if !status.is_success() {
            let body = body_text(resp).await;
            return Err(ReconcileError::unexpected(context, error_detail(status, &body)));
        }
        let total = resp
            .headers()
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range);
        let rows = resp
            .json::<Vec<Map<String, Value>>>()
            .await
            .map_err(|e| ReconcileError::unexpected(context, e))?;
        Ok((rows, total))
    }
}

fn auth_headers(key: &str) -> ReconcileResult<HeaderMap> {
    let invalid = |e: header::InvalidHeaderValue| {
        ReconcileError::configuration(format!("API key is not a valid header value: {e}"))
    };
    let mut headers = HeaderMap::new();
    headers.insert("apikey", HeaderValue::from_str(key).map_err(invalid)?);
    headers.insert(
        header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {key}")).map_err(invalid)?,
    );
    Ok(headers)
}

/// Response body for error reporting; a failed read is reported in its place.
async fn body_text(resp: Response) -> String {
    match resp.text().await {
        Ok(body) => body,
        Err(e) => format!("<response body unreadable: {e}>"),
    }
}

fn transport_error(endpoint: &str, error: reqwest::Error) -> ReconcileError {
    if error.is_connect() || error.is_timeout() {
        ReconcileError::Connection {
            endpoint: endpoint.to_owned(),
            message: error.to_string(),
            hint: CONNECTION_HINT.to_string(),
        }
    } else {
        ReconcileError::unexpected("talking to the REST gateway", error)
    }
}

/// Total from a `Content-Range` header: `0-9/10`, `*/0`.
pub fn parse_content_range(value: &str) -> Option<i64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse().ok()
}

fn error_code(body: &str) -> Option<String> {
    serde_json::from_str::<Value>(body)
        .ok()?
        .get("code")?
        .as_str()
        .map(str::to_owned)
}

fn is_missing_table(body: &str) -> bool {
    error_code(body).is_some_and(|code| MISSING_TABLE_CODES.contains(&code.as_str()))
}

/// `HTTP 409 Conflict: <message> (<code>)`, falling back to the raw body.
pub fn error_detail(status: StatusCode, body: &str) -> String {
    let parsed = serde_json::from_str::<Value>(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|v| v.get("message"))
        .and_then(Value::as_str);
    match (message, parsed.as_ref().and_then(|v| v.get("code")).and_then(Value::as_str)) {
        (Some(message), Some(code)) => format!("HTTP {status}: {message} ({code})"),
        (Some(message), None) => format!("HTTP {status}: {message}"),
        _ if body.trim().is_empty() => format!("HTTP {status}"),
        _ => format!("HTTP {status}: {}", body.trim()),
    }
}

/// Map the response to a single-row insert.
pub fn outcome_for_status(status: StatusCode, body: &str) -> InsertOutcome {
    let code = error_code(body);
    if status.is_success() {
        return InsertOutcome::Inserted;
    }
    let detail = error_detail(status, body);
    if status == StatusCode::CONFLICT || code.as_deref() == Some("23505") {
        return InsertOutcome::Skipped(SkipReason::Duplicate { detail });
    }
    let rejected = matches!(
        status,
        StatusCode::BAD_REQUEST | StatusCode::FORBIDDEN | StatusCode::UNPROCESSABLE_ENTITY
    ) || code
        .as_deref()
        .is_some_and(|c| c.starts_with("23") || c.starts_with("22") || c == "42501");
    if rejected {
        InsertOutcome::Failed(FailureKind::Rejected, detail)
    } else {
        InsertOutcome::Failed(FailureKind::Server, detail)
    }
}

#[async_trait]
impl Channel for RestChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Rest
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn inspect(&mut self, schema: &TableSchema) -> ReconcileResult<Option<TableState>> {
        Ok(self.count(&schema.name).await?.map(|row_count| TableState {
            row_count,
            columns: None,
            has_unique_key: None,
        }))
    }

    async fn existing_keys(&mut self, schema: &TableSchema) -> ReconcileResult<HashSet<NaturalKey>> {
        if schema.unique_key.is_empty() {
            return Ok(HashSet::new());
        }
        let select = schema.unique_key.join(",");
        let mut keys = HashSet::new();
        let mut start: i64 = 0;

        loop {
            let request = self
                .client
                .get(self.table_url(&schema.name))
                .query(&[("select", select.as_str()), ("order", "id.asc")])
                .header("Range-Unit", "items")
                .header(header::RANGE, format!("{start}-{}", start + KEY_PAGE_SIZE - 1))
                .header("Prefer", "count=exact");
            let (rows, total) = self.fetch_page(request, "reading existing keys").await?;
            let fetched = rows.len() as i64;
            keys.extend(
                rows.iter()
                    .map(|row| NaturalKey::from_columns(row, &schema.unique_key)),
            );
            start += fetched;
            tracing::debug!(start, ?total, "Read a page of existing keys");

            // Without a total, keep going until an empty page.
            let done = fetched == 0 || total.is_some_and(|total| start >= total);
            if done {
                break;
            }
        }
        Ok(keys)
    }

    async fn insert(&mut self, schema: &TableSchema, record: &NewProperty) -> InsertOutcome {
        let request = self
            .client
            .post(self.table_url(&schema.name))
            .header("Prefer", "return=representation")
            .json(&[record]);
        match request.send().await {
            Ok(resp) => {
                let status = resp.status();
                let body = body_text(resp).await;
                outcome_for_status(status, &body)
            }
            Err(e) => InsertOutcome::Failed(FailureKind::Server, e.to_string()),
        }
    }

    async fn row_count(&mut self, schema: &TableSchema) -> ReconcileResult<i64> {
        self.count(&schema.name).await?.ok_or_else(|| {
            ReconcileError::unexpected(
                "counting rows",
                format!("table '{}' is no longer visible", schema.name),
            )
        })
    }

    async fn sample(&mut self, schema: &TableSchema, limit: usize) -> ReconcileResult<Vec<Property>> {
        let limit = limit.to_string();
        let request = self.read_as_anon(
            self.client
                .get(self.table_url(&schema.name))
                .query(&[
                    ("select", "*"),
                    ("order", "created_at.asc.nullslast,id.asc"),
                    ("limit", limit.as_str()),
                ]),
        )?;
        let rows = self.fetch_rows(request, "fetching sample rows").await?;
        rows.into_iter()
            .map(|row| {
                serde_json::from_value(Value::Object(row))
                    .map_err(|e| ReconcileError::unexpected("decoding sample rows", e))
            })
            .collect()
    }
}

//! The REST channel against a local stand-in for the hosted gateway.
//!
//! The stand-in speaks just enough HTTP/1.1 and PostgREST to answer the
//! channel: exact counts in `Content-Range`, `Range` paging capped at
//! `max_rows`, single-row inserts, missing tables and rejected keys. Every
//! request is recorded so the tests can check headers and paging.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use homestead_common::config::Configuration;
use homestead_common::error::ReconcileError;
use homestead_common::models::{NaturalKey, NewProperty};
use homestead_db::rest::RestChannel;
use homestead_db::{Backend, Channel, PolicySet, SkipReason, TableSchema, reconcile};
use reqwest::StatusCode;
use serde_json::{Map, Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use url::Url;
use uuid::Uuid;

const SERVICE_KEY: &str = "service-key";
const ANON_KEY: &str = "anon-key";

// ── Gateway stand-in ────────────────────────────────────────

#[derive(Debug, Clone)]
struct Recorded {
    method: String,
    target: String,
    headers: HashMap<String, String>,
}

impl Recorded {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    fn query(&self) -> HashMap<String, String> {
        let url = Url::parse(&format!("http://gateway{}", self.target)).unwrap();
        url.query_pairs().into_owned().collect()
    }
}

struct Gateway {
    table: bool,
    rows: Vec<Map<String, Value>>,
    max_rows: usize,
    /// Answer every request with this status, as for a bad API key.
    reject_with: Option<u16>,
    /// Answer every insert with a unique violation.
    conflict_on_insert: bool,
    requests: Vec<Recorded>,
}

type Response = (u16, Vec<(&'static str, String)>, String);

impl Gateway {
    fn new(rows: Vec<Map<String, Value>>) -> Self {
        Self {
            table: true,
            rows,
            max_rows: 1000,
            reject_with: None,
            conflict_on_insert: false,
            requests: Vec::new(),
        }
    }

    fn respond(&mut self, request: &Recorded, body: &str) -> Response {
        if let Some(status) = self.reject_with {
            return (status, Vec::new(), json!({"message": "Invalid API key"}).to_string());
        }
        if !self.table {
            let body = json!({
                "code": "PGRST205",
                "message": "Could not find the table 'public.properties' in the schema cache"
            });
            return (404, Vec::new(), body.to_string());
        }
        match request.method.as_str() {
            "GET" => self.select(request),
            "POST" => self.insert(body),
            _ => (405, Vec::new(), String::new()),
        }
    }

    fn select(&self, request: &Recorded) -> Response {
        let query = request.query();
        let total = self.rows.len();
        let counted = request
            .header("prefer")
            .is_some_and(|p| p.contains("count=exact"));
        let total_text = if counted { total.to_string() } else { "*".into() };

        let limit = query.get("limit").and_then(|l| l.parse::<usize>().ok());
        let (start, mut end) = match request.header("range").and_then(|r| r.split_once('-')) {
            Some((a, b)) => (a.parse::<usize>().unwrap(), b.parse::<usize>().unwrap() + 1),
            None => (0, limit.unwrap_or(total)),
        };
        if start > total {
            return (416, vec![("content-range", format!("*/{total_text}"))], "[]".into());
        }
        end = end.min(total).min(start + self.max_rows);
        if limit == Some(0) {
            end = start;
        }

        let columns: Option<Vec<&str>> = query
            .get("select")
            .filter(|s| s.as_str() != "*")
            .map(|s| s.split(',').collect());
        let page: Vec<Value> = self.rows[start..end]
            .iter()
            .map(|row| match &columns {
                Some(columns) => Value::Object(
                    row.iter()
                        .filter(|(k, _)| columns.contains(&k.as_str()))
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                ),
                None => Value::Object(row.clone()),
            })
            .collect();

        let range = if end > start {
            format!("{start}-{}/{total_text}", end - 1)
        } else {
            format!("*/{total_text}")
        };
        let status = if end - start < total && !page.is_empty() { 206 } else { 200 };
        (status, vec![("content-range", range)], Value::Array(page).to_string())
    }

    fn insert(&mut self, body: &str) -> Response {
        if self.conflict_on_insert {
            let body = json!({
                "code": "23505",
                "message": "duplicate key value violates unique constraint \"properties_title_location_key\""
            });
            return (409, Vec::new(), body.to_string());
        }
        let records: Vec<Map<String, Value>> = serde_json::from_str(body).unwrap();
        let mut created = Vec::new();
        for mut record in records {
            let id = Uuid::from_u128(self.rows.len() as u128 + 1);
            record.insert("id".into(), json!(id.to_string()));
            self.rows.push(record.clone());
            created.push(Value::Object(record));
        }
        (201, Vec::new(), Value::Array(created).to_string())
    }
}

async fn read_request(socket: &mut TcpStream) -> Option<(Recorded, String)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split(' ');
    let method = request_line.next()?.to_owned();
    let target = request_line.next()?.to_owned();
    let headers: HashMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_owned()))
        .collect();

    let length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    while buf.len() < header_end + length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let end = buf.len().min(header_end + length);
    let body = String::from_utf8_lossy(&buf[header_end..end]).into_owned();

    Some((
        Recorded {
            method,
            target,
            headers,
        },
        body,
    ))
}

/// Serve `gateway` on a local port; returns the base URL and the shared state.
async fn serve(gateway: Gateway) -> (String, Arc<Mutex<Gateway>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let state = Arc::new(Mutex::new(gateway));
    let shared = Arc::clone(&state);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let Some((request, body)) = read_request(&mut socket).await else {
                continue;
            };
            let (status, headers, payload) = {
                let mut gateway = shared.lock().unwrap();
                let response = gateway.respond(&request, &body);
                gateway.requests.push(request);
                response
            };

            let reason = StatusCode::from_u16(status)
                .ok()
                .and_then(|s| s.canonical_reason())
                .unwrap_or("");
            let mut head = format!(
                "HTTP/1.1 {status} {reason}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n",
                payload.len()
            );
            for (name, value) in headers {
                head.push_str(&format!("{name}: {value}\r\n"));
            }
            head.push_str("\r\n");
            let _ = socket.write_all(head.as_bytes()).await;
            let _ = socket.write_all(payload.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });

    (base, state)
}

// ── Fixtures ────────────────────────────────────────────────

fn config(base: &str) -> Configuration {
    let mut config = Configuration::default();
    config.rest.url = Some(base.to_owned());
    config.rest.service_role_key = Some(SERVICE_KEY.into());
    config.rest.anon_key = Some(ANON_KEY.into());
    config.rest.timeout_secs = 5;
    config
}

fn seeds(n: usize) -> Vec<NewProperty> {
    (1..=n)
        .map(|i| NewProperty {
            title: format!("Căn hộ {i}"),
            price: 850_000_000 * i as i64,
            location: format!("Phường {i}, Vũng Tàu"),
            bedrooms: 2,
            bathrooms: 1,
            area: 60 + i as i32,
            image_url: format!("https://images.example.com/{i}.jpg"),
            description: None,
            kind: "Căn hộ".into(),
            status: "Có sẵn".into(),
        })
        .collect()
}

/// Stored rows for `records`, as the gateway would return them.
fn stored(records: &[NewProperty]) -> Vec<Map<String, Value>> {
    records
        .iter()
        .enumerate()
        .map(|(i, record)| {
            let mut row = serde_json::to_value(record)
                .unwrap()
                .as_object()
                .unwrap()
                .clone();
            row.insert("id".into(), json!(Uuid::from_u128(i as u128 + 1).to_string()));
            row
        })
        .collect()
}

fn requests(state: &Arc<Mutex<Gateway>>, method: &str) -> Vec<Recorded> {
    state
        .lock()
        .unwrap()
        .requests
        .iter()
        .filter(|r| r.method == method)
        .cloned()
        .collect()
}

// ── Tests ───────────────────────────────────────────────────

#[tokio::test]
async fn existing_keys_read_every_page() {
    let records = seeds(3);
    let mut gateway = Gateway::new(stored(&records));
    gateway.max_rows = 2;
    let (base, state) = serve(gateway).await;

    let target = config(&base).rest_target().unwrap();
    let mut channel = RestChannel::connect(&target).unwrap();
    let keys = channel
        .existing_keys(&TableSchema::properties("properties"))
        .await
        .unwrap();

    assert_eq!(keys.len(), 3);
    assert!(keys.contains(&NaturalKey(vec![
        records[2].title.clone(),
        records[2].location.clone()
    ])));

    let ranges: Vec<String> = requests(&state, "GET")
        .iter()
        .filter(|r| r.query().get("select").map(String::as_str) == Some("title,location"))
        .map(|r| r.header("range").unwrap_or_default().to_owned())
        .collect();
    assert_eq!(ranges, vec!["0-999", "2-1001"]);
}

#[tokio::test]
async fn rerun_skips_rows_beyond_the_first_page() {
    let records = seeds(3);
    let mut gateway = Gateway::new(stored(&records));
    gateway.max_rows = 2;
    let (base, state) = serve(gateway).await;

    let report = reconcile(
        &Backend::Rest,
        &config(&base),
        &TableSchema::properties("properties"),
        &PolicySet::admin_writes(),
        &records,
    )
    .await
    .unwrap();

    assert_eq!(report.rows_inserted, 0);
    assert_eq!(report.rows_skipped, 3);
    assert!(
        report
            .skips
            .iter()
            .all(|(_, reason)| *reason == SkipReason::AlreadyPresent)
    );
    assert_eq!(report.final_count, 3);
    assert!(requests(&state, "POST").is_empty());
    assert_eq!(state.lock().unwrap().rows.len(), 3);
}

#[tokio::test]
async fn missing_table_is_reported_with_the_script() {
    let mut gateway = Gateway::new(Vec::new());
    gateway.table = false;
    let (base, state) = serve(gateway).await;

    let err = reconcile(
        &Backend::Rest,
        &config(&base),
        &TableSchema::properties("properties"),
        &PolicySet::admin_writes(),
        &seeds(2),
    )
    .await
    .unwrap_err();

    match &err {
        ReconcileError::TableMissing { table, ddl } => {
            assert_eq!(table, "properties");
            assert!(ddl.contains("CREATE TABLE IF NOT EXISTS public.\"properties\" ("));
        }
        other => panic!("expected TableMissing, got {other:?}"),
    }
    let gets = requests(&state, "GET");
    assert!(!gets.is_empty());
    assert_eq!(gets[0].header("prefer"), Some("count=exact"));
    assert_eq!(gets[0].header("apikey"), Some(SERVICE_KEY));
    assert!(requests(&state, "POST").is_empty());
}

#[tokio::test]
async fn rejected_key_is_a_connection_error() {
    let mut gateway = Gateway::new(Vec::new());
    gateway.reject_with = Some(401);
    let (base, _state) = serve(gateway).await;

    let err = reconcile(
        &Backend::Rest,
        &config(&base),
        &TableSchema::properties("properties"),
        &PolicySet::admin_writes(),
        &seeds(1),
    )
    .await
    .unwrap_err();

    match &err {
        ReconcileError::Connection { message, .. } => {
            assert!(message.contains("authentication rejected"), "{message}");
            assert!(message.contains("Invalid API key"), "{message}");
        }
        other => panic!("expected Connection, got {other:?}"),
    }
    assert_eq!(err.error_code(), "CONNECTION_ERROR");
}

#[tokio::test]
async fn conflict_on_insert_is_a_skip() {
    let mut gateway = Gateway::new(Vec::new());
    gateway.conflict_on_insert = true;
    let (base, state) = serve(gateway).await;

    let report = reconcile(
        &Backend::Rest,
        &config(&base),
        &TableSchema::properties("properties"),
        &PolicySet::admin_writes(),
        &seeds(2),
    )
    .await
    .unwrap();

    assert_eq!((report.rows_inserted, report.rows_skipped), (0, 2));
    match &report.skips[0] {
        (1, SkipReason::Duplicate { detail }) => {
            assert!(detail.starts_with("HTTP 409 Conflict"), "{detail}");
            assert!(detail.ends_with("(23505)"), "{detail}");
        }
        other => panic!("expected a duplicate skip, got {other:?}"),
    }

    let posts = requests(&state, "POST");
    assert_eq!(posts.len(), 2);
    assert!(
        posts
            .iter()
            .all(|p| p.header("prefer") == Some("return=representation"))
    );
}

#[tokio::test]
async fn inserts_with_the_service_key_and_samples_with_the_anon_key() {
    let records = seeds(4);
    let (base, state) = serve(Gateway::new(Vec::new())).await;

    let report = reconcile(
        &Backend::Rest,
        &config(&base),
        &TableSchema::properties("properties"),
        &PolicySet::admin_writes(),
        &records,
    )
    .await
    .unwrap();

    assert_eq!(report.rows_inserted, 4);
    assert_eq!(report.rows_skipped, 0);
    assert_eq!(report.final_count, 4);
    assert_eq!(report.sample.len(), 3);
    assert_eq!(report.sample[0].title, records[0].title);
    assert_eq!(report.sample[0].price, records[0].price);

    let posts = requests(&state, "POST");
    assert_eq!(posts.len(), 4);
    assert!(posts.iter().all(|p| p.header("apikey") == Some(SERVICE_KEY)));

    let sample = requests(&state, "GET")
        .into_iter()
        .find(|r| {
            let query = r.query();
            query.contains_key("order") && query.get("select").map(String::as_str) == Some("*")
        })
        .expect("sample request");
    assert_eq!(sample.header("apikey"), Some(ANON_KEY));
    assert_eq!(sample.header("authorization"), Some("Bearer anon-key"));
    assert_eq!(sample.query().get("limit").map(String::as_str), Some("3"));
}

#[tokio::test]
async fn truncated_error_body_is_reported() {
    // Declares a longer body than it sends, then hangs up.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            if read_request(&mut socket).await.is_none() {
                continue;
            }
            let head = "HTTP/1.1 500 Internal Server Error\r\ncontent-type: application/json\r\ncontent-length: 200\r\nconnection: close\r\n\r\n{\"message\":";
            let _ = socket.write_all(head.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });

    let err = reconcile(
        &Backend::Rest,
        &config(&base),
        &TableSchema::properties("properties"),
        &PolicySet::admin_writes(),
        &seeds(1),
    )
    .await
    .unwrap_err();

    match &err {
        ReconcileError::UnexpectedServer { context, detail } => {
            assert_eq!(context, "counting rows");
            assert!(detail.starts_with("HTTP 500 Internal Server Error"), "{detail}");
            assert!(detail.contains("<response body unreadable"), "{detail}");
        }
        other => panic!("expected UnexpectedServer, got {other:?}"),
    }
}

//! Optional OTLP/HTTP log export for run-log records.
//!
//! Records are handed to a background thread over a bounded channel and
//! POSTed as OTLP/JSON to `{endpoint}/v1/logs`. Export never blocks or fails
//! the run: a full queue drops the record, and after the first failed request
//! the exporter reports one warning and discards everything that follows.

use std::env;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::DateTime;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

pub const ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
pub const FALLBACK_ENDPOINT_ENV: &str = "PLANRUN_OTLP_ENDPOINT";
pub const HEADERS_ENV: &str = "OTEL_EXPORTER_OTLP_HEADERS";

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);
const QUEUE_CAPACITY: usize = 256;
const SERVICE_NAME: &str = "planrun";

/// Record fields mapped onto OTLP log-record fields instead of attributes.
const MAPPED_FIELDS: [&str; 5] = ["event", "level", "timestamp", "trace_id", "span_id"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtlpConfig {
    pub endpoint: String,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
}

impl OtlpConfig {
    /// Read the exporter settings from the environment; `None` disables export.
    pub fn from_env() -> Option<Self> {
        let endpoint = env::var(ENDPOINT_ENV)
            .ok()
            .or_else(|| env::var(FALLBACK_ENDPOINT_ENV).ok());
        Self::from_values(endpoint, env::var(HEADERS_ENV).ok())
    }

    pub fn from_values(endpoint: Option<String>, headers: Option<String>) -> Option<Self> {
        let endpoint = endpoint?.trim().trim_end_matches('/').to_string();
        if endpoint.is_empty() {
            return None;
        }
        Some(Self {
            endpoint,
            headers: headers.as_deref().map(parse_headers).unwrap_or_default(),
            timeout: REQUEST_TIMEOUT,
        })
    }

    pub fn logs_url(&self) -> String {
        format!("{}/v1/logs", self.endpoint)
    }
}

/// Parse `k=v,k2=v2` header lists; malformed pairs are skipped.
pub fn parse_headers(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Handle to the background export thread.
pub struct OtlpExporter {
    tx: Option<SyncSender<Value>>,
    handle: Option<JoinHandle<()>>,
    failure: Arc<Mutex<Option<String>>>,
    failure_reported: bool,
    dropped: usize,
}

impl OtlpExporter {
    pub fn start(config: OtlpConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("build OTLP http client")?;
        let (tx, rx) = mpsc::sync_channel::<Value>(QUEUE_CAPACITY);
        let failure = Arc::new(Mutex::new(None));
        let thread_failure = Arc::clone(&failure);
        let handle = thread::Builder::new()
            .name("planrun-otlp".to_string())
            .spawn(move || export_loop(&client, &config, &rx, &thread_failure))
            .context("spawn OTLP export thread")?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
            failure,
            failure_reported: false,
            dropped: 0,
        })
    }

    /// Queue one record; returns `false` if it was dropped.
    pub fn export(&mut self, record: &Value) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(record.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped += 1;
                false
            }
        }
    }

    /// The first export failure, returned only once.
    pub fn take_failure(&mut self) -> Option<String> {
        if self.failure_reported {
            return None;
        }
        let failure = self.failure.lock().ok()?.clone()?;
        self.failure_reported = true;
        Some(failure)
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

impl Drop for OtlpExporter {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("OTLP export thread panicked");
        }
    }
}

fn export_loop(
    client: &reqwest::blocking::Client,
    config: &OtlpConfig,
    rx: &Receiver<Value>,
    failure: &Mutex<Option<String>>,
) {
    let url = config.logs_url();
    let mut failed = false;
    for record in rx {
        if failed {
            continue;
        }
        let mut request = client.post(&url).json(&to_otlp_payload(&record));
        for (key, value) in &config.headers {
            request = request.header(key, value);
        }
        let result = request
            .send()
            .and_then(reqwest::blocking::Response::error_for_status);
        match result {
            Ok(_) => debug!("exported run-log record"),
            Err(err) => {
                failed = true;
                let message = format!("OTLP export to {url} failed: {err}");
                warn!(%message, "telemetry export disabled for the rest of the run");
                if let Ok(mut slot) = failure.lock() {
                    *slot = Some(message);
                }
            }
        }
    }
}

/// Wrap one run-log record as an OTLP/JSON `ExportLogsServiceRequest`.
pub fn to_otlp_payload(record: &Value) -> Value {
    let field = |key: &str| record.get(key).and_then(Value::as_str).unwrap_or_default();
    let level = field("level");
    let time_unix_nano = DateTime::parse_from_rfc3339(field("timestamp"))
        .ok()
        .and_then(|ts| ts.timestamp_nanos_opt())
        .unwrap_or_default();

    let attributes: Vec<Value> = record
        .as_object()
        .map(|map| {
            map.iter()
                .filter(|(key, _)| !MAPPED_FIELDS.contains(&key.as_str()))
                .map(|(key, value)| json!({"key": key, "value": any_value(value)}))
                .collect()
        })
        .unwrap_or_default();

    json!({
        "resourceLogs": [{
            "resource": {
                "attributes": [
                    {"key": "service.name", "value": {"stringValue": SERVICE_NAME}}
                ]
            },
            "scopeLogs": [{
                "scope": {"name": SERVICE_NAME, "version": env!("CARGO_PKG_VERSION")},
                "logRecords": [{
                    "timeUnixNano": time_unix_nano.to_string(),
                    "severityText": level.to_ascii_uppercase(),
                    "severityNumber": severity_number(level),
                    "body": {"stringValue": field("event")},
                    "traceId": field("trace_id"),
                    "spanId": field("span_id"),
                    "attributes": attributes,
                }]
            }]
        }]
    })
}

fn severity_number(level: &str) -> u8 {
    match level {
        "debug" => 5,
        "info" => 9,
        "warn" => 13,
        "error" => 17,
        _ => 0,
    }
}

fn any_value(value: &Value) -> Value {
    match value {
        Value::String(s) => json!({"stringValue": s}),
        Value::Bool(b) => json!({"boolValue": b}),
        Value::Number(n) => match n.as_i64() {
            Some(i) => json!({"intValue": i.to_string()}),
            None => json!({"doubleValue": n.as_f64().unwrap_or_default()}),
        },
        Value::Null => json!({}),
        Value::Array(_) | Value::Object(_) => {
            let mut map = Map::new();
            map.insert("stringValue".to_string(), Value::String(value.to_string()));
            Value::Object(map)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_is_normalized_and_optional() {
        assert_eq!(OtlpConfig::from_values(None, None), None);
        assert_eq!(OtlpConfig::from_values(Some("  ".to_string()), None), None);
        let config = OtlpConfig::from_values(
            Some("http://collector:4318/".to_string()),
            Some("authorization=Bearer abc, x-team = infra ,broken".to_string()),
        )
        .expect("config");
        assert_eq!(config.logs_url(), "http://collector:4318/v1/logs");
        assert_eq!(
            config.headers,
            vec![
                ("authorization".to_string(), "Bearer abc".to_string()),
                ("x-team".to_string(), "infra".to_string()),
            ]
        );
    }

    #[test]
    fn payload_maps_record_fields() {
        let record = json!({
            "event": "step_started",
            "level": "warn",
            "timestamp": "2025-01-01T00:00:01Z",
            "trace_id": "0af7651916cd43dd8448eb211c80319c",
            "span_id": "b7ad6b7169203331",
            "group_id": "step-01@1",
            "attempt": 2,
            "ok": false
        });
        let payload = to_otlp_payload(&record);
        let log = &payload["resourceLogs"][0]["scopeLogs"][0]["logRecords"][0];
        assert_eq!(log["body"]["stringValue"], "step_started");
        assert_eq!(log["severityNumber"], 13);
        assert_eq!(log["timeUnixNano"], "1735689601000000000");
        assert_eq!(log["traceId"], "0af7651916cd43dd8448eb211c80319c");

        let attrs = log["attributes"].as_array().expect("attributes");
        assert!(attrs.contains(&json!({"key": "attempt", "value": {"intValue": "2"}})));
        assert!(attrs.contains(&json!({"key": "ok", "value": {"boolValue": false}})));
        assert!(!attrs.iter().any(|a| a["key"] == "event"));
    }

    /// Nothing listens on the discard port, so the first record fails and is
    /// reported exactly once.
    #[test]
    fn unreachable_endpoint_reports_one_failure() {
        let config = OtlpConfig {
            endpoint: "http://127.0.0.1:9".to_string(),
            headers: Vec::new(),
            timeout: Duration::from_millis(500),
        };
        let mut exporter = OtlpExporter::start(config).expect("start");
        assert!(exporter.export(&json!({"event": "a"})));
        assert!(exporter.export(&json!({"event": "b"})));

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        let mut failure = None;
        while failure.is_none() && std::time::Instant::now() < deadline {
            failure = exporter.take_failure();
            thread::sleep(Duration::from_millis(20));
        }
        assert!(failure.expect("failure").contains("OTLP export"));
        assert_eq!(exporter.take_failure(), None);
    }
}

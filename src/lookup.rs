//! External lookup service client
//!
//! One paid API call per distinct key. The [`LookupService`] trait is the
//! seam the runner talks through, so tests substitute a scripted service and
//! never touch the network.
//!
//! The client is deliberately infallible at the signature level: every
//! transport and protocol failure is folded into a [`LookupReply`] variant.
//! The runner turns those variants into per-row outcomes; it never has to
//! unwind a job because one call timed out.

use crate::config::LookupConfig;
use crate::error::Result;
use crate::types::{FieldValue, LookupReply, Record};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

/// Anything that can resolve a lookup key to a classified reply.
#[async_trait]
pub trait LookupService: Send + Sync {
    /// Resolve one key. Must classify every failure into a reply variant.
    async fn lookup(&self, key: &str) -> LookupReply;
}

/// HTTP client for the production lookup API.
///
/// Sends `{"token": ..., "query": key, "type": ...}` as JSON POST and decodes
/// the reply envelope: `status`/`message` for errors, `counts` plus a `data`
/// array of matched records on success.
pub struct LookupClient {
    http: reqwest::Client,
    config: LookupConfig,
}

impl LookupClient {
    /// Build a client with the configured per-call timeout baked in.
    pub fn new(config: LookupConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.call_timeout)
            .build()?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl LookupService for LookupClient {
    async fn lookup(&self, key: &str) -> LookupReply {
        let body = json!({
            "token": self.config.api_token,
            "query": key,
            "type": self.config.query_kind,
        });

        let response = match self.http.post(&self.config.api_url).json(&body).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                tracing::warn!(key, "lookup call timed out");
                return LookupReply::Failed {
                    message: "request timed out".to_string(),
                };
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "lookup transport error");
                return LookupReply::Failed {
                    message: "network error".to_string(),
                };
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::PAYMENT_REQUIRED {
            tracing::warn!(key, "lookup service reports balance exhausted");
            return LookupReply::QuotaExhausted;
        }

        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(key, error = %e, "failed to read lookup response body");
                return LookupReply::Failed {
                    message: "unreadable response".to_string(),
                };
            }
        };

        // Some deployments report exhaustion as 200 with an error body
        if text.to_lowercase().contains("insufficient balance") {
            tracing::warn!(key, "lookup service reports balance exhausted");
            return LookupReply::QuotaExhausted;
        }

        if !status.is_success() {
            tracing::warn!(key, status = %status, "lookup returned unexpected status");
            return LookupReply::Failed {
                message: format!("unexpected status {status}"),
            };
        }

        let envelope: ReplyEnvelope = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(key, error = %e, "lookup response does not decode");
                return LookupReply::Failed {
                    message: "malformed response".to_string(),
                };
            }
        };

        if !envelope.status {
            let message = envelope
                .message
                .unwrap_or_else(|| "unknown service error".to_string());
            tracing::warn!(key, message, "lookup service reported an error");
            return LookupReply::Failed { message };
        }

        let records = parse_records(&envelope.data);
        if envelope.counts == 0 || records.is_empty() {
            LookupReply::NoMatches
        } else {
            LookupReply::Matches(records)
        }
    }
}

/// Wire envelope of a lookup reply.
///
/// Error replies carry `status: false` plus a `message`; successful replies
/// carry `status: true`, a match count and the `data` record array.
#[derive(Deserialize)]
struct ReplyEnvelope {
    #[serde(default)]
    status: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    counts: u64,
    #[serde(default)]
    data: Vec<Value>,
}

/// Decode the `data` array into records, preserving field order.
///
/// Each record's `table_name` names the dataset it came from and is lifted
/// into [`Record::source`] rather than kept as a field. Null and empty
/// values are dropped at this boundary so downstream formatting never sees
/// them.
fn parse_records(data: &[Value]) -> Vec<Record> {
    data.iter().filter_map(parse_record).collect()
}

/// Dataset name used when a record arrives without a `table_name`
const UNKNOWN_SOURCE: &str = "unknown";

fn parse_record(item: &Value) -> Option<Record> {
    let obj = item.as_object()?;
    let mut source = UNKNOWN_SOURCE.to_string();
    let mut fields = Vec::new();
    for (name, value) in obj {
        if name == "table_name" {
            if let Some(s) = value.as_str() {
                let s = s.trim();
                if !s.is_empty() {
                    source = s.to_string();
                }
            }
            continue;
        }
        if let Some(field) = parse_field(value) {
            if !field.is_empty() {
                fields.push((name.clone(), field));
            }
        }
    }
    if fields.is_empty() {
        None
    } else {
        Some(Record { source, fields })
    }
}

fn parse_field(value: &Value) -> Option<FieldValue> {
    match value {
        Value::String(s) => Some(FieldValue::Text(s.trim().to_string())),
        Value::Number(n) => Some(FieldValue::Text(n.to_string())),
        Value::Bool(b) => Some(FieldValue::Text(b.to_string())),
        Value::Array(items) => {
            let rendered: Vec<String> = items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.trim().to_string()),
                    Value::Number(n) => Some(n.to_string()),
                    Value::Bool(b) => Some(b.to_string()),
                    _ => None,
                })
                .filter(|s| !s.is_empty())
                .collect();
            Some(FieldValue::List(rendered))
        }
        _ => None,
    }
}

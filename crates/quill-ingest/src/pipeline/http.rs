//! HTTP search index backend.
//!
//! Implements [`SearchIndex`] against a hosted search service with a
//! mixed-operation batch endpoint: one `POST /1/indexes/{index}/batch`
//! call carries both upserts and deletes, and the response reports a
//! per-item status so a single rejected record does not fail the batch.
//!
//! Failure classification drives the writer's retry policy:
//!
//! - 429 and 5xx responses, timeouts, and connect errors are transient.
//! - 401/403 (bad credentials) and 404 (index does not exist) are fatal.
//! - Other 4xx responses are permanent for the request they reject.

use super::index::{BatchReport, DroppedRecord, SearchIndex};
use crate::{Error, Result};
use async_trait::async_trait;
use quill_core::Record;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Configuration for the HTTP search index backend.
#[derive(Debug, Clone)]
pub struct HttpIndexConfig {
    /// Base URL of the search service, without a trailing slash.
    pub base_url: String,

    /// Application id sent as `x-application-id`.
    pub application_id: String,

    /// Write API key sent as `x-api-key`.
    pub api_key: String,

    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for HttpIndexConfig {
    fn default() -> Self {
        Self {
            base_url: "https://search.example.com".to_string(),
            application_id: String::new(),
            api_key: String::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Hosted search index reached over HTTP.
pub struct HttpSearchIndex {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSearchIndex {
    /// Create a new backend client.
    pub fn new(config: HttpIndexConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "x-application-id",
            HeaderValue::from_str(&config.application_id)
                .map_err(|_| Error::Config("invalid application id".to_string()))?,
        );
        let mut api_key = HeaderValue::from_str(&config.api_key)
            .map_err(|_| Error::Config("invalid api key".to_string()))?;
        api_key.set_sensitive(true);
        headers.insert("x-api-key", api_key);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn send_batch(&self, index: &str, operations: Vec<Operation<'_>>) -> Result<BatchReport> {
        let upsert_ids: HashSet<&str> = operations
            .iter()
            .filter(|op| op.action == "updateObject")
            .map(|op| op.body.object_id)
            .collect();

        let url = format!("{}/1/indexes/{}/batch", self.base_url, index);
        let response = self
            .client
            .post(&url)
            .json(&BatchRequest {
                requests: &operations,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    Error::IndexTransient(e.to_string())
                } else {
                    Error::Http(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let parsed: BatchResponse = response.json().await?;
        Ok(build_report(&parsed, &upsert_ids, operations.len()))
    }
}

#[async_trait]
impl SearchIndex for HttpSearchIndex {
    fn supports_mixed_batch(&self) -> bool {
        true
    }

    async fn upsert_batch(&self, index: &str, records: &[Record]) -> Result<BatchReport> {
        self.apply_batch(index, records, &[]).await
    }

    async fn delete_batch(&self, index: &str, ids: &[String]) -> Result<BatchReport> {
        self.apply_batch(index, &[], ids).await
    }

    async fn apply_batch(
        &self,
        index: &str,
        upserts: &[Record],
        deletes: &[String],
    ) -> Result<BatchReport> {
        let operations = build_operations(upserts, deletes);
        if operations.is_empty() {
            return Ok(BatchReport::default());
        }
        self.send_batch(index, operations).await
    }
}

#[derive(Serialize)]
struct BatchRequest<'a> {
    requests: &'a [Operation<'a>],
}

#[derive(Serialize)]
struct Operation<'a> {
    action: &'static str,
    body: OperationBody<'a>,
}

#[derive(Serialize)]
struct OperationBody<'a> {
    #[serde(rename = "objectID")]
    object_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<u64>,
}

#[derive(Deserialize)]
struct BatchResponse {
    #[serde(default)]
    results: Vec<ItemResult>,
}

#[derive(Deserialize)]
struct ItemResult {
    #[serde(rename = "objectID")]
    object_id: String,
    #[serde(default = "default_item_status")]
    status: u16,
    #[serde(default)]
    error: Option<String>,
}

fn default_item_status() -> u16 {
    200
}

fn build_operations<'a>(upserts: &'a [Record], deletes: &'a [String]) -> Vec<Operation<'a>> {
    let mut operations = Vec::with_capacity(upserts.len() + deletes.len());
    for record in upserts {
        operations.push(Operation {
            action: "updateObject",
            body: OperationBody {
                object_id: &record.id,
                channel_id: Some(&record.channel_id),
                content: Some(&record.content),
                version: Some(record.version),
            },
        });
    }
    for id in deletes {
        operations.push(Operation {
            action: "deleteObject",
            body: OperationBody {
                object_id: id,
                channel_id: None,
                content: None,
                version: None,
            },
        });
    }
    operations
}

fn build_report(
    response: &BatchResponse,
    upsert_ids: &HashSet<&str>,
    operation_count: usize,
) -> BatchReport {
    let mut report = BatchReport::default();

    if response.results.is_empty() {
        // Older service versions omit per-item results on full success
        report.upserted = upsert_ids.len();
        report.deleted = operation_count - upsert_ids.len();
        return report;
    }

    for item in &response.results {
        if item.status >= 400 {
            report.dropped.push(DroppedRecord {
                id: item.object_id.clone(),
                reason: item
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("status {}", item.status)),
            });
        } else if upsert_ids.contains(item.object_id.as_str()) {
            report.upserted += 1;
        } else {
            report.deleted += 1;
        }
    }
    report
}

fn classify_status(status: StatusCode, body: &str) -> Error {
    let detail = format!("{}: {}", status, body.chars().take(200).collect::<String>());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::IndexFatal(detail),
        StatusCode::NOT_FOUND => Error::IndexFatal(detail),
        StatusCode::TOO_MANY_REQUESTS => Error::IndexTransient(detail),
        s if s.is_server_error() => Error::IndexTransient(detail),
        _ => Error::IndexPermanent(detail),
    }
}

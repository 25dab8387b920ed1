//! PostgREST-compatible HTTP target store.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde_json::Value as JsonValue;
use tracing::{debug, info_span, Instrument};

use crate::{RetryDisposition, StoreError, StoreRow, TargetStore};

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

fn store_error_from_reqwest(err: reqwest::Error) -> StoreError {
    match classify_reqwest_error(&err) {
        RetryDisposition::Retryable => StoreError::Transient(err.to_string()),
        RetryDisposition::NonRetryable if err.is_decode() => StoreError::Decode(err.to_string()),
        RetryDisposition::NonRetryable => StoreError::Rejected(err.to_string()),
    }
}

/// `in.(..)` filter with every id double-quoted, so commas and parentheses
/// inside ids survive.
pub fn in_filter(ids: &[String]) -> String {
    let quoted = ids
        .iter()
        .map(|id| format!("\"{}\"", id.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(",");
    format!("in.({quoted})")
}

/// Total from a `Content-Range` header such as `0-24/3573` or `*/12`.
pub fn content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

#[derive(Debug, Clone)]
pub struct RestStoreConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for RestStoreConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            api_key: None,
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestStore {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl RestStore {
    pub fn new(config: RestStoreConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
        })
    }

    fn request(&self, method: Method, entity: &str) -> RequestBuilder {
        let mut req = self
            .client
            .request(method, format!("{}/{}", self.base_url, entity));
        if let Some(key) = &self.api_key {
            req = req.header("apikey", key).bearer_auth(key);
        }
        req
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, StoreError> {
        let resp = req.send().await.map_err(store_error_from_reqwest)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let url = resp.url().to_string();
        let body = resp.text().await.unwrap_or_default();
        let message = format!("http status {} for {url}: {body}", status.as_u16());
        Err(match classify_status(status) {
            RetryDisposition::Retryable => StoreError::Transient(message),
            RetryDisposition::NonRetryable => StoreError::Rejected(message),
        })
    }
}

#[async_trait]
impl TargetStore for RestStore {
    fn describe(&self) -> String {
        format!("rest:{}", self.base_url)
    }

    async fn fetch_page(
        &self,
        entity: &str,
        key_column: &str,
        columns: &[String],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<StoreRow>, StoreError> {
        let span = info_span!("rest_fetch_page", entity, offset, limit);
        async {
            let req = self.request(Method::GET, entity).query(&[
                ("select", columns.join(",")),
                ("order", format!("{key_column}.asc")),
                ("offset", offset.to_string()),
                ("limit", limit.to_string()),
            ]);
            let rows: Vec<JsonValue> = self
                .send(req)
                .await?
                .json()
                .await
                .map_err(|e| StoreError::Decode(e.to_string()))?;
            debug!(rows = rows.len(), "page fetched");
            rows.into_iter()
                .map(|row| match row {
                    JsonValue::Object(map) => Ok(map),
                    other => Err(StoreError::Decode(format!("expected row object, got {other}"))),
                })
                .collect()
        }
        .instrument(span)
        .await
    }

    async fn upsert(&self, entity: &str, key_column: &str, rows: &[StoreRow]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let req = self
            .request(Method::POST, entity)
            .query(&[("on_conflict", key_column)])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(rows);
        self.send(req).await?;
        Ok(rows.len() as u64)
    }

    async fn update_by_ids(
        &self,
        entity: &str,
        key_column: &str,
        ids: &[String],
        values: &StoreRow,
    ) -> Result<u64, StoreError> {
        if ids.is_empty() || values.is_empty() {
            return Ok(0);
        }
        let req = self
            .request(Method::PATCH, entity)
            .query(&[(key_column, in_filter(ids))])
            .header("Prefer", "return=minimal,count=exact")
            .json(values);
        let resp = self.send(req).await?;
        let total = resp
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(content_range_total);
        Ok(total.unwrap_or(ids.len() as u64))
    }
}
